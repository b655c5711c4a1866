// src/worker.rs
use crate::bridge::ScriptBridge;
use crate::config::{self, Config};
use crate::conn::{ConnState, Io};
use crate::error::KeystoneResult;
use crate::metrics::WorkerStats;
use crate::router::Router;
use crate::slab::ConnSlab;
use crate::syscalls;
use crate::uring::{self, Completion, EventLoop};
use crate::{bpf, parser};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One shard: event loop, router, interpreter, connection pool and a
/// member socket of the REUSEPORT group. Workers share nothing after
/// startup except the one-shot BPF-ready flag.
pub struct Worker {
    id: usize,
    config: Config,
    total_workers: usize,
    stats: Arc<WorkerStats>,
    bpf_ready: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Config,
        total_workers: usize,
        stats: Arc<WorkerStats>,
        bpf_ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            config,
            total_workers,
            stats,
            bpf_ready,
        }
    }

    pub fn run(self, script: &str) -> KeystoneResult<()> {
        // Every worker owns a full interpreter and loads the script
        // itself; route tables are never shared.
        let bridge = ScriptBridge::new()?;
        bridge.load_script(script)?;
        let mut router = Router::new();
        for spec in bridge.drain_routes() {
            router.add_route(&spec.method, &spec.pattern, spec.handler)?;
        }

        let listen_fd = syscalls::create_bound_socket(&self.config.host, self.config.port)?;
        self.bpf_barrier(listen_fd);
        syscalls::listen(listen_fd, config::ACCEPT_BACKLOG)?;

        info!(
            "worker {} listening on {}:{} (max {} headers, {} connections)",
            self.id,
            self.config.host,
            self.config.port,
            parser::MAX_HEADERS,
            self.config.connections_per_worker,
        );

        let mut evloop = EventLoop::new(config::URING_ENTRIES)?;
        let mut slab = ConnSlab::new(self.config.connections_per_worker);
        evloop.submit_accept(listen_fd, uring::token(uring::OP_ACCEPT, 0))?;

        let mut completions: Vec<Completion> = Vec::with_capacity(config::URING_ENTRIES as usize);
        loop {
            evloop.wait(&mut completions)?;
            for i in 0..completions.len() {
                let c = completions[i];
                self.dispatch(c, listen_fd, &mut evloop, &mut slab, &router, &bridge)?;
            }
        }
    }

    /// Worker 0 attaches the affinity filter to its bound socket and
    /// releases the pool-wide flag; everyone else spins on that flag
    /// before calling listen. Without this ordering the kernel could
    /// balance early connections unfiltered.
    fn bpf_barrier(&self, listen_fd: i32) {
        if self.id == 0 {
            if self.config.bpf_affinity {
                match bpf::attach_reuseport_filter(listen_fd, self.total_workers as u32) {
                    Ok(()) => debug!(
                        "reuseport affinity filter attached for {} workers",
                        self.total_workers
                    ),
                    Err(e) => warn!(
                        "could not attach reuseport filter ({}); continuing without connection affinity",
                        e
                    ),
                }
            }
            self.bpf_ready.store(true, Ordering::Release);
        } else {
            while !self.bpf_ready.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    fn dispatch(
        &self,
        c: Completion,
        listen_fd: i32,
        evloop: &mut EventLoop,
        slab: &mut ConnSlab,
        router: &Router,
        bridge: &ScriptBridge,
    ) -> KeystoneResult<()> {
        match uring::token_op(c.user_data) {
            uring::OP_ACCEPT => {
                if c.result < 0 {
                    warn!(
                        "accept failed on worker {}: {}",
                        self.id,
                        io::Error::from_raw_os_error(-c.result)
                    );
                } else {
                    self.admit(c.result, evloop, slab)?;
                }
                // The acceptor is always re-armed.
                evloop.submit_accept(listen_fd, uring::token(uring::OP_ACCEPT, 0))?;
            }
            uring::OP_RECV => {
                let idx = uring::token_idx(c.user_data);
                let action = match slab.get_mut(idx) {
                    Some(conn) if conn.state != ConnState::Free => {
                        conn.on_recv_complete(c.result, router, bridge, &self.stats)
                    }
                    _ => return Ok(()),
                };
                self.apply(action, idx, evloop, slab)?;
            }
            uring::OP_SEND => {
                let idx = uring::token_idx(c.user_data);
                let action = match slab.get_mut(idx) {
                    Some(conn) if conn.state != ConnState::Free => {
                        conn.on_send_complete(c.result, router, bridge, &self.stats)
                    }
                    _ => return Ok(()),
                };
                self.apply(action, idx, evloop, slab)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn admit(&self, fd: i32, evloop: &mut EventLoop, slab: &mut ConnSlab) -> KeystoneResult<()> {
        let _ = syscalls::set_nodelay(fd);
        match slab.allocate(fd) {
            Some(idx) => {
                self.stats.on_connection_open();
                if let Some(conn) = slab.get_mut(idx) {
                    let buf = conn.ring.writable();
                    evloop.submit_recv(fd, buf, uring::token(uring::OP_RECV, idx))?;
                }
            }
            None => {
                warn!(
                    "worker {} connection pool exhausted; rejecting fd {}",
                    self.id, fd
                );
                syscalls::close(fd);
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        action: Io,
        idx: usize,
        evloop: &mut EventLoop,
        slab: &mut ConnSlab,
    ) -> KeystoneResult<()> {
        match action {
            Io::Recv => {
                if let Some(conn) = slab.get_mut(idx) {
                    let fd = conn.fd;
                    let buf = conn.ring.writable();
                    evloop.submit_recv(fd, buf, uring::token(uring::OP_RECV, idx))?;
                }
            }
            Io::Send => {
                if let Some(conn) = slab.get_mut(idx) {
                    let fd = conn.fd;
                    let range = conn.write_sent..conn.write_len;
                    evloop.submit_send(fd, &conn.write_buf[range], uring::token(uring::OP_SEND, idx))?;
                }
            }
            Io::Close => {
                if let Some(conn) = slab.get(idx) {
                    syscalls::close(conn.fd);
                }
                slab.free(idx);
                self.stats.on_connection_close();
            }
        }
        Ok(())
    }
}
