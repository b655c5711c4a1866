// src/server.rs
use crate::config::Config;
use crate::error::{KeystoneError, KeystoneResult};
use crate::metrics::{StatsSnapshot, WorkerStats};
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// The pool: one worker per core, each a complete vertical slice. The
/// only cross-thread word after startup is the BPF-ready flag.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn bind(host: &str, port: u16) -> Self {
        Self::new(Config {
            host: host.to_string(),
            port,
            ..Config::default()
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Spawn the workers and join them. Workers run until the process
    /// dies; a join completing means that worker failed, and the first
    /// failure is surfaced so the CLI can exit nonzero.
    pub fn serve(self, script: &str) -> KeystoneResult<()> {
        let workers = self.config.workers.max(1);
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let bpf_ready = Arc::new(AtomicBool::new(false));
        let script = Arc::new(script.to_string());

        if let Err(e) = ctrlc::set_handler(|| {
            info!("received SIGINT; shutting down");
            std::process::exit(0);
        }) {
            error!("could not install SIGINT handler: {}", e);
        }

        let stats: Vec<Arc<WorkerStats>> = (0..workers)
            .map(|_| Arc::new(WorkerStats::new()))
            .collect();
        spawn_stats_reporter(stats.clone());

        info!(
            "starting {} workers on {}:{}",
            workers, self.config.host, self.config.port
        );

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let config = self.config.clone();
            let script = Arc::clone(&script);
            let flag = Arc::clone(&bpf_ready);
            let worker_stats = Arc::clone(&stats[id]);
            let core = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[id % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("keystone-worker-{}", id))
                .spawn(move || -> Result<(), String> {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    let worker = Worker::new(id, config, workers, worker_stats, Arc::clone(&flag));
                    let result = worker.run(&script).map_err(|e| e.to_string());
                    // Release the barrier even on a failed start so
                    // sibling workers never spin forever.
                    flag.store(true, Ordering::Release);
                    if let Err(ref e) = result {
                        error!("worker {} exited: {}", id, e);
                    }
                    result
                })
                .map_err(KeystoneError::Io)?;
            handles.push(handle);
        }

        let mut first_failure: Option<String> = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                Err(_) => {
                    if first_failure.is_none() {
                        first_failure = Some("worker thread panicked".to_string());
                    }
                }
            }
        }

        match first_failure {
            Some(e) => Err(KeystoneError::Other(e)),
            None => Ok(()),
        }
    }
}

fn spawn_stats_reporter(stats: Vec<Arc<WorkerStats>>) {
    thread::Builder::new()
        .name("keystone-stats".to_string())
        .spawn(move || loop {
            thread::sleep(Duration::from_secs(5));
            let mut total = StatsSnapshot::default();
            for s in &stats {
                total.merge(&s.snapshot());
            }
            info!(
                "active={} requests={} bytes_out={} handler_errors={}",
                total.open_connections, total.requests, total.flushed_bytes, total.handler_errors
            );
        })
        .ok();
}
