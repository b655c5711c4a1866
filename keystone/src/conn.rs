// src/conn.rs
use crate::bridge::ScriptBridge;
use crate::config;
use crate::error::KeystoneError;
use crate::exchange::ExchangeState;
use crate::metrics::WorkerStats;
use crate::parser::{self, ParseOutcome, Request};
use crate::ring::RingBuffer;
use crate::router::{ParamArray, Router};
use bumpalo::Bump;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Free = 0,
    Reading = 1,
    Parsing = 2,
    Matching = 3,
    Invoking = 4,
    Serializing = 5,
    Writing = 6,
    Closing = 7,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::Free
    }
}

/// What the worker must submit next for this connection. Recv and send
/// never overlap: a connection has at most one operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Io {
    Recv,
    Send,
    Close,
}

enum Plan {
    NeedMore,
    Canned { status: u16, keep_alive: bool },
    Scripted { keep_alive: bool },
}

/// One accepted socket: read ring, write buffer, per-request arena and
/// param captures. The buffers are boxed so their addresses survive slab
/// moves while a kernel operation references them.
pub struct Conn {
    pub fd: i32,
    pub state: ConnState,
    pub ring: RingBuffer,
    pub write_buf: Box<[u8]>,
    pub write_len: usize,
    pub write_sent: usize,
    pub params: ParamArray,
    pub arena: Bump,
    pub requests_served: u32,
    close_after_write: bool,
    pending_consume: usize,
}

impl Conn {
    pub fn new() -> Self {
        Self {
            fd: -1,
            state: ConnState::Free,
            ring: RingBuffer::new(config::READ_BUF_SIZE),
            write_buf: vec![0u8; config::WRITE_BUF_SIZE].into_boxed_slice(),
            write_len: 0,
            write_sent: 0,
            params: ParamArray::new(),
            arena: Bump::new(),
            requests_served: 0,
            close_after_write: false,
            pending_consume: 0,
        }
    }

    /// Recycle this slot for a freshly accepted socket.
    pub fn open(&mut self, fd: i32) {
        self.fd = fd;
        self.state = ConnState::Reading;
        self.ring.reset();
        self.arena.reset();
        self.params.clear();
        self.write_len = 0;
        self.write_sent = 0;
        self.requests_served = 0;
        self.close_after_write = false;
        self.pending_consume = 0;
    }

    /// A recv finished: zero is the peer's EOF, negative an errno.
    pub fn on_recv_complete(
        &mut self,
        res: i32,
        router: &Router,
        bridge: &ScriptBridge,
        stats: &WorkerStats,
    ) -> Io {
        if res <= 0 {
            if res < 0 {
                debug!(
                    "recv failed on fd {}: {}",
                    self.fd,
                    std::io::Error::from_raw_os_error(-res)
                );
            }
            self.state = ConnState::Closing;
            return Io::Close;
        }
        self.ring.commit_write(res as usize);
        self.process(router, bridge, stats)
    }

    /// A send finished. Short writes resume from the unsent tail; a fully
    /// flushed response either closes or recycles the connection, and a
    /// pipelined request already sitting in the ring is served without
    /// another recv.
    pub fn on_send_complete(
        &mut self,
        res: i32,
        router: &Router,
        bridge: &ScriptBridge,
        stats: &WorkerStats,
    ) -> Io {
        if res <= 0 {
            self.state = ConnState::Closing;
            return Io::Close;
        }
        stats.on_flush(res as usize);
        self.write_sent += res as usize;
        if self.write_sent < self.write_len {
            return Io::Send;
        }

        if self.close_after_write {
            self.state = ConnState::Closing;
            return Io::Close;
        }

        self.reset_between_requests();
        if self.ring.readable().is_empty() {
            self.state = ConnState::Reading;
            Io::Recv
        } else {
            self.process(router, bridge, stats)
        }
    }

    /// recv -> parse -> match -> invoke -> serialize, all within one
    /// completion dispatch. Only recv and send suspend.
    fn process(&mut self, router: &Router, bridge: &ScriptBridge, stats: &WorkerStats) -> Io {
        self.state = ConnState::Parsing;
        self.params.clear();

        let mut consumed_now = 0usize;
        let plan = {
            let buf = self.ring.readable();
            match parser::parse(buf) {
                ParseOutcome::Incomplete => {
                    if self.ring.is_full() {
                        // Request larger than the read buffer.
                        Plan::Canned {
                            status: 400,
                            keep_alive: false,
                        }
                    } else {
                        Plan::NeedMore
                    }
                }
                ParseOutcome::Invalid => Plan::Canned {
                    status: 400,
                    keep_alive: false,
                },
                ParseOutcome::Complete { req, consumed } => {
                    consumed_now = consumed;
                    stats.on_request();
                    let keep_alive = request_keep_alive(&req)
                        && self.requests_served + 1 < config::MAX_KEEPALIVE_REQUESTS;

                    self.state = ConnState::Matching;
                    match router.lookup(req.method, req.path, &mut self.params) {
                        None => Plan::Canned {
                            status: 404,
                            keep_alive,
                        },
                        Some(handler) => {
                            self.state = ConnState::Invoking;
                            bridge.begin_request(&req, &self.params, &self.arena);
                            match bridge.invoke(handler) {
                                Ok(()) => Plan::Scripted { keep_alive },
                                Err(e) => {
                                    stats.on_handler_error();
                                    warn!("handler failed on fd {}: {}", self.fd, e);
                                    bridge.finish_request();
                                    // A broken ref closes; a script error
                                    // leaves the connection usable.
                                    let ka = matches!(e, KeystoneError::Script(_)) && keep_alive;
                                    Plan::Canned {
                                        status: 500,
                                        keep_alive: ka,
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        self.state = ConnState::Serializing;
        match plan {
            Plan::NeedMore => {
                self.state = ConnState::Reading;
                Io::Recv
            }
            Plan::Canned { status, keep_alive } => {
                if consumed_now > 0 {
                    self.pending_consume = consumed_now;
                    self.requests_served += 1;
                }
                self.stage_canned(status, keep_alive)
            }
            Plan::Scripted { keep_alive } => {
                self.pending_consume = consumed_now;
                self.requests_served += 1;
                let written = {
                    let state = bridge.state().borrow();
                    serialize_response(&mut self.write_buf, &state)
                };
                bridge.finish_request();
                match written {
                    Some(n) => {
                        self.write_len = n;
                        self.write_sent = 0;
                        self.close_after_write = !keep_alive;
                        self.state = ConnState::Writing;
                        Io::Send
                    }
                    None => {
                        warn!(
                            "response on fd {} exceeds the {} byte write buffer",
                            self.fd,
                            config::WRITE_BUF_SIZE
                        );
                        self.stage_canned(500, false)
                    }
                }
            }
        }
    }

    fn stage_canned(&mut self, status: u16, keep_alive: bool) -> Io {
        self.write_len = serialize_canned(&mut self.write_buf, status);
        self.write_sent = 0;
        self.close_after_write = !keep_alive;
        self.state = ConnState::Writing;
        Io::Send
    }

    /// Reset discipline between keep-alive requests: consume the served
    /// request's bytes (the ring snaps to zero when that drains it),
    /// reset the arena retaining capacity, clear captures and cursors.
    /// The socket stays open.
    fn reset_between_requests(&mut self) {
        self.ring.consume(self.pending_consume);
        self.pending_consume = 0;
        self.arena.reset();
        self.params.clear();
        self.write_len = 0;
        self.write_sent = 0;
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP/1.1 defaults to keep-alive; 1.0 opts in, either opts out.
fn request_keep_alive(req: &Request<'_>) -> bool {
    let mut keep_alive = req.minor_version >= 1;
    for i in 0..req.header_count {
        let (name, value) = req.headers[i];
        if name.eq_ignore_ascii_case("connection") {
            if value.eq_ignore_ascii_case(b"close") {
                keep_alive = false;
            } else if value.eq_ignore_ascii_case(b"keep-alive") {
                keep_alive = true;
            }
        }
    }
    keep_alive
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) -> Option<()> {
        if self.pos + bytes.len() > self.buf.len() {
            return None;
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Some(())
    }

    fn put_usize(&mut self, mut n: usize) -> Option<()> {
        let mut digits = [0u8; 20];
        let len = if n == 0 {
            digits[0] = b'0';
            1
        } else {
            let mut i = 0;
            while n > 0 {
                digits[i] = b'0' + (n % 10) as u8;
                n /= 10;
                i += 1;
            }
            digits[..i].reverse();
            i
        };
        self.put(&digits[..len])
    }
}

/// Status line, script headers, derived `Content-Length`, blank line,
/// body. Returns the serialized length, or `None` when the response
/// cannot fit the write buffer.
fn write_response(
    buf: &mut [u8],
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> Option<usize> {
    let status = if (100..=599).contains(&status) {
        status
    } else {
        500
    };

    let mut w = Writer { buf, pos: 0 };
    w.put(b"HTTP/1.1 ")?;
    w.put_usize(status as usize)?;
    w.put(b" ")?;
    w.put(reason(status).as_bytes())?;
    w.put(b"\r\n")?;

    for (name, value) in headers {
        // Content-Length is always derived from the body below.
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        w.put(name.as_bytes())?;
        w.put(b": ")?;
        w.put(value.as_bytes())?;
        w.put(b"\r\n")?;
    }

    w.put(b"Content-Length: ")?;
    w.put_usize(body.len())?;
    w.put(b"\r\n\r\n")?;
    w.put(body)?;
    Some(w.pos)
}

fn serialize_response(buf: &mut [u8], state: &ExchangeState) -> Option<usize> {
    let body = unsafe { state.response_body().as_bytes() };
    write_response(buf, state.status, state.response_headers(), body)
}

fn serialize_canned(buf: &mut [u8], status: u16) -> usize {
    // Reason-phrase bodies always fit an 8 KiB buffer.
    write_response(buf, status, &[], reason(status).as_bytes()).unwrap_or(0)
}
