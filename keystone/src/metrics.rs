// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

// One counter per cache line so a hot shard never bounces a neighbour's
// line while bumping its own numbers.
#[repr(align(64))]
struct Counter(AtomicU64);

impl Counter {
    const fn zero() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    fn sub(&self, n: u64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// What one worker has done since startup, recorded at the pipeline's
/// edges: sockets admitted and released, requests answered, response
/// bytes flushed, handlers that failed their protected call.
pub struct WorkerStats {
    open_connections: Counter,
    requests: Counter,
    flushed_bytes: Counter,
    handler_errors: Counter,
}

impl WorkerStats {
    pub const fn new() -> Self {
        Self {
            open_connections: Counter::zero(),
            requests: Counter::zero(),
            flushed_bytes: Counter::zero(),
            handler_errors: Counter::zero(),
        }
    }

    pub fn on_connection_open(&self) {
        self.open_connections.add(1);
    }

    pub fn on_connection_close(&self) {
        self.open_connections.sub(1);
    }

    pub fn on_request(&self) {
        self.requests.add(1);
    }

    pub fn on_flush(&self, bytes: usize) {
        self.flushed_bytes.add(bytes as u64);
    }

    pub fn on_handler_error(&self) {
        self.handler_errors.add(1);
    }

    /// Consistent-enough view for reporting; individual counters are
    /// read relaxed, so a snapshot taken mid-request may be skewed by a
    /// request or two.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open_connections: self.open_connections.get(),
            requests: self.requests.get(),
            flushed_bytes: self.flushed_bytes.get(),
            handler_errors: self.handler_errors.get(),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time totals, summable across the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub open_connections: u64,
    pub requests: u64,
    pub flushed_bytes: u64,
    pub handler_errors: u64,
}

impl StatsSnapshot {
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.open_connections += other.open_connections;
        self.requests += other.requests;
        self.flushed_bytes += other.flushed_bytes;
        self.handler_errors += other.handler_errors;
    }
}
