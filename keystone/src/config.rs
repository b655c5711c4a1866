// src/config.rs

/// Read side of every connection. One request must fit.
pub const READ_BUF_SIZE: usize = 8 * 1024;
/// Serialized responses must fit here; larger ones become a canned 500.
pub const WRITE_BUF_SIZE: usize = 8 * 1024;
/// Listen backlog handed to the kernel.
pub const ACCEPT_BACKLOG: i32 = 128;
/// Submission/completion queue depth per worker ring.
pub const URING_ENTRIES: u32 = 256;
/// Hard cap on requests served over a single keep-alive connection.
pub const MAX_KEEPALIVE_REQUESTS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub connections_per_worker: usize,
    pub bpf_affinity: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            connections_per_worker: 1024,
            bpf_affinity: true,
        }
    }
}
