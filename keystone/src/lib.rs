// src/lib.rs
pub mod bpf;
pub mod bridge;
pub mod config;
pub mod conn;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod parser;
pub mod ring;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod uring;
pub mod view;
pub mod worker;

// Re-exports for users
pub use config::Config;
pub use error::{KeystoneError, KeystoneResult};
pub use router::{HandlerRef, Router};
pub use server::Server;
