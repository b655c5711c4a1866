// src/error.rs
use std::io;

/// Central error type for the Keystone engine.
#[derive(Debug)]
pub enum KeystoneError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error raised by the scripting interpreter (load or handler call).
    Script(mlua::Error),
    /// A route pattern was rejected at registration time.
    InvalidPattern(String),
    /// The affinity filter was asked to steer zero workers.
    InvalidWorkerCount,
    /// The generated classic BPF program exceeds the kernel instruction limit.
    BpfProgramTooLarge(usize),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeystoneError::Io(e) => write!(f, "I/O error: {}", e),
            KeystoneError::Script(e) => write!(f, "script error: {}", e),
            KeystoneError::InvalidPattern(msg) => write!(f, "invalid route pattern: {}", msg),
            KeystoneError::InvalidWorkerCount => write!(f, "worker count must be at least 1"),
            KeystoneError::BpfProgramTooLarge(n) => {
                write!(f, "BPF program of {} instructions exceeds the kernel limit", n)
            }
            KeystoneError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for KeystoneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeystoneError::Io(e) => Some(e),
            KeystoneError::Script(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KeystoneError {
    fn from(e: io::Error) -> Self {
        KeystoneError::Io(e)
    }
}

impl From<mlua::Error> for KeystoneError {
    fn from(e: mlua::Error) -> Self {
        KeystoneError::Script(e)
    }
}

pub type KeystoneResult<T> = Result<T, KeystoneError>;
