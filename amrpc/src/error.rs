//! Error types for amrpc.
//!
//! Only recoverable conditions are errors. Contract violations (misaligned
//! batches, out-of-range record indices, duplicate or stale completions)
//! panic where they are detected.

use std::fmt;

use crate::transport::TransportError;

/// amrpc operation errors.
#[derive(Debug)]
pub enum Error {
    /// The transport refused a send or a handler registration.
    Transport(TransportError),
    /// Worker id is outside `[0, nworkers)`.
    InvalidWorker { worker: usize, nworkers: usize },
    /// Invalid configuration.
    InvalidConfig(String),
    /// Counters cannot be reset while calls are outstanding.
    NotQuiescent { requested: u64, acknowledged: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::InvalidWorker { worker, nworkers } => {
                write!(f, "Invalid worker {}, only {} workers exist", worker, nworkers)
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::NotQuiescent {
                requested,
                acknowledged,
            } => write!(
                f,
                "Not quiescent: {} requested, {} acknowledged",
                requested, acknowledged
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

/// Result type for amrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
