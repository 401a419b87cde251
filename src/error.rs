//! Error types for procpool.

use crate::worker::TaskFailure;
use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Configuration(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for worker {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error(transparent)]
    Task(#[from] TaskFailure),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// The escalated task failure, if this error carries one.
    pub fn task_failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Task(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
