//! Termination analysis for reaped workers.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// Exit code of a worker that delivered a success envelope.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code of a worker that delivered a failure envelope.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code of a worker that could not encode or write its envelope.
pub const EXIT_CHANNEL_ERROR: i32 = 70;
/// Exit code of a worker whose task hit the child deadline.
pub const EXIT_TIMEOUT: i32 = 124;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Anything `waitpid` can report that is not a termination.
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(EXIT_SUCCESS))
    }

    /// Whether the worker was killed before it could report.
    pub fn is_signaled(&self) -> bool {
        matches!(self, Self::Signaled(_))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_SUCCESS) => "exited successfully".to_string(),
            Self::Exited(EXIT_FAILURE) => "exited after reporting a failure".to_string(),
            Self::Exited(EXIT_TIMEOUT) => "exited after its deadline".to_string(),
            Self::Exited(EXIT_CHANNEL_ERROR) => "exited without delivering a result".to_string(),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
