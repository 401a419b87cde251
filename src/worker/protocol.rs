//! Envelope exchanged between a worker and the pool.
//!
//! A worker writes exactly one [`Envelope`] before it exits. Failures are
//! always carried as a [`TaskFailure`], whatever error the task produced, so
//! the parent never has to deserialize arbitrary error types.

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Any error or panic raised by the task.
    Generic,
    /// The task asked for a pool-wide abort by returning [`Break`].
    Break,
    /// The task did not finish before the child deadline.
    Timeout,
}

impl FailureKind {
    /// Break and Timeout abort the whole pool regardless of raise policy.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Break | Self::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "task failed"),
            Self::Break => write!(f, "task requested break"),
            Self::Timeout => write!(f, "task timed out"),
        }
    }
}

/// Transport-safe description of a task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Display text of each error in the source chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Worker that produced the failure; filled in by the parent on reap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            pid: None,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Generic, message)
    }

    /// Wrap an error returned by a task.
    ///
    /// A [`Break`] anywhere in the chain yields a `Break` failure, and an
    /// existing `TaskFailure` (from a nested pool) passes through as-is.
    /// Anything else keeps only its message text.
    pub fn from_error(err: anyhow::Error) -> Self {
        let passed_through = err.chain().find_map(|e| {
            e.downcast_ref::<TaskFailure>()
                .or_else(|| e.downcast_ref::<PoolError>().and_then(PoolError::task_failure))
        });
        if let Some(failure) = passed_through {
            return failure.clone();
        }
        if let Some(brk) = err.chain().find_map(|e| e.downcast_ref::<Break>()) {
            return Self::new(FailureKind::Break, brk.reason.clone());
        }

        let mut failure = Self::generic(err.to_string());
        failure.causes = err.chain().skip(1).map(|e| e.to_string()).collect();
        failure
    }

    /// Wrap the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::generic(format!("task panicked: {}", text))
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(pid) = self.pid {
            write!(f, " in worker {}", pid)?;
        }
        write!(f, ": {}", self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

/// Error a task returns to abort the whole pool on purpose.
///
/// ```
/// use procpool::Break;
///
/// let task = || -> anyhow::Result<u32> { Err(Break::new("found it").into()) };
/// assert!(task().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("break: {reason}")]
pub struct Break {
    pub reason: String,
}

impl Break {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Message written by a worker on its result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Envelope<T> {
    Success(T),
    Failure(TaskFailure),
}

impl<T> Envelope<T> {
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(TaskFailure::from_error(err)),
        }
    }

    pub fn into_result(self) -> Result<T, TaskFailure> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}
