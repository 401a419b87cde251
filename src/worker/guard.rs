//! Deadline enforcement for a task running inside a worker.
//!
//! Without a deadline the task runs inline on the worker's main thread. With
//! one, it runs on a helper thread while the main thread waits on a channel;
//! if the deadline passes first, the worker reports a `Timeout` failure and
//! exits, which takes the stuck helper thread down with it.

use super::protocol::{Envelope, FailureKind, TaskFailure};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Terminal state of a guarded task.
#[derive(Debug)]
pub enum GuardOutcome<T> {
    /// The task returned (or panicked) before the deadline.
    Completed(Envelope<T>),
    /// The deadline passed while the task was still running.
    TimedOut(Envelope<T>),
}

impl<T> GuardOutcome<T> {
    pub fn into_envelope(self) -> Envelope<T> {
        match self {
            Self::Completed(env) | Self::TimedOut(env) => env,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Run `task`, converting errors and panics into failure envelopes.
pub fn run_guarded<T, F>(task: F, timeout: Option<Duration>) -> GuardOutcome<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let Some(limit) = timeout else {
        return GuardOutcome::Completed(run_caught(task));
    };

    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = thread::Builder::new()
        .name("procpool-task".to_string())
        .spawn(move || {
            // The receiver is gone only if the deadline already fired.
            let _ = tx.send(run_caught(task));
        });
    if let Err(e) = spawned {
        return GuardOutcome::Completed(Envelope::Failure(TaskFailure::generic(format!(
            "failed to start task thread: {}",
            e
        ))));
    }

    match rx.recv_timeout(limit) {
        Ok(env) => GuardOutcome::Completed(env),
        Err(mpsc::RecvTimeoutError::Timeout) => GuardOutcome::TimedOut(Envelope::Failure(
            TaskFailure::new(
                FailureKind::Timeout,
                format!("task exceeded deadline of {:?}", limit),
            ),
        )),
        // Sender dropped without sending: the thread died outside catch_unwind.
        Err(mpsc::RecvTimeoutError::Disconnected) => GuardOutcome::Completed(Envelope::Failure(
            TaskFailure::generic("task thread exited without a result"),
        )),
    }
}

fn run_caught<T, F>(task: F) -> Envelope<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => Envelope::from_result(result),
        Err(payload) => Envelope::Failure(TaskFailure::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::Break;
    use std::time::Instant;

    fn failure_kind<T>(outcome: GuardOutcome<T>) -> Option<FailureKind> {
        match outcome.into_envelope() {
            Envelope::Failure(f) => Some(f.kind),
            Envelope::Success(_) => None,
        }
    }

    #[test]
    fn test_inline_success() {
        let outcome = run_guarded(|| Ok(5), None);
        assert!(!outcome.timed_out());
        assert_eq!(outcome.into_envelope(), Envelope::Success(5));
    }

    #[test]
    fn test_inline_error_and_break() {
        let outcome = run_guarded(|| -> anyhow::Result<()> { anyhow::bail!("bad input") }, None);
        assert_eq!(failure_kind(outcome), Some(FailureKind::Generic));

        let outcome =
            run_guarded(|| -> anyhow::Result<()> { Err(Break::new("stop").into()) }, None);
        assert_eq!(failure_kind(outcome), Some(FailureKind::Break));
    }

    #[test]
    fn test_panic_is_caught() {
        let outcome = run_guarded(|| -> anyhow::Result<()> { panic!("kaboom") }, None);
        match outcome.into_envelope() {
            Envelope::Failure(f) => {
                assert_eq!(f.kind, FailureKind::Generic);
                assert!(f.message.contains("kaboom"));
            }
            Envelope::Success(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_completes_before_deadline() {
        let outcome = run_guarded(|| Ok("fast"), Some(Duration::from_secs(5)));
        assert!(!outcome.timed_out());
        assert_eq!(outcome.into_envelope(), Envelope::Success("fast"));
    }

    #[test]
    fn test_deadline_expires() {
        let start = Instant::now();
        let outcome = run_guarded(
            || {
                thread::sleep(Duration::from_secs(2));
                Ok(())
            },
            Some(Duration::from_millis(100)),
        );
        assert!(outcome.timed_out());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(failure_kind(outcome), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_panic_under_deadline() {
        let outcome = run_guarded(
            || -> anyhow::Result<()> { panic!("threaded kaboom") },
            Some(Duration::from_secs(5)),
        );
        assert!(!outcome.timed_out());
        assert_eq!(failure_kind(outcome), Some(FailureKind::Generic));
    }
}
