//! Worker process creation.
//!
//! Each task gets its own `fork(2)`ed process and its own result channel.
//! The child never returns into the caller: it runs the task, writes one
//! envelope and leaves through `_exit`, so none of the parent's destructors,
//! `atexit` handlers or buffered output run a second time in the copy.
//!
//! Each worker leads a new process group. Signals the pool sends to a worker
//! go to the whole group, which includes any processes the task started.

use super::codec;
use super::guard;
use super::ipc::{self, PipeFd};
use super::protocol::{Envelope, TaskFailure};
use super::relay;
use super::signals::{EXIT_CHANNEL_ERROR, EXIT_FAILURE, EXIT_SUCCESS, EXIT_TIMEOUT};
use crate::config::{ChildStdio, PoolConfig};
use crate::error::{PoolError, Result};
use nix::unistd::{ForkResult, Pid, fork, getpid, setpgid};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};

/// A freshly forked worker, as seen from the parent.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    /// Read end of the worker's result channel.
    pub channel: PipeFd,
}

/// Fork a worker that runs `task`.
///
/// Runs `before_fork` in the parent first, and `after_fork` in the child.
/// The parent-side `after_fork` call is left to the caller so that it happens
/// after the worker is registered.
pub fn fork_worker<T, F>(task: F, config: &PoolConfig) -> Result<Spawned>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let (reader, writer) = ipc::channel().map_err(PoolError::Spawn)?;

    if let Some(hook) = &config.before_fork {
        hook(getpid());
    }

    // SAFETY: the child branch never returns; it runs the task and `_exit`s.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            // Also set from the child; whichever runs first wins. Fails only
            // if the child is already gone.
            let _ = setpgid(child, child);
            drop(writer);
            Ok(Spawned {
                pid: child,
                channel: reader,
            })
        }
        Ok(ForkResult::Child) => {
            drop(reader);
            run_child(task, writer, config)
        }
        Err(e) => Err(PoolError::Spawn(io::Error::from(e))),
    }
}

/// Body of a worker process.
fn run_child<T, F>(task: F, channel: PipeFd, config: &PoolConfig) -> !
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    relay::reset_in_child();

    if let Some(hook) = &config.after_fork {
        let pid = getpid();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(pid))) {
            let mut failure = TaskFailure::from_panic(payload);
            failure.message = format!("after_fork hook failed: {}", failure.message);
            deliver::<T>(channel, Envelope::Failure(failure), EXIT_FAILURE);
        }
    }

    if config.child_stdio == ChildStdio::Null {
        // Best effort: a worker that keeps the inherited streams still works.
        let _ = redirect_stdio_to_null();
    }

    let outcome = guard::run_guarded(task, config.child_timeout);
    let timed_out = outcome.timed_out();
    let envelope = outcome.into_envelope();
    let code = match &envelope {
        _ if timed_out => EXIT_TIMEOUT,
        Envelope::Success(_) => EXIT_SUCCESS,
        Envelope::Failure(_) => EXIT_FAILURE,
    };
    deliver(channel, envelope, code)
}

/// Write `envelope` to the channel and terminate the worker.
fn deliver<T: Serialize>(mut channel: PipeFd, envelope: Envelope<T>, code: i32) -> ! {
    let code = match codec::encode(&envelope) {
        Ok(bytes) => match channel.write_all(&bytes) {
            Ok(()) => code,
            Err(_) => EXIT_CHANNEL_ERROR,
        },
        // The payload itself could not be encoded; report that instead.
        Err(e) => {
            let failure: Envelope<()> = Envelope::Failure(TaskFailure::generic(format!(
                "task result could not be encoded: {}",
                e
            )));
            match codec::encode(&failure).map(|bytes| channel.write_all(&bytes)) {
                Ok(Ok(())) => EXIT_FAILURE,
                _ => EXIT_CHANNEL_ERROR,
            }
        }
    };
    drop(channel);
    // SAFETY: `_exit` terminates immediately without touching Rust state.
    unsafe { libc::_exit(code) }
}

fn redirect_stdio_to_null() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    nix::unistd::dup2_stdin(&null)?;
    nix::unistd::dup2_stdout(&null)?;
    nix::unistd::dup2_stderr(&null)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::signals::TerminationReason;
    use nix::sys::wait::waitpid;
    use serial_test::serial;

    fn collect(spawned: Spawned) -> (TerminationReason, Vec<u8>) {
        let Spawned { pid, mut channel } = spawned;
        let mut buf = Vec::new();
        while channel.read_chunk(&mut buf).unwrap() > 0 {}
        let status = waitpid(pid, None).unwrap();
        (status.into(), buf)
    }

    #[test]
    #[serial]
    fn test_child_delivers_success() {
        let config = PoolConfig::new().with_signal_relay(false);
        let spawned = fork_worker(|| Ok(vec![1u8, 2, 3]), &config).unwrap();
        let (status, bytes) = collect(spawned);

        assert_eq!(status, TerminationReason::Exited(EXIT_SUCCESS));
        let env: Envelope<Vec<u8>> = codec::decode(&bytes).unwrap();
        assert_eq!(env, Envelope::Success(vec![1, 2, 3]));
    }

    #[test]
    #[serial]
    fn test_child_delivers_failure() {
        let config = PoolConfig::new();
        let spawned =
            fork_worker(|| -> anyhow::Result<u8> { anyhow::bail!("no luck") }, &config).unwrap();
        let (status, bytes) = collect(spawned);

        assert_eq!(status, TerminationReason::Exited(EXIT_FAILURE));
        let env: Envelope<u8> = codec::decode(&bytes).unwrap();
        assert_eq!(env.into_result().unwrap_err().message, "no luck");
    }

    #[test]
    #[serial]
    fn test_child_timeout_exit_code() {
        let config = PoolConfig::new().child_timeout_secs(0.1);
        let spawned = fork_worker(
            || {
                std::thread::sleep(std::time::Duration::from_secs(5));
                Ok(())
            },
            &config,
        )
        .unwrap();
        let (status, bytes) = collect(spawned);

        assert_eq!(status, TerminationReason::Exited(EXIT_TIMEOUT));
        let env: Envelope<()> = codec::decode(&bytes).unwrap();
        assert!(env.into_result().unwrap_err().is_terminal());
    }

    #[test]
    #[serial]
    fn test_child_leads_its_own_group() {
        let config = PoolConfig::new();
        let spawned = fork_worker(|| Ok(nix::unistd::getpgrp().as_raw()), &config).unwrap();
        let pid = spawned.pid;
        let (status, bytes) = collect(spawned);

        assert!(status.is_success());
        let env: Envelope<i32> = codec::decode(&bytes).unwrap();
        assert_eq!(env, Envelope::Success(pid.as_raw()));
    }

    #[test]
    #[serial]
    fn test_child_stdio_null() {
        let config = PoolConfig::new().with_child_stdio(ChildStdio::Null);
        let spawned = fork_worker(
            || {
                println!("this goes nowhere");
                Ok(true)
            },
            &config,
        )
        .unwrap();
        let (status, _) = collect(spawned);
        assert!(status.is_success());
    }
}
