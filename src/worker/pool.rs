//! Bounded pool of forked workers.
//!
//! The pool runs on a single control thread. It blocks only in [`Pool::wait`],
//! which polls every live result channel until one reaches EOF and then reaps
//! that worker. Reading while waiting means a worker never stalls on a full
//! pipe, and reaping by pid means pools never steal each other's children.
//!
//! A worker's process group is only signaled while its leader is unreaped,
//! so the group id cannot have been handed to an unrelated process.

use super::codec;
use super::ipc::PipeFd;
use super::protocol::{Envelope, FailureKind, TaskFailure};
use super::relay::{self, LivePids, RelayRegistration};
use super::signals::TerminationReason;
use super::spawn::{Spawned, fork_worker};
use crate::config::{PoolConfig, RaisePolicy};
use crate::error::{PoolError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::os::unix::io::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// How long dropped workers get to exit after SIGTERM before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// One entry of the results list: a task's value, or a failure the pool
/// recorded instead of raising.
pub type Outcome<T> = std::result::Result<T, TaskFailure>;

/// A worker collected by [`Pool::wait`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reaped<T> {
    pub pid: Pid,
    pub status: TerminationReason,
    /// `None` when the worker died without delivering a readable envelope.
    pub outcome: Option<Outcome<T>>,
}

/// A live worker as tracked by the parent.
struct WorkerHandle {
    pid: Pid,
    channel: PipeFd,
    received: Vec<u8>,
    started: Instant,
}

impl WorkerHandle {
    fn new(spawned: Spawned) -> Self {
        Self {
            pid: spawned.pid,
            channel: spawned.channel,
            received: Vec::new(),
            started: Instant::now(),
        }
    }
}

/// Bounded set of worker processes returning values of type `T`.
///
/// ```no_run
/// use procpool::{Pool, PoolConfig};
///
/// let mut pool = Pool::new(PoolConfig::new().with_max_concurrency(4))?;
/// for i in 0..16u64 {
///     pool.submit(move || Ok(i * i))?;
/// }
/// let squares: Vec<u64> = pool.wait_all()?.iter().flatten().copied().collect();
/// assert_eq!(squares.len(), 16);
/// # Ok::<(), procpool::PoolError>(())
/// ```
pub struct Pool<T> {
    config: PoolConfig,
    live: Vec<WorkerHandle>,
    live_pids: Arc<LivePids>,
    results: Vec<Outcome<T>>,
    _relay: Option<RelayRegistration>,
}

impl<T> Pool<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Build a pool, registering it with the signal relay if configured.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let live_pids = Arc::new(LivePids::new());
        let relay = if config.signal_relay {
            Some(relay::register(live_pids.clone())?)
        } else {
            None
        };

        debug!(
            max_concurrency = config.max_concurrency,
            child_timeout = ?config.child_timeout,
            raise_policy = ?config.raise_policy,
            "Worker pool created"
        );

        Ok(Self {
            config,
            live: Vec::new(),
            live_pids,
            results: Vec::new(),
            _relay: relay,
        })
    }

    /// Start `task` in a new worker and return its pid.
    ///
    /// Blocks in [`wait`](Self::wait) while the pool is full, so any failure
    /// escalated by a finishing worker is returned from here instead.
    pub fn submit<F>(&mut self, task: F) -> Result<Pid>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        while self.live.len() >= self.config.max_concurrency {
            self.wait()?;
        }

        let spawned = fork_worker(task, &self.config)?;
        let pid = spawned.pid;
        self.live.push(WorkerHandle::new(spawned));
        self.live_pids.insert(pid);

        if let Some(hook) = &self.config.after_fork {
            hook(pid);
        }

        debug!(pid = pid.as_raw(), live = self.live.len(), "Worker spawned");
        Ok(pid)
    }

    /// Wait for any one worker to finish and collect its result.
    ///
    /// Returns `Ok(None)` when no worker is live. Break and Timeout failures,
    /// and generic failures under [`RaisePolicy::Raise`], signal the remaining
    /// workers with SIGTERM and are returned as [`PoolError::Task`].
    pub fn wait(&mut self) -> Result<Option<Reaped<T>>> {
        if self.live.is_empty() {
            return Ok(None);
        }

        let index = self.next_finished()?;
        let handle = self.live.remove(index);
        let decoded = codec::decode::<Envelope<T>>(&handle.received);

        // The deadline left whatever the task started running.
        if let Ok(Envelope::Failure(failure)) = &decoded
            && failure.kind == FailureKind::Timeout
        {
            let _ = relay::signal_group(handle.pid, Signal::SIGKILL);
        }

        self.live_pids.remove(handle.pid);
        let status = reap(handle.pid)?;

        debug!(
            pid = handle.pid.as_raw(),
            %status,
            bytes = handle.received.len(),
            elapsed_ms = handle.started.elapsed().as_millis(),
            "Worker reaped"
        );

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                if status.is_signaled() {
                    debug!(pid = handle.pid.as_raw(), %status, "Worker terminated without a result");
                } else {
                    warn!(
                        pid = handle.pid.as_raw(),
                        %status,
                        error = %e,
                        "Discarding unreadable worker result"
                    );
                }
                return Ok(Some(Reaped {
                    pid: handle.pid,
                    status,
                    outcome: None,
                }));
            }
        };

        let outcome = match envelope {
            Envelope::Success(value) => {
                self.results.push(Ok(value.clone()));
                Ok(value)
            }
            Envelope::Failure(failure) => {
                let failure = match failure.pid {
                    Some(_) => failure,
                    None => failure.with_pid(handle.pid.as_raw()),
                };
                if failure.is_terminal() || self.config.raise_policy == RaisePolicy::Raise {
                    let signaled = self.signal_all(Signal::SIGTERM);
                    warn!(
                        pid = handle.pid.as_raw(),
                        kind = ?failure.kind,
                        signaled,
                        "Task failure aborts the pool"
                    );
                    return Err(PoolError::Task(failure));
                }
                debug!(pid = handle.pid.as_raw(), error = %failure, "Task failure recorded");
                self.results.push(Err(failure.clone()));
                Err(failure)
            }
        };

        Ok(Some(Reaped {
            pid: handle.pid,
            status,
            outcome: Some(outcome),
        }))
    }

    /// Wait until every live worker has been collected.
    #[instrument(level = "debug", skip(self), fields(live = self.live.len()))]
    pub fn wait_all(&mut self) -> Result<&[Outcome<T>]> {
        while !self.live.is_empty() {
            self.wait()?;
        }
        Ok(&self.results)
    }

    /// Block until a live channel hits EOF, draining readable channels meanwhile.
    ///
    /// Returns the index of the finished worker in `self.live`.
    fn next_finished(&mut self) -> Result<usize> {
        loop {
            let ready: Vec<usize> = {
                let mut fds: Vec<PollFd<'_>> = self
                    .live
                    .iter()
                    .map(|h| PollFd::new(h.channel.as_fd(), PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(source) => {
                        return Err(PoolError::Wait {
                            pid: Pid::from_raw(-1),
                            source,
                        });
                    }
                }
                let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                fds.iter()
                    .enumerate()
                    .filter(|(_, fd)| fd.revents().is_some_and(|r| r.intersects(wake)))
                    .map(|(i, _)| i)
                    .collect()
            };

            for index in ready {
                let handle = &mut self.live[index];
                match handle.channel.read_chunk(&mut handle.received) {
                    Ok(0) => return Ok(index),
                    Ok(n) => trace!(pid = handle.pid.as_raw(), bytes = n, "Worker channel read"),
                    Err(e) => {
                        warn!(pid = handle.pid.as_raw(), error = %e, "Worker channel read failed");
                        return Ok(index);
                    }
                }
            }
        }
    }
}

impl<T> Pool<T> {
    /// Send `signal` to every live worker. Returns how many were signaled.
    pub fn signal_all(&self, signal: Signal) -> usize {
        let signaled = self.live_pids.signal_all(signal);
        if signaled > 0 {
            debug!(signal = signal.as_str(), signaled, "Signaled live workers");
        }
        signaled
    }

    /// Ask every live worker to exit with SIGTERM.
    pub fn terminate_all(&self) -> usize {
        self.signal_all(Signal::SIGTERM)
    }

    /// Number of live workers.
    pub fn count(&self) -> usize {
        self.live.len()
    }

    /// Pids of the live workers, in spawn order.
    pub fn pids(&self) -> Vec<Pid> {
        self.live.iter().map(|h| h.pid).collect()
    }

    /// Results collected so far, in completion order.
    pub fn results(&self) -> &[Outcome<T>] {
        &self.results
    }

    /// Terminate any live workers and hand back the collected results.
    pub fn into_results(mut self) -> Vec<Outcome<T>> {
        std::mem::take(&mut self.results)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Read live channels until every worker has closed its end or `deadline`
    /// passes. Closing the channel is the last thing a worker does.
    fn drain_until(&mut self, deadline: Instant) {
        let mut open: Vec<usize> = (0..self.live.len()).collect();
        while !open.is_empty() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let millis = remaining.as_millis().min(u128::from(u16::MAX)) as u16;

            let ready: Vec<usize> = {
                let mut fds: Vec<PollFd<'_>> = open
                    .iter()
                    .map(|&i| PollFd::new(self.live[i].channel.as_fd(), PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::from(millis)) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
                fds.iter()
                    .zip(&open)
                    .filter(|(fd, _)| fd.revents().is_some_and(|r| !r.is_empty()))
                    .map(|(_, &i)| i)
                    .collect()
            };

            for index in ready {
                let handle = &mut self.live[index];
                if !matches!(handle.channel.read_chunk(&mut handle.received), Ok(n) if n > 0) {
                    open.retain(|&i| i != index);
                }
            }
        }
    }
}

/// Collect the exit status of a worker whose channel is closed.
fn reap(pid: Pid) -> Result<TerminationReason> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(status.into()),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                warn!(pid = pid.as_raw(), "Worker was reaped elsewhere");
                return Ok(TerminationReason::Unknown);
            }
            Err(source) => return Err(PoolError::Wait { pid, source }),
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        if self.live.is_empty() {
            return;
        }

        let signaled = self.live_pids.signal_all(Signal::SIGTERM);
        debug!(signaled, "Terminating live workers on pool drop");
        self.drain_until(Instant::now() + SHUTDOWN_GRACE);

        for handle in std::mem::take(&mut self.live) {
            // Leader still unreaped: also catches descendants that ignored SIGTERM.
            let _ = relay::signal_group(handle.pid, Signal::SIGKILL);
            loop {
                match waitpid(handle.pid, None) {
                    Err(Errno::EINTR) => continue,
                    _ => break,
                }
            }
            self.live_pids.remove(handle.pid);
        }
    }
}
