//! Forwarding of termination signals from the parent to its workers.
//!
//! Signal dispositions are process-wide, so the relay is too: every pool
//! with relaying enabled registers its live pid set here. The first
//! registration installs handlers for [`RELAYED_SIGNALS`] and the last
//! deregistration restores whatever was installed before.
//!
//! The handler itself only writes the signal number to a self-pipe. A
//! dedicated thread reads it, logs, forwards the signal to every registered
//! worker and then exits the process, except for [`SOFT_SIGNAL`], which is
//! forwarded only so the parent can observe its workers dying.
//!
//! Every worker leads its own process group, so a forwarded signal also
//! reaches whatever the task started. An `atexit` hook installed with the
//! first handlers sends SIGTERM to every registered worker when the process
//! exits without dropping its pools.

use super::ipc::{self, PipeFd};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, kill, killpg};
use nix::unistd::{Pid, getpid};
use std::collections::BTreeSet;
use std::ffi::c_int;
use std::io::{self, Read};
use std::os::unix::io::{BorrowedFd, IntoRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, TryLockError};
use std::thread;

/// Signals trapped while at least one pool is registered.
pub const RELAYED_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGHUP,
];

/// Forwarded to workers without terminating the parent.
pub const SOFT_SIGNAL: Signal = Signal::SIGINT;

/// Write end of the self-pipe, or -1 while this process has no relay thread.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

static EXIT_HOOK: Once = Once::new();

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    next_id: 0,
    pools: Vec::new(),
    previous: Vec::new(),
    relay_owner: None,
});

struct Registry {
    next_id: u64,
    pools: Vec<(u64, Arc<LivePids>)>,
    /// Dispositions replaced by the relay, restored when the last pool leaves.
    previous: Vec<(Signal, SigAction)>,
    /// Process that started the relay thread. A forked worker inherits the
    /// registry but not the thread.
    relay_owner: Option<Pid>,
}

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock the registry without blocking, for paths where the holder may never
/// release it (after `fork`, during `exit`).
fn try_registry() -> Option<MutexGuard<'static, Registry>> {
    match REGISTRY.try_lock() {
        Ok(reg) => Some(reg),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone when
/// it leads no group.
pub fn signal_group(pid: Pid, signal: Signal) -> nix::Result<()> {
    match killpg(pid, signal) {
        Err(Errno::ESRCH) => kill(pid, signal),
        other => other,
    }
}

/// Pids of the live workers of one pool.
///
/// Mutated only by the owning pool; read by the relay thread.
#[derive(Debug, Default)]
pub struct LivePids {
    pids: Mutex<BTreeSet<i32>>,
}

impl LivePids {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<i32>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, pid: Pid) {
        self.lock().insert(pid.as_raw());
    }

    pub fn remove(&self, pid: Pid) {
        self.lock().remove(&pid.as_raw());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Pid> {
        self.lock().iter().copied().map(Pid::from_raw).collect()
    }

    /// Send `signal` to the process group of every pid, ignoring ones that
    /// are already gone.
    ///
    /// Returns the number of pids the signal was delivered to.
    pub fn signal_all(&self, signal: Signal) -> usize {
        let mut delivered = 0;
        for pid in self.snapshot() {
            match signal_group(pid, signal) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::trace!(pid = pid.as_raw(), error = %e, "Signal not delivered"),
            }
        }
        delivered
    }
}

/// Keeps a pool registered with the relay; deregisters on drop.
#[derive(Debug)]
pub struct RelayRegistration {
    id: u64,
}

impl Drop for RelayRegistration {
    fn drop(&mut self) {
        let mut reg = registry();
        reg.pools.retain(|(id, _)| *id != self.id);
        if reg.pools.is_empty() {
            restore_handlers(&mut reg);
        }
    }
}

/// Register a pool's pid set with the relay, installing handlers if needed.
pub fn register(pids: Arc<LivePids>) -> io::Result<RelayRegistration> {
    let mut reg = registry();
    ensure_relay_thread(&mut reg)?;
    if reg.pools.is_empty() {
        install_handlers(&mut reg)?;
    }
    let id = reg.next_id;
    reg.next_id += 1;
    reg.pools.push((id, pids));
    tracing::debug!(id, pools = reg.pools.len(), "Pool registered with signal relay");
    Ok(RelayRegistration { id })
}

/// Number of pools currently registered.
pub fn registered_pools() -> usize {
    registry().pools.len()
}

/// Restore default dispositions for the relayed signals in a fresh worker
/// and forget the parent's registrations.
///
/// Workers must die from a forwarded signal, not relay it again. A pool
/// created inside the worker starts a relay of its own.
pub fn reset_in_child() {
    NOTIFY_FD.store(-1, Ordering::Relaxed);
    for sig in RELAYED_SIGNALS {
        // SAFETY: SigDfl installs no Rust code as a handler.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }

    // Only the forking thread survives, so a lock held elsewhere is never released.
    if let Some(mut reg) = try_registry() {
        reg.pools.clear();
        reg.previous.clear();
    }
}

/// Forward `signal` to the workers of every registered pool.
///
/// Returns the number of workers signaled.
pub fn forward(signal: Signal) -> usize {
    let pools: Vec<Arc<LivePids>> = registry().pools.iter().map(|(_, p)| p.clone()).collect();
    pools.iter().map(|p| p.signal_all(signal)).sum()
}

extern "C" fn on_signal(signo: c_int) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    // SAFETY: the write end of the relay pipe is leaked and never closed.
    let notify = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = nix::unistd::write(notify, &[signo as u8]);
    Errno::set_raw(saved);
}

extern "C" fn on_exit() {
    let Some(reg) = try_registry() else {
        return;
    };
    let pools: Vec<Arc<LivePids>> = reg.pools.iter().map(|(_, p)| p.clone()).collect();
    drop(reg);
    for pids in pools {
        pids.signal_all(Signal::SIGTERM);
    }
}

fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: on_exit is a plain `extern "C"` function that never unwinds.
        if unsafe { libc::atexit(on_exit) } != 0 {
            tracing::warn!("Could not register exit hook; workers may outlive the process");
        }
    });
}

fn install_handlers(reg: &mut Registry) -> io::Result<()> {
    install_exit_hook();

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in RELAYED_SIGNALS {
        // SAFETY: on_signal only performs async-signal-safe operations.
        match unsafe { signal::sigaction(sig, &action) } {
            Ok(previous) => reg.previous.push((sig, previous)),
            Err(e) => {
                restore_handlers(reg);
                return Err(io::Error::from(e));
            }
        }
    }
    tracing::debug!(signals = ?RELAYED_SIGNALS, "Signal relay handlers installed");
    Ok(())
}

fn restore_handlers(reg: &mut Registry) {
    for (sig, previous) in reg.previous.drain(..) {
        // SAFETY: reinstalls the disposition that was active before the relay.
        let _ = unsafe { signal::sigaction(sig, &previous) };
    }
}

fn ensure_relay_thread(reg: &mut Registry) -> io::Result<()> {
    let me = getpid();
    if reg.relay_owner != Some(me) {
        start_relay_thread()?;
        reg.relay_owner = Some(me);
    }
    Ok(())
}

fn start_relay_thread() -> io::Result<()> {
    let (reader, writer) = ipc::channel()?;
    thread::Builder::new()
        .name("procpool-signal-relay".to_string())
        .spawn(move || relay_loop(reader))?;
    NOTIFY_FD.store(writer.into_inner().into_raw_fd(), Ordering::Relaxed);
    Ok(())
}

fn relay_loop(mut reader: PipeFd) {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Signal relay pipe failed");
                break;
            }
        }
        let Ok(signal) = Signal::try_from(c_int::from(byte[0])) else {
            continue;
        };

        let forwarded = forward(signal);
        tracing::warn!(
            signal = signal.as_str(),
            forwarded,
            "Received signal, forwarding to workers"
        );

        if signal != SOFT_SIGNAL {
            tracing::error!(signal = signal.as_str(), "Terminating after relayed signal");
            std::process::exit(128 + signal as i32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_live_pids_bookkeeping() {
        let pids = LivePids::new();
        assert!(pids.is_empty());
        pids.insert(Pid::from_raw(10));
        pids.insert(Pid::from_raw(11));
        pids.insert(Pid::from_raw(10));
        assert_eq!(pids.len(), 2);
        pids.remove(Pid::from_raw(10));
        assert_eq!(pids.snapshot(), vec![Pid::from_raw(11)]);
    }

    #[test]
    fn test_signal_all_empty() {
        assert_eq!(LivePids::new().signal_all(Signal::SIGTERM), 0);
    }

    #[test]
    fn test_signal_all_skips_dead_pids() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().unwrap();

        let pids = LivePids::new();
        pids.insert(pid);
        assert_eq!(pids.signal_all(Signal::SIGTERM), 0);
    }

    /// Whether `pid` exists and is not a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit_once(')').map(|(_, rest)| rest.trim_start().to_string()))
            .is_some_and(|rest| !rest.starts_with('Z'))
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_signal_group_reaches_descendants() {
        use std::io::{BufRead, BufReader};
        use std::os::unix::process::CommandExt;
        use std::process::Stdio;

        let mut leader = Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .process_group(0)
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(leader.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let grandchild: i32 = line.trim().parse().unwrap();
        assert!(is_running(grandchild));

        signal_group(Pid::from_raw(leader.id() as i32), Signal::SIGTERM).unwrap();
        leader.wait().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(grandchild) {
            assert!(Instant::now() < deadline, "grandchild survived its group");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_signal_group_falls_back_to_pid() {
        // Not a group leader: it shares the test process's group.
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        signal_group(Pid::from_raw(child.id() as i32), Signal::SIGKILL).unwrap();

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(child.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    #[serial]
    fn test_registration_is_counted() {
        let before = registered_pools();
        let a = register(Arc::new(LivePids::new())).unwrap();
        let b = register(Arc::new(LivePids::new())).unwrap();
        assert_eq!(registered_pools(), before + 2);
        drop(a);
        assert_eq!(registered_pools(), before + 1);
        drop(b);
        assert_eq!(registered_pools(), before);
    }

    #[test]
    #[serial]
    fn test_soft_signal_is_forwarded() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pids = Arc::new(LivePids::new());
        pids.insert(Pid::from_raw(child.id() as i32));
        let registration = register(pids).unwrap();

        signal::raise(SOFT_SIGNAL).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            assert!(Instant::now() < deadline, "child was not signaled");
            thread::sleep(Duration::from_millis(20));
        };
        drop(registration);

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    }
}
