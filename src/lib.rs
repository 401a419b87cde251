//! procpool - run independent tasks in a bounded pool of forked processes.
//!
//! Every task submitted to a [`Pool`] runs in its own `fork(2)`ed worker and
//! sends its result back over a pipe. At most `max_concurrency` workers are
//! alive at once; [`Pool::submit`] blocks while the pool is full.
//!
//! Failures come in three kinds ([`FailureKind`]): ordinary errors and panics
//! (`Generic`), deliberate aborts returned as [`Break`], and deadline expiry
//! (`Timeout`). Generic failures are either raised or collected depending on
//! the pool's [`RaisePolicy`]; the other two always abort the pool.
//!
//! ```no_run
//! use procpool::{Break, Pool, PoolConfig};
//!
//! let mut pool = Pool::new(PoolConfig::new().with_max_concurrency(2).child_timeout_secs(10.0))?;
//! for shard in 0..8u32 {
//!     pool.submit(move || {
//!         if shard == 99 {
//!             return Err(Break::new("found the needle").into());
//!         }
//!         Ok(shard)
//!     })?;
//! }
//! let done = pool.wait_all()?;
//! assert_eq!(done.len(), 8);
//! # Ok::<(), procpool::PoolError>(())
//! ```
//!
//! Unix only.

pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

pub use config::{ChildStdio, ForkHook, PoolConfig, RaisePolicy};
pub use error::{PoolError, Result};
pub use worker::{Break, FailureKind, Outcome, Pool, Reaped, TaskFailure, TerminationReason};
