//! Forked worker processes and the pool that bounds them.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │  (Pool, relay)  │
//!                     └────────┬────────┘
//!                   fork + one pipe per task
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │  task +   │  │  task +   │  │  task +   │
//!         │  deadline │  │  deadline │  │  deadline │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each worker runs exactly one task and writes exactly one envelope:
//! `base64(zstd(json(Envelope<T>)))`. The parent decodes it when the worker
//! is reaped and applies the pool's failure policy.
//!
//! # Features
//!
//! - **Process isolation**: each task runs in its own copy of the parent
//! - **Backpressure**: `submit` blocks while `max_concurrency` workers are live
//! - **Deadlines**: a per-worker timeout turns stuck tasks into `Timeout` failures
//! - **Signal relay**: SIGTERM/SIGINT/SIGQUIT/SIGHUP reaching the parent reach the workers

mod codec;
mod guard;
mod ipc;
mod pool;
mod protocol;
pub mod relay;
mod signals;
mod spawn;

pub use codec::{CodecError, decode, encode};
pub use pool::{Outcome, Pool, Reaped};
pub use protocol::{Break, Envelope, FailureKind, TaskFailure};
pub use signals::TerminationReason;
