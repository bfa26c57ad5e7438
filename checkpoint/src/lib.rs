//! Futex-backed checkpoints for coordinating test processes.
//!
//! A checkpoint is a slot in a page of shared memory that one process can
//! block on and another can wake. The page is a regular file mapped by every
//! participant: the first process creates it, forked children inherit the
//! mapping, and exec'd helpers attach through the `LTP_IPC_PATH` environment
//! variable.
//!
//! - [`region`] - the page and the [`wait`](region::CheckpointRegion::wait) /
//!   [`wake`](region::CheckpointRegion::wake) primitives, returning errors
//! - [`registry`] - the one page a process uses, guarded against double setup
//! - [`safe`] - wrappers and macros that end the test on any failure
//!
//! ```no_run
//! use checkpoint::config::CheckpointConfig;
//! use checkpoint::{checkpoint_wait, registry};
//!
//! let region = registry::global().init(&CheckpointConfig::from_env())?;
//! let (key, value) = region.env();
//! let mut helper = std::process::Command::new("checkpoint")
//!     .args(["wake", "10000", "0"])
//!     .env(key, value)
//!     .spawn()?;
//!
//! checkpoint_wait!(0);
//! helper.wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod futex;
pub mod ipc;
pub mod region;
pub mod registry;
pub mod safe;
mod trace;

pub use config::CheckpointConfig;
pub use region::{CheckpointError, CheckpointRegion, Timeout};
pub use registry::Checkpoints;
pub use trace::init_tracing;
