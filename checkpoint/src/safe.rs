//! Fail-fast checkpoint calls.
//!
//! Most harness code treats a checkpoint failure as a broken test, not as
//! something to recover from. The functions here call the primitives and
//! hand any error to an [`OnFatal`] handler, which does not return. The
//! macros use the [`global`](crate::registry::global) registry and the
//! [`Abort`] handler:
//!
//! ```no_run
//! use checkpoint::{checkpoint_wait, checkpoint_wake};
//!
//! checkpoint_wake!(0);        // wake one waiter, up to 10 s
//! checkpoint_wait!(1);        // wait up to 10 s
//! checkpoint_wait!(1, 500);   // wait up to 500 ms
//! checkpoint_wake!(2, 3);     // wake three waiters
//! ```

use std::fmt;
use std::panic::Location;

use crate::config::{CheckpointConfig, DEFAULT_TIMEOUT};
use crate::region::{CheckpointError, CheckpointRegion, Timeout};
use crate::registry::Checkpoints;
use crate::trace::error;

/// Exit status of a process whose test broke.
pub const TBROK: i32 = 2;

/// A failed checkpoint call, as handed to [`OnFatal::broken`].
#[derive(Debug)]
pub struct Broken<'a> {
    /// Call site of the fail-fast function.
    pub location: &'static Location<'static>,
    /// Operation, its arguments and the failure, ready to print.
    pub message: String,
    /// The underlying error.
    pub error: &'a CheckpointError,
}

impl fmt::Display for Broken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: TBROK: {}",
            self.location.file(),
            self.location.line(),
            self.message
        )
    }
}

/// Policy for checkpoint failures that end the test.
pub trait OnFatal {
    /// Handles `report` and never returns.
    fn broken(&self, report: Broken<'_>) -> !;
}

impl<T: OnFatal + ?Sized> OnFatal for &T {
    fn broken(&self, report: Broken<'_>) -> ! {
        (**self).broken(report)
    }
}

/// Default handler: report to stderr, run the cleanup hook, exit with
/// [`TBROK`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Abort {
    cleanup: Option<fn()>,
}

impl Abort {
    #[must_use]
    pub const fn new() -> Self {
        Self { cleanup: None }
    }

    /// Runs `cleanup` before the process exits.
    #[must_use]
    pub const fn with_cleanup(cleanup: fn()) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }
}

impl OnFatal for Abort {
    fn broken(&self, report: Broken<'_>) -> ! {
        error!(
            file = report.location.file(),
            line = report.location.line(),
            error = %report.error,
            "{}",
            report.message
        );
        eprintln!("{report}");
        if let Some(cleanup) = self.cleanup {
            cleanup();
        }
        std::process::exit(TBROK)
    }
}

#[track_caller]
fn escalate(on_fatal: &impl OnFatal, call: fmt::Arguments<'_>, err: &CheckpointError) -> ! {
    let message = match err.errno() {
        Some(errno) => format!("{call} failed: {err}: {errno}"),
        None => format!("{call} failed: {err}"),
    };
    on_fatal.broken(Broken {
        location: Location::caller(),
        message,
        error: err,
    })
}

/// Creates the checkpoint page, escalating any failure.
#[track_caller]
pub fn init<'a>(
    checkpoints: &'a Checkpoints,
    config: &CheckpointConfig,
    on_fatal: &impl OnFatal,
) -> &'a CheckpointRegion {
    match checkpoints.init(config) {
        Ok(region) => region,
        Err(err) => escalate(on_fatal, format_args!("checkpoint_init()"), &err),
    }
}

/// Attaches to the page named by `LTP_IPC_PATH`, escalating any failure.
#[track_caller]
pub fn reinit<'a>(checkpoints: &'a Checkpoints, on_fatal: &impl OnFatal) -> &'a CheckpointRegion {
    match checkpoints.reinit() {
        Ok(region) => region,
        Err(err) => escalate(on_fatal, format_args!("checkpoint_reinit()"), &err),
    }
}

/// Waits on `id` for up to `timeout_ms` milliseconds, or
/// [`DEFAULT_TIMEOUT`] when `timeout_ms` is 0.
#[track_caller]
pub fn safe_wait(checkpoints: &Checkpoints, id: u32, timeout_ms: u32, on_fatal: &impl OnFatal) {
    let timeout_ms = if timeout_ms == 0 {
        default_timeout_ms()
    } else {
        timeout_ms
    };

    if let Err(err) = checkpoints.wait(id, Timeout::from_millis(timeout_ms)) {
        escalate(
            on_fatal,
            format_args!("checkpoint_wait({id}, {timeout_ms})"),
            &err,
        );
    }
}

/// Wakes `nr_wake` waiters on `id`, retrying for up to [`DEFAULT_TIMEOUT`].
#[track_caller]
pub fn safe_wake(checkpoints: &Checkpoints, id: u32, nr_wake: u32, on_fatal: &impl OnFatal) {
    let timeout_ms = default_timeout_ms();

    if let Err(err) = checkpoints.wake(id, nr_wake, DEFAULT_TIMEOUT) {
        escalate(
            on_fatal,
            format_args!("checkpoint_wake({id}, {nr_wake}, {timeout_ms})"),
            &err,
        );
    }
}

/// Wakes one waiter on `id`, then waits on `id` for the reply.
#[track_caller]
pub fn safe_wake_and_wait(checkpoints: &Checkpoints, id: u32, on_fatal: &impl OnFatal) {
    safe_wake(checkpoints, id, 1, on_fatal);
    safe_wait(checkpoints, id, 0, on_fatal);
}

fn default_timeout_ms() -> u32 {
    u32::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(u32::MAX)
}

/// Waits on a checkpoint of the global registry; exits the process with
/// [`TBROK`] on failure.
///
/// `checkpoint_wait!(id)` waits up to 10 s, `checkpoint_wait!(id, ms)` up to
/// `ms` milliseconds.
#[macro_export]
macro_rules! checkpoint_wait {
    ($id:expr) => {
        $crate::checkpoint_wait!($id, 0)
    };
    ($id:expr, $timeout_ms:expr) => {
        $crate::safe::safe_wait(
            $crate::registry::global(),
            $id,
            $timeout_ms,
            &$crate::safe::Abort::new(),
        )
    };
}

/// Wakes waiters on a checkpoint of the global registry; exits the process
/// with [`TBROK`] if they do not all show up within 10 s.
///
/// `checkpoint_wake!(id)` wakes one waiter, `checkpoint_wake!(id, n)` wakes `n`.
#[macro_export]
macro_rules! checkpoint_wake {
    ($id:expr) => {
        $crate::checkpoint_wake!($id, 1)
    };
    ($id:expr, $nr_wake:expr) => {
        $crate::safe::safe_wake(
            $crate::registry::global(),
            $id,
            $nr_wake,
            &$crate::safe::Abort::new(),
        )
    };
}

/// Wakes one waiter on a checkpoint of the global registry and then waits on
/// the same checkpoint.
#[macro_export]
macro_rules! checkpoint_wake_and_wait {
    ($id:expr) => {
        $crate::safe::safe_wake_and_wait(
            $crate::registry::global(),
            $id,
            &$crate::safe::Abort::new(),
        )
    };
}
