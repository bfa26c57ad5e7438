//! Process-wide checkpoint page.
//!
//! A process maps the checkpoint page once, either as its creator
//! ([`Checkpoints::init`]) or by attaching to a page another process created
//! ([`Checkpoints::reinit`]). [`global`] is the instance the
//! `checkpoint_*!` macros use; separate instances can be built with
//! [`Checkpoints::new`] and passed around explicitly.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crate::config::{CheckpointConfig, IPC_ENV_VAR};
use crate::region::{CheckpointError, CheckpointRegion, Result, Timeout};
use crate::trace::debug;

static GLOBAL: Checkpoints = Checkpoints::new();

/// The instance shared by the whole process.
#[must_use]
pub fn global() -> &'static Checkpoints {
    &GLOBAL
}

/// Holder for at most one [`CheckpointRegion`].
///
/// Setup is serialized, and a second `init` or `reinit` fails with
/// [`CheckpointError::AlreadyInitialized`]. Once set, the region is shared
/// by reference for the lifetime of the holder.
#[derive(Debug)]
pub struct Checkpoints {
    region: OnceLock<CheckpointRegion>,
    setup: Mutex<()>,
}

impl Default for Checkpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoints {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            region: OnceLock::new(),
            setup: Mutex::new(()),
        }
    }

    /// Creates the checkpoint page described by `config`.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::AlreadyInitialized`] if a page is already set up,
    /// otherwise any error from [`CheckpointRegion::create`].
    pub fn init(&self, config: &CheckpointConfig) -> Result<&CheckpointRegion> {
        let path = config.creator_path();
        self.install(|| CheckpointRegion::create(&path))
    }

    /// Attaches to the page named by the `LTP_IPC_PATH` environment variable.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::NotConfigured`] if the variable is unset, plus the
    /// errors of [`reinit_from`](Self::reinit_from).
    pub fn reinit(&self) -> Result<&CheckpointRegion> {
        let path = std::env::var_os(IPC_ENV_VAR).map(PathBuf::from);
        self.reinit_from(path.as_deref())
    }

    /// Attaches to the page at `path`.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::NotConfigured`] if `path` is `None`
    /// - [`CheckpointError::AlreadyInitialized`] if a page is already set up
    /// - any error from [`CheckpointRegion::attach`]
    pub fn reinit_from(&self, path: Option<&Path>) -> Result<&CheckpointRegion> {
        let path = path.ok_or(CheckpointError::NotConfigured("LTP_IPC_PATH is not defined"))?;
        self.install(|| CheckpointRegion::attach(path))
    }

    fn install(&self, open: impl FnOnce() -> Result<CheckpointRegion>) -> Result<&CheckpointRegion> {
        let _guard = self.setup.lock().unwrap_or_else(PoisonError::into_inner);
        if self.region.get().is_some() {
            return Err(CheckpointError::AlreadyInitialized);
        }

        let region = open()?;
        debug!(?region, "checkpoints ready");
        self.region
            .set(region)
            .map_err(|_| CheckpointError::AlreadyInitialized)?;
        self.get()
    }

    /// The page, if one was set up.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::NotConfigured`] if neither `init` nor `reinit`
    /// succeeded. Callers should treat this as a broken harness, not as a
    /// recoverable condition.
    pub fn get(&self) -> Result<&CheckpointRegion> {
        self.region
            .get()
            .ok_or(CheckpointError::NotConfigured("checkpoints were never initialized"))
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.region.get().is_some()
    }

    /// Slot count of the page, or `None` before setup.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.region.get().map(CheckpointRegion::capacity)
    }

    /// [`CheckpointRegion::wait`] on the configured page.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::NotConfigured`] before setup, otherwise as
    /// [`CheckpointRegion::wait`].
    pub fn wait(&self, id: u32, timeout: Timeout) -> Result<()> {
        self.get()?.wait(id, timeout)
    }

    /// [`CheckpointRegion::wake`] on the configured page.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::NotConfigured`] before setup, otherwise as
    /// [`CheckpointRegion::wake`].
    pub fn wake(&self, id: u32, nr_wake: u32, timeout: Duration) -> Result<()> {
        self.get()?.wake(id, nr_wake, timeout)
    }
}
