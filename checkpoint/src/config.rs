//! Where the checkpoint page lives, plus the constants shared by every
//! participant.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the backing file path to exec'd helpers.
pub const IPC_ENV_VAR: &str = "LTP_IPC_PATH";

/// Tag stored in the first bytes of every checkpoint page.
pub const MAGIC: [u8; 4] = *b"LTPM";

/// Timeout used by the fail-fast wrappers when the caller passes none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// File name prefix for backing files derived under the temp directory.
const FILE_PREFIX: &str = "ltp_checkpoint";

/// Settings for creating or attaching to the checkpoint page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Explicit backing file. When `None` the creator derives one under
    /// `tmpdir` and attachers fall back to [`IPC_ENV_VAR`].
    pub path: Option<PathBuf>,
    /// Directory used for derived backing files.
    pub tmpdir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            tmpdir: std::env::temp_dir(),
        }
    }
}

impl CheckpointConfig {
    /// Builds a config from the process environment.
    ///
    /// `LTP_IPC_PATH` becomes the explicit path; `TMPDIR` is honoured through
    /// [`std::env::temp_dir`].
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            path: std::env::var_os(IPC_ENV_VAR).map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Uses `path` as the backing file.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Backing file the creator should use.
    ///
    /// Derived paths embed the process id so concurrent harness runs sharing
    /// a temp directory never collide.
    #[must_use]
    pub fn creator_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => self
                .tmpdir
                .join(format!("{FILE_PREFIX}_{}", std::process::id())),
        }
    }
}
