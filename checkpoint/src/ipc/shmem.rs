//! File-backed shared page with typestate-based setup and cleanup.
//!
//! The checkpoint page is a regular file mapped `MAP_SHARED` by every
//! cooperating process. Its first four bytes hold a tag that identifies the
//! layout; the rest of the page is handed out as a typed array.
//!
//! - [`Shm<Mode>`] - Mapping of one page with its tag checked or written
//! - [`Creator`] - Creates or truncates the file, writes the tag, removes the file on drop
//! - [`Opener`] - Maps an existing file, validates the tag, leaves the file in place
//! - [`SharedMemorySafe`] - Marker for types that may be viewed inside the page
//!
//! ```no_run
//! use checkpoint::ipc::shmem::{Creator, Opener, Shm};
//! use std::path::Path;
//!
//! // Process A
//! let page = Shm::<Creator>::create(Path::new("/tmp/ltp_checkpoint"))?;
//!
//! // Process B, given the same path out of band
//! let page = Shm::<Opener>::open(Path::new("/tmp/ltp_checkpoint"))?;
//! # Ok::<(), checkpoint::ipc::shmem::ShmError>(())
//! ```
//!
//! Page layout:
//!
//! ```text
//! offset 0        4                                        page_size
//!        ┌────────┬──────────────────────────────────────────┐
//!        │ "LTPM" │ payload (viewed as [T] by the caller)    │
//!        └────────┴──────────────────────────────────────────┘
//! ```

use rustix::fs::{Mode, OFlags, fstat, ftruncate, open, unlink};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, param};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::AtomicU32;

use crate::config::MAGIC;

/// Result alias for page mapping operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug)]
pub enum ShmError {
    /// The backing file path cannot be used.
    InvalidPath { path: PathBuf, reason: &'static str },
    /// The backing file does not exist.
    NotFound { path: PathBuf },
    /// `open`, `write`, `ftruncate`, `mmap`, etc. failed with an errno.
    PosixError {
        op: &'static str,
        path: PathBuf,
        source: io::Errno,
    },
    /// The backing file is shorter than one page.
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: u64,
    },
    /// The first bytes of the page are not the checkpoint tag.
    BadMagic { path: PathBuf, found: [u8; 4] },
}

impl ShmError {
    fn posix(op: &'static str, path: &Path, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_path_buf(),
            source: err,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidPath { path, reason } => {
                write!(f, "invalid checkpoint file `{}`: {}", path.display(), reason)
            }
            ShmError::NotFound { path } => {
                write!(f, "checkpoint file `{}` does not exist", path.display())
            }
            ShmError::PosixError { op, path, source } => {
                write!(f, "{} failed for `{}`: {}", op, path.display(), source)
            }
            ShmError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "checkpoint file `{}` too short: expected {} bytes, got {}",
                path.display(),
                expected,
                actual
            ),
            ShmError::BadMagic { path, found } => write!(
                f,
                "invalid shared memory region (bad magic) in `{}`: found {:02x?}",
                path.display(),
                found
            ),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::PosixError { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Setup and cleanup behaviour of a mapping.
///
/// `Shm<Creator>` and `Shm<Opener>` are distinct types; only the creator
/// writes the tag and only the creator removes the backing file:
///
/// ```text
/// Creator            Opener
///    ↓                  ↓
///  Drop               Drop
///    ↓                  ↓
/// munmap()           munmap()
/// unlink()           (file kept)
/// ```
pub trait ShmMode {
    /// Whether to remove the backing file on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate for the process that creates the page.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate for processes attaching to a page created elsewhere.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that may be viewed inside the shared page.
///
/// # Safety
///
/// Implementers must be valid for every bit pattern (the page starts zeroed
/// and other processes may write it), contain no pointers, and be safe to
/// access concurrently from several processes, which in practice means
/// atomics.
pub unsafe trait SharedMemorySafe: Send + Sync {}

unsafe impl SharedMemorySafe for AtomicU32 {}

/// One page of a file mapped shared into this process.
///
/// # Safety Invariants
///
/// - **Mapped**: `ptr` points to `len` bytes obtained from `mmap()` and stays
///   mapped until drop
/// - **Backed**: the file is at least `len` bytes, so no access faults
/// - **Tagged**: the first [`MAGIC`] bytes were written (creator) or checked
///   (opener) before the value was constructed
pub struct Shm<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is plain shared memory, not tied to the creating
// thread. All typed access goes through `SharedMemorySafe` atomics.
unsafe impl<Mode: ShmMode> Send for Shm<Mode> {}

// SAFETY: `&Shm` only hands out shared references to atomics.
unsafe impl<Mode: ShmMode> Sync for Shm<Mode> {}

fn validate_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ShmError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path must not be empty",
        });
    }
    if path.is_dir() {
        return Err(ShmError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is a directory",
        });
    }
    Ok(())
}

/// Maps `len` bytes of `fd` shared, read/write.
fn map_shared(fd: &rustix::fd::OwnedFd, len: usize, path: &Path) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping of a file we hold open; it does not alias any
    // Rust object in this process and is at least `len` bytes long, which
    // callers check (ftruncate or fstat) before mapping.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::FAULT))
}

impl Shm<Creator> {
    /// Creates (or truncates) the backing file and maps one page of it.
    ///
    /// The tag is written through the file descriptor before the file is
    /// extended to a full page, so the payload starts zeroed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the path is unusable, the file cannot be created,
    /// written or resized, or the mapping fails. A partially created file is
    /// removed before returning.
    pub fn create(path: &Path) -> Result<Self> {
        validate_path(path)?;
        let len = param::page_size();

        let fd = open(
            path,
            OFlags::CREATE | OFlags::TRUNC | OFlags::RDWR | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH,
        )
        .map_err(|err| ShmError::posix("open", path, err))?;

        let prepared = match io::write(&fd, &MAGIC) {
            Ok(n) if n == MAGIC.len() => Ok(()),
            Ok(_) => Err(ShmError::posix("write", path, io::Errno::IO)),
            Err(err) => Err(ShmError::posix("write", path, err)),
        }
        .and_then(|()| {
            ftruncate(&fd, len as u64).map_err(|err| ShmError::posix("ftruncate", path, err))
        })
        .and_then(|()| map_shared(&fd, len, path));

        match prepared {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                path: path.to_path_buf(),
                _mode: PhantomData,
            }),
            Err(err) => {
                drop(fd);
                let _ = unlink(path);
                Err(err)
            }
        }
    }
}

impl Shm<Opener> {
    /// Maps one page of an existing backing file and validates its tag.
    ///
    /// # Errors
    ///
    /// - [`ShmError::NotFound`] if the file does not exist
    /// - [`ShmError::SizeMismatch`] if it is shorter than a page
    /// - [`ShmError::BadMagic`] if the tag does not match
    /// - [`ShmError::PosixError`] for any other open/fstat/mmap failure
    pub fn open(path: &Path) -> Result<Self> {
        validate_path(path)?;
        let len = param::page_size();

        let fd = open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(|err| {
            if err == io::Errno::NOENT {
                ShmError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ShmError::posix("open", path, err)
            }
        })?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        let actual = u64::try_from(stat.st_size).unwrap_or(0);
        if actual < len as u64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_path_buf(),
                expected: len,
                actual,
            });
        }

        let ptr = map_shared(&fd, len, path)?;
        let shm = Self {
            ptr,
            len,
            path: path.to_path_buf(),
            _mode: PhantomData,
        };

        let found = shm.magic();
        if found != MAGIC {
            return Err(ShmError::BadMagic {
                path: shm.path.clone(),
                found,
            });
        }
        Ok(shm)
    }
}

impl<Mode: ShmMode> Shm<Mode> {
    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the mapping in bytes (one page).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: a mapping covers at least one page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The tag bytes currently stored at the start of the page.
    #[must_use]
    pub fn magic(&self) -> [u8; 4] {
        // SAFETY: the mapping is at least one page, so the first four bytes
        // are readable. The tag is written once before anyone attaches.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().cast::<[u8; 4]>()) }
    }

    /// Number of `T` that fit in the page after the tag.
    #[must_use]
    pub fn payload_capacity<T: SharedMemorySafe>(&self) -> usize {
        (self.len - MAGIC.len()) / size_of::<T>()
    }

    /// Views `count` values of `T` starting right after the tag.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`payload_capacity`](Self::payload_capacity)
    /// or if the tag offset is not aligned for `T`.
    #[must_use]
    pub fn payload<T: SharedMemorySafe>(&self, count: usize) -> &[T] {
        assert!(count <= self.payload_capacity::<T>(), "payload exceeds page");
        assert!(MAGIC.len() % align_of::<T>() == 0, "payload misaligned for T");
        // SAFETY:
        // - In bounds: checked above against the mapped length
        // - Aligned: the page is page-aligned and the offset is a multiple of align_of::<T>()
        // - Valid: T is SharedMemorySafe, so any bit pattern (including zero) is valid
        //   and concurrent mutation only happens through atomics
        // - Lifetime: the mapping lives as long as &self
        unsafe {
            let first = self.ptr.as_ptr().add(MAGIC.len()).cast::<T>();
            std::slice::from_raw_parts(first, count)
        }
    }
}

impl<Mode: ShmMode> Drop for Shm<Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a live mapping created in the constructor.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }

        if Mode::SHOULD_UNLINK {
            let _ = unlink(&self.path);
        }
    }
}

impl<Mode: ShmMode> fmt::Debug for Shm<Mode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("unlink_on_drop", &Mode::SHOULD_UNLINK)
            .finish()
    }
}
