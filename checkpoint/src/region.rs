//! The checkpoint page: a bounded array of futex words and the wait/wake
//! primitives over it.
//!
//! ```no_run
//! use checkpoint::region::{CheckpointRegion, Timeout};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! let region = CheckpointRegion::create(Path::new("/tmp/ltp_checkpoint"))?;
//!
//! // In a cooperating process or thread:
//! region.wake(0, 1, Duration::from_secs(10))?;
//!
//! // Here:
//! region.wait(0, Timeout::from_millis(10_000))?;
//! # Ok::<(), checkpoint::region::CheckpointError>(())
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use thiserror::Error;

use crate::config::IPC_ENV_VAR;
use crate::futex;
use crate::ipc::shmem::{Creator, Opener, Shm, ShmError};
use crate::trace::{debug, info, trace, warn};

/// Pause between wake attempts while waiters are still missing.
pub const WAKE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// How long [`CheckpointRegion::wait`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until woken.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    /// Millisecond form used by the harness: `0` means no timeout.
    #[must_use]
    pub const fn from_millis(ms: u32) -> Self {
        if ms == 0 {
            Self::Infinite
        } else {
            Self::Duration(Duration::from_millis(ms as u64))
        }
    }
}

/// Failures of checkpoint setup and of individual wait/wake calls.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A region was already set up in this process.
    #[error("checkpoints already initialized")]
    AlreadyInitialized,
    /// No region was set up, or the coordination variable is missing.
    #[error("checkpoints not configured: {0}")]
    NotConfigured(&'static str),
    /// The slot id is past the end of the page.
    #[error("checkpoint id {id} out of range (capacity {capacity})")]
    OutOfRange { id: u32, capacity: usize },
    /// The deadline passed before the wait or wake condition held.
    #[error("checkpoint {id} timed out after {} ms", .after.as_millis())]
    TimedOut { id: u32, after: Duration },
    /// The futex call failed.
    #[error("{op} on checkpoint {id}")]
    Os {
        op: &'static str,
        id: u32,
        #[source]
        source: Errno,
    },
    /// Mapping or validating the backing file failed.
    #[error(transparent)]
    Region(#[from] ShmError),
}

impl CheckpointError {
    /// Errno describing a per-call failure, matching what the C harness
    /// reported in `errno`.
    ///
    /// Region errors already carry their errno in the message and return
    /// `None`, as do configuration errors, which have none.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::OutOfRange { .. } => Some(Errno::OVERFLOW),
            Self::TimedOut { .. } => Some(Errno::TIMEDOUT),
            Self::Os { source, .. } => Some(*source),
            Self::AlreadyInitialized | Self::NotConfigured(_) | Self::Region(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Which side of the page this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the file and wrote the tag.
    Creator,
    /// Attached to a file created elsewhere.
    Attacher,
}

enum Backing {
    Created(Shm<Creator>),
    Attached(Shm<Opener>),
}

/// A mapped checkpoint page.
///
/// Capacity is `(page_size - 4) / 4` and is fixed when the page is mapped;
/// every process on the same host computes the same value.
pub struct CheckpointRegion {
    backing: Backing,
    capacity: usize,
}

impl CheckpointRegion {
    /// Creates the backing file at `path`, writes the tag and maps it.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Region`] if the file cannot be created or mapped.
    pub fn create(path: &Path) -> Result<Self> {
        let shm = Shm::<Creator>::create(path)?;
        let capacity = shm.payload_capacity::<AtomicU32>();
        info!(path = %path.display(), capacity, "checkpoint region created");
        Ok(Self {
            backing: Backing::Created(shm),
            capacity,
        })
    }

    /// Maps an existing backing file after checking its tag.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Region`] wrapping `NotFound`, `SizeMismatch`,
    /// `BadMagic` or the failing POSIX call.
    pub fn attach(path: &Path) -> Result<Self> {
        let shm = Shm::<Opener>::open(path)?;
        let capacity = shm.payload_capacity::<AtomicU32>();
        info!(path = %path.display(), capacity, "checkpoint region attached");
        Ok(Self {
            backing: Backing::Attached(shm),
            capacity,
        })
    }

    /// Number of addressable slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this process created or attached to the page.
    #[must_use]
    pub fn role(&self) -> Role {
        match self.backing {
            Backing::Created(_) => Role::Creator,
            Backing::Attached(_) => Role::Attacher,
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        match &self.backing {
            Backing::Created(shm) => shm.path(),
            Backing::Attached(shm) => shm.path(),
        }
    }

    /// Environment entry that lets an exec'd helper attach to this page.
    ///
    /// ```no_run
    /// # use checkpoint::region::CheckpointRegion;
    /// # let region = CheckpointRegion::create(std::path::Path::new("/tmp/cp"))?;
    /// let (key, value) = region.env();
    /// std::process::Command::new("checkpoint")
    ///     .args(["wake", "10000", "0"])
    ///     .env(key, value)
    ///     .spawn()
    ///     .expect("spawn helper");
    /// # Ok::<(), checkpoint::region::CheckpointError>(())
    /// ```
    #[must_use]
    pub fn env(&self) -> (&'static str, &Path) {
        (IPC_ENV_VAR, self.path())
    }

    fn slots(&self) -> &[AtomicU32] {
        match &self.backing {
            Backing::Created(shm) => shm.payload(self.capacity),
            Backing::Attached(shm) => shm.payload(self.capacity),
        }
    }

    /// The futex word for `id`.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::OutOfRange`] if `id >= capacity`.
    pub fn slot(&self, id: u32) -> Result<&AtomicU32> {
        self.slots()
            .get(id as usize)
            .ok_or(CheckpointError::OutOfRange {
                id,
                capacity: self.capacity,
            })
    }

    /// Blocks until slot `id` is woken or `timeout` passes.
    ///
    /// The slot value is sampled on entry and the thread sleeps while the
    /// slot still holds it. Signal interruptions are retried with the
    /// remaining time; a value that changed before the thread went to sleep
    /// counts as a wake.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::OutOfRange`] without blocking
    /// - [`CheckpointError::TimedOut`] when the deadline passes
    /// - [`CheckpointError::Os`] for any other futex failure
    pub fn wait(&self, id: u32, timeout: Timeout) -> Result<()> {
        let slot = self.slot(id)?;
        let expected = slot.load(Ordering::Acquire);

        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Instant::now().checked_add(d).map(|at| (at, d)),
        };
        let timed_out = |after| CheckpointError::TimedOut { id, after };

        loop {
            let remaining = match deadline {
                None => None,
                Some((at, total)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(timed_out(total));
                    }
                    Some(at - now)
                }
            };

            match futex::wait(slot, expected, remaining) {
                Ok(()) | Err(Errno::AGAIN) => {
                    trace!(id, "checkpoint woken");
                    return Ok(());
                }
                Err(Errno::INTR) => continue,
                Err(Errno::TIMEDOUT) => {
                    let total = deadline.map_or(Duration::ZERO, |(_, total)| total);
                    warn!(id, timeout_ms = total.as_millis() as u64, "checkpoint wait timed out");
                    return Err(timed_out(total));
                }
                Err(source) => {
                    return Err(CheckpointError::Os {
                        op: "futex_wait",
                        id,
                        source,
                    });
                }
            }
        }
    }

    /// Wakes exactly `nr_wake` waiters on slot `id`, retrying until they
    /// have all been released or `timeout` passes.
    ///
    /// Waiters that have not reached the futex yet are picked up by later
    /// attempts, spaced [`WAKE_RETRY_INTERVAL`] apart. Each attempt asks the
    /// kernel for the waiters still missing only, so surplus waiters stay
    /// blocked. Elapsed time is counted in retry intervals; a zero timeout
    /// allows a single attempt. The slot value is left untouched.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::OutOfRange`] without waking or sleeping
    /// - [`CheckpointError::TimedOut`] if fewer than `nr_wake` were released in time
    /// - [`CheckpointError::Os`] if the futex call fails
    pub fn wake(&self, id: u32, nr_wake: u32, timeout: Duration) -> Result<()> {
        let slot = self.slot(id)?;
        if nr_wake == 0 {
            return Ok(());
        }

        let limit_ms = timeout.as_millis();
        let mut woken = 0u32;
        let mut elapsed_ms = 0u128;

        loop {
            woken += futex::wake(slot, nr_wake - woken).map_err(|source| CheckpointError::Os {
                op: "futex_wake",
                id,
                source,
            })?;

            if woken == nr_wake {
                debug!(id, nr_wake, elapsed_ms = elapsed_ms as u64, "checkpoint waiters released");
                return Ok(());
            }

            thread::sleep(WAKE_RETRY_INTERVAL);
            elapsed_ms += WAKE_RETRY_INTERVAL.as_millis();

            if elapsed_ms >= limit_ms {
                warn!(id, nr_wake, woken, "checkpoint wake timed out");
                return Err(CheckpointError::TimedOut { id, after: timeout });
            }
        }
    }
}

impl std::fmt::Debug for CheckpointRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointRegion")
            .field("path", &self.path())
            .field("role", &self.role())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant as StdInstant;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("region-{}-{name}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    const LONG: Duration = Duration::from_secs(10);

    #[test]
    fn capacity_follows_page_size() {
        let region = CheckpointRegion::create(&scratch("capacity")).unwrap();
        assert_eq!(region.capacity(), (rustix::param::page_size() - 4) / 4);
        assert_eq!(region.role(), Role::Creator);
    }

    #[test]
    fn attacher_sees_same_capacity_and_slots() {
        let path = scratch("attach");
        let creator = CheckpointRegion::create(&path).unwrap();
        let attacher = CheckpointRegion::attach(&path).unwrap();

        assert_eq!(attacher.role(), Role::Attacher);
        assert_eq!(attacher.capacity(), creator.capacity());

        creator.slot(5).unwrap().store(11, Ordering::SeqCst);
        assert_eq!(attacher.slot(5).unwrap().load(Ordering::SeqCst), 11);
    }

    #[test]
    fn out_of_range_fails_without_blocking() {
        let region = CheckpointRegion::create(&scratch("range")).unwrap();
        let id = region.capacity() as u32;
        let started = StdInstant::now();

        let err = region.wait(id, Timeout::Infinite).unwrap_err();
        assert!(matches!(err, CheckpointError::OutOfRange { id: i, .. } if i == id));
        assert_eq!(err.errno(), Some(Errno::OVERFLOW));

        let err = region.wake(id, 1, LONG).unwrap_err();
        assert!(matches!(err, CheckpointError::OutOfRange { .. }));

        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_when_nobody_wakes() {
        let region = CheckpointRegion::create(&scratch("wait-timeout")).unwrap();
        let started = StdInstant::now();

        let err = region.wait(0, Timeout::from_millis(50)).unwrap_err();

        assert!(matches!(err, CheckpointError::TimedOut { id: 0, .. }));
        assert_eq!(err.errno(), Some(Errno::TIMEDOUT));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wake_times_out_without_waiters() {
        let region = CheckpointRegion::create(&scratch("wake-timeout")).unwrap();
        let err = region.wake(0, 1, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CheckpointError::TimedOut { id: 0, .. }));
    }

    #[test]
    fn wake_with_zero_timeout_tries_once() {
        let region = CheckpointRegion::create(&scratch("wake-once")).unwrap();
        let started = StdInstant::now();
        assert!(region.wake(0, 1, Duration::ZERO).is_err());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn wake_zero_waiters_is_immediate() {
        let region = CheckpointRegion::create(&scratch("wake-zero")).unwrap();
        region.wake(0, 0, Duration::ZERO).unwrap();
    }

    #[test]
    fn wait_released_by_wake() {
        let region = CheckpointRegion::create(&scratch("pair")).unwrap();
        region.slot(3).unwrap().store(41, Ordering::SeqCst);

        thread::scope(|s| {
            let waiter = s.spawn(|| region.wait(3, Timeout::from_millis(10_000)));
            region.wake(3, 1, LONG).unwrap();
            waiter.join().unwrap().unwrap();
        });

        assert_eq!(region.slot(3).unwrap().load(Ordering::SeqCst), 41);
    }

    static SIGNALS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_signal(_: libc::c_int) {
        SIGNALS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn wait_keeps_its_deadline_across_signals() {
        // No SA_RESTART, so each signal interrupts the futex with EINTR.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = count_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        let region = CheckpointRegion::create(&scratch("signals")).unwrap();
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            let region = &region;
            let waiter = s.spawn(move || {
                tx.send(unsafe { libc::pthread_self() }).unwrap();
                let started = StdInstant::now();
                let result = region.wait(0, Timeout::from_millis(300));
                (result, started.elapsed())
            });

            let thread_id = rx.recv().unwrap();
            for _ in 0..4 {
                thread::sleep(Duration::from_millis(40));
                assert_eq!(unsafe { libc::pthread_kill(thread_id, libc::SIGUSR1) }, 0);
            }

            let (result, elapsed) = waiter.join().unwrap();
            assert!(matches!(result, Err(CheckpointError::TimedOut { id: 0, .. })));
            assert!(elapsed >= Duration::from_millis(300), "returned after {elapsed:?}");
        });

        assert_eq!(SIGNALS.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn wake_waits_for_late_waiter() {
        let region = CheckpointRegion::create(&scratch("late")).unwrap();

        thread::scope(|s| {
            let waker = s.spawn(|| region.wake(1, 1, LONG));
            thread::sleep(Duration::from_millis(100));
            region.wait(1, Timeout::from_millis(10_000)).unwrap();
            waker.join().unwrap().unwrap();
        });
    }

    #[test]
    fn wake_releases_several_waiters() {
        let region = CheckpointRegion::create(&scratch("several")).unwrap();

        thread::scope(|s| {
            let waiters: Vec<_> = (0..3)
                .map(|_| s.spawn(|| region.wait(0, Timeout::from_millis(10_000))))
                .collect();
            region.wake(0, 3, LONG).unwrap();
            for waiter in waiters {
                waiter.join().unwrap().unwrap();
            }
        });
    }

    #[test]
    fn surplus_waiters_stay_blocked() {
        let region = CheckpointRegion::create(&scratch("surplus")).unwrap();

        thread::scope(|s| {
            let first = s.spawn(|| region.wait(2, Timeout::from_millis(10_000)));
            let second = s.spawn(|| region.wait(2, Timeout::from_millis(10_000)));

            region.wake(2, 1, LONG).unwrap();
            // Exactly one of the two is released; the other needs a second wake.
            region.wake(2, 1, LONG).unwrap();

            first.join().unwrap().unwrap();
            second.join().unwrap().unwrap();
        });
    }

    #[test]
    fn slots_are_independent() {
        let region = CheckpointRegion::create(&scratch("independent")).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| region.wait(7, Timeout::from_millis(200)));
            assert!(region.wake(8, 1, Duration::from_millis(50)).is_err());
            assert!(matches!(
                waiter.join().unwrap(),
                Err(CheckpointError::TimedOut { id: 7, .. })
            ));
        });
    }

    #[test]
    fn timeout_from_millis_zero_is_infinite() {
        assert_eq!(Timeout::from_millis(0), Timeout::Infinite);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::Duration(Duration::from_millis(250))
        );
    }
}
