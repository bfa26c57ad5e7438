//! Process-shared futex calls on a single 32-bit word.
//!
//! No `FUTEX_PRIVATE_FLAG`: the words live in a file mapping and waiters may
//! sit in other processes.

use rustix::io;
use rustix::thread::futex::{self, Flags, Timespec};
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// `FUTEX_WAIT`: sleeps while `word` still holds `expected`.
///
/// `timeout` is relative; `None` sleeps until woken.
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    let timespec = timeout.map(to_timespec);
    futex::wait(word, Flags::empty(), expected, timespec.as_ref())
}

/// `FUTEX_WAKE`: releases up to `count` waiters and returns how many woke.
pub(crate) fn wake(word: &AtomicU32, count: u32) -> io::Result<u32> {
    let count = count.min(i32::MAX as u32);
    let woken = futex::wake(word, Flags::empty(), count)?;
    Ok(u32::try_from(woken).unwrap_or(count))
}

fn to_timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        tv_nsec: d.subsec_nanos() as _,
    }
}
