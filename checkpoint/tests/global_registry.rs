//! The process-wide registry and the fail-fast macros.
//!
//! The global page can only be set up once per process, so everything that
//! touches it lives in a single test.

use std::process::Command;
use std::thread;

use checkpoint::config::CheckpointConfig;
use checkpoint::region::Role;
use checkpoint::registry::global;
use checkpoint::{CheckpointError, checkpoint_wait, checkpoint_wake, checkpoint_wake_and_wait};

const HELPER: &str = env!("CARGO_BIN_EXE_checkpoint");

#[test]
fn global_lifecycle_and_macros() {
    let checkpoints = global();
    assert!(!checkpoints.is_initialized());

    let path = std::env::temp_dir().join(format!("global-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let config = CheckpointConfig::default().with_path(&path);

    let region = checkpoints.init(&config).unwrap();
    assert_eq!(region.role(), Role::Creator);
    assert!(matches!(
        checkpoints.init(&config),
        Err(CheckpointError::AlreadyInitialized)
    ));

    // Threads sharing the global page.
    thread::scope(|s| {
        let waiter = s.spawn(|| checkpoint_wait!(0));
        checkpoint_wake!(0);
        waiter.join().unwrap();

        let waiters: Vec<_> = (0..2).map(|_| s.spawn(|| checkpoint_wait!(1, 5_000))).collect();
        checkpoint_wake!(1, 2);
        for waiter in waiters {
            waiter.join().unwrap();
        }

        let peer = s.spawn(|| checkpoint_wake_and_wait!(2));
        checkpoint_wait!(2);
        checkpoint_wake!(2);
        peer.join().unwrap();
    });

    // An exec'd helper attaching through the environment.
    let (key, value) = region.env();
    let mut child = Command::new(HELPER)
        .args(["wake", "10000", "3"])
        .env(key, value)
        .spawn()
        .unwrap();
    checkpoint_wait!(3);
    assert!(child.wait().unwrap().success());

    // The global page stays mapped for the rest of the process; remove the
    // file the way the harness's temp cleanup would.
    std::fs::remove_file(&path).unwrap();
}
