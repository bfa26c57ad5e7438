//! Checkpoint helper for shell scripts and exec'd test programs.
//!
//! Attaches to the page named by `LTP_IPC_PATH` and performs one wait or
//! wake on it.
//!
//! # Usage
//!
//! ```sh
//! checkpoint wait 10000 0        # wait on checkpoint 0 for up to 10 s (0 = forever)
//! checkpoint wake 10000 0 2      # wake two waiters on checkpoint 0, retrying up to 10 s
//! checkpoint capacity            # print the number of checkpoints
//! ```
//!
//! # Exit status
//!
//! - `0`: success
//! - `1`: bad arguments
//! - `2`: the checkpoint call failed (the harness's TBROK)

use std::time::Duration;

use checkpoint::safe::TBROK;
use checkpoint::{CheckpointError, Checkpoints, Timeout};

/// Usage error exit status.
const EXIT_USAGE: i32 = 1;

#[derive(Debug, thiserror::Error)]
enum HelperError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Wait { timeout_ms: u32, id: u32 },
    Wake { timeout_ms: u32, id: u32, nr_wake: u32 },
    Capacity,
    Help,
}

fn main() {
    checkpoint::init_tracing();

    if let Err(e) = run() {
        eprintln!("checkpoint: {e}");
        let code = match e {
            HelperError::Usage(_) => {
                print_usage();
                EXIT_USAGE
            }
            HelperError::Checkpoint(_) => TBROK,
        };
        std::process::exit(code);
    }
}

fn run() -> Result<(), HelperError> {
    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;

    if command == Command::Help {
        print_usage();
        return Ok(());
    }

    let checkpoints = Checkpoints::new();
    let region = checkpoints.reinit()?;

    match command {
        Command::Wait { timeout_ms, id } => region.wait(id, Timeout::from_millis(timeout_ms))?,
        Command::Wake {
            timeout_ms,
            id,
            nr_wake,
        } => region.wake(id, nr_wake, Duration::from_millis(u64::from(timeout_ms)))?,
        Command::Capacity => println!("{}", region.capacity()),
        Command::Help => {}
    }
    Ok(())
}

fn parse_number(args: &[String], i: usize, name: &str) -> Result<u32, HelperError> {
    let raw = args
        .get(i)
        .ok_or_else(|| HelperError::Usage(format!("missing value for {name}")))?;
    raw.parse()
        .map_err(|e| HelperError::Usage(format!("invalid {name} `{raw}`: {e}")))
}

/// Parses command line arguments into a [`Command`].
fn parse_args(args: &[String]) -> Result<Command, HelperError> {
    let verb = args
        .get(1)
        .ok_or_else(|| HelperError::Usage("missing command".into()))?;

    let (command, max_len) = match verb.as_str() {
        "wait" => (
            Command::Wait {
                timeout_ms: parse_number(args, 2, "TIMEOUT")?,
                id: parse_number(args, 3, "ID")?,
            },
            4,
        ),
        "wake" => {
            let nr_wake = if args.len() > 4 {
                parse_number(args, 4, "NR_WAKE")?
            } else {
                1
            };
            (
                Command::Wake {
                    timeout_ms: parse_number(args, 2, "TIMEOUT")?,
                    id: parse_number(args, 3, "ID")?,
                    nr_wake,
                },
                5,
            )
        }
        "capacity" => (Command::Capacity, 2),
        "--help" | "-h" => (Command::Help, 2),
        other => return Err(HelperError::Usage(format!("unknown command: {other}"))),
    };

    if let Some(extra) = args.get(max_len) {
        return Err(HelperError::Usage(format!("unexpected argument: {extra}")));
    }
    Ok(command)
}

fn print_usage() {
    eprintln!(
        r#"checkpoint - wait on or wake a harness checkpoint

USAGE:
    checkpoint wait TIMEOUT ID
    checkpoint wake TIMEOUT ID [NR_WAKE]
    checkpoint capacity

ARGS:
    TIMEOUT     Milliseconds; for wait, 0 means no timeout
    ID          Checkpoint number, starting at 0
    NR_WAKE     Number of waiters to release (default: 1)

ENVIRONMENT:
    LTP_IPC_PATH    Backing file of the checkpoint page (required)

EXAMPLE:
    checkpoint wait 10000 0
    checkpoint wake 10000 0 2
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("checkpoint")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_wait() {
        assert_eq!(
            parse_args(&args(&["wait", "500", "3"])).unwrap(),
            Command::Wait {
                timeout_ms: 500,
                id: 3
            }
        );
    }

    #[test]
    fn parses_wake_with_default_count() {
        assert_eq!(
            parse_args(&args(&["wake", "10000", "0"])).unwrap(),
            Command::Wake {
                timeout_ms: 10_000,
                id: 0,
                nr_wake: 1
            }
        );
        assert_eq!(
            parse_args(&args(&["wake", "10000", "0", "4"])).unwrap(),
            Command::Wake {
                timeout_ms: 10_000,
                id: 0,
                nr_wake: 4
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        for bad in [
            &[][..],
            &["wait"][..],
            &["wait", "10"][..],
            &["wait", "ten", "0"][..],
            &["wait", "10", "0", "extra"][..],
            &["wake", "10", "0", "1", "extra"][..],
            &["wake", "10", "-1"][..],
            &["sleep", "10", "0"][..],
        ] {
            assert!(
                matches!(parse_args(&args(bad)), Err(HelperError::Usage(_))),
                "accepted {bad:?}"
            );
        }
    }
}
