use std::{fmt, future::Future, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::{executor::RemoteExecutor, robot::scripts, shell::RemoteCommand};

const MOUNT_QUERY: &str = "mount | grep \"on / \"";

static MOUNT_OPTIONS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^)]*)\)").expect("mount options pattern is valid"));

/// Write protection of the robot's root filesystem. Never cached: the toggle
/// scripts run detached and can change it at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritableState {
    Unknown,
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for WritableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WritableState::Unknown => "Unknown",
            WritableState::ReadOnly => "Readonly",
            WritableState::ReadWrite => "ReadWrite",
        })
    }
}

/// Reads the root mount options from one line of `mount` output.
pub fn parse_mount_line(line: &str) -> WritableState {
    let Some(captures) = MOUNT_OPTIONS.captures(line) else {
        return WritableState::Unknown;
    };
    let options: Vec<&str> = captures[1].split(',').map(str::trim).collect();
    if options.contains(&"ro") {
        WritableState::ReadOnly
    } else if options.contains(&"rw") {
        WritableState::ReadWrite
    } else {
        WritableState::Unknown
    }
}

/// Asks the robot how its root filesystem is mounted. Any failure reads as
/// [`WritableState::Unknown`].
pub async fn query_state<E>(executor: &E, timeout: Duration) -> WritableState
where
    E: RemoteExecutor + ?Sized,
{
    match executor.execute(MOUNT_QUERY, timeout).await {
        Ok(result) => {
            let stdout = result.stdout_lossy();
            let state = stdout.lines().next().map_or(WritableState::Unknown, parse_mount_line);
            debug!("Root filesystem is {}", state);
            state
        }
        Err(err) => {
            debug!("Writable check failed: {}", err);
            WritableState::Unknown
        }
    }
}

/// Fires `dt-rw.sh` in the background. Best effort.
pub async fn make_writable<E>(executor: &E, timeout: Duration)
where
    E: RemoteExecutor + ?Sized,
{
    toggle(executor, scripts::MAKE_WRITABLE, timeout).await
}

/// Fires `dt-ro.sh` in the background. Best effort.
pub async fn make_readonly<E>(executor: &E, timeout: Duration)
where
    E: RemoteExecutor + ?Sized,
{
    toggle(executor, scripts::MAKE_READONLY, timeout).await
}

async fn toggle<E>(executor: &E, script: &str, timeout: Duration)
where
    E: RemoteExecutor + ?Sized,
{
    // detached because remounting can drop the session for a moment
    let command = RemoteCommand::new(script).background().render();
    if let Err(err) = executor.execute(&command, timeout).await {
        warn!("{} could not be started: {}", script, err);
    }
}

/// Runs `body` with the root filesystem writable and afterwards puts it back
/// to read-only if that is how it started, whether or not `body` succeeded.
/// The toggles themselves are not verified.
pub async fn ensure_writable_then_restore<E, F, Fut, T, Er>(
    executor: &E,
    original: WritableState,
    timeout: Duration,
    body: F,
) -> Result<T, Er>
where
    E: RemoteExecutor + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Er>>,
{
    if original != WritableState::ReadWrite {
        make_writable(executor, timeout).await;
    }

    let outcome = body().await;

    if original == WritableState::ReadOnly {
        make_readonly(executor, timeout).await;
    }
    outcome
}
