use std::time::Duration;

use futures_util::StreamExt;
use tracing::debug;

use crate::{executor::RemoteExecutor, robot::PROGRAM_LOG, shell::quote};

/// State of the follow command currently feeding the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStreamState {
    pub connected: bool,
    pub last_line_terminator_seen: bool,
}

/// Follows the robot program's log for as long as the connection lives,
/// re-issuing `tail -f` whenever it ends underneath us.
#[derive(Debug, Clone)]
pub struct LogTailer {
    log_path: String,
    retry_delay: Duration,
}

impl Default for LogTailer {
    fn default() -> Self {
        LogTailer::new(PROGRAM_LOG)
    }
}

impl LogTailer {
    pub fn new(log_path: impl Into<String>) -> LogTailer {
        LogTailer {
            log_path: log_path.into(),
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Pause before re-issuing a follow command that ended or failed.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn command(&self) -> String {
        format!("tail -f -n +1 {}", quote(&self.log_path))
    }

    /// Forwards every log line (terminator included, when present) to `sink`
    /// until `is_connected` turns false. Stream ends and channel errors are
    /// retried while still connected.
    pub async fn run<E, C, S>(&self, executor: &E, is_connected: C, mut sink: S)
    where
        E: RemoteExecutor + ?Sized,
        C: Fn() -> bool,
        S: FnMut(String),
    {
        let command = self.command();
        let mut first = true;
        let mut state = LogStreamState {
            connected: false,
            last_line_terminator_seen: true,
        };

        while is_connected() {
            if !first {
                tokio::time::sleep(self.retry_delay).await;
                if !is_connected() {
                    break;
                }
            }
            first = false;

            let mut lines = match executor.stream_follow(&command).await {
                Ok(lines) => lines,
                Err(err) => {
                    debug!("Could not start following {}: {}", self.log_path, err);
                    continue;
                }
            };
            if !state.last_line_terminator_seen {
                // the previous stream stopped mid-line
                sink("\n".to_string());
                state.last_line_terminator_seen = true;
            }
            state.connected = true;

            while is_connected() {
                match lines.next().await {
                    Some(Ok(line)) => {
                        state.last_line_terminator_seen = line.ends_with('\n');
                        sink(line);
                    }
                    Some(Err(err)) => {
                        debug!("Log stream failed: {}", err);
                        break;
                    }
                    None => break,
                }
            }
            state.connected = false;
            debug!("Follow command for {} ended ({:?})", self.log_path, state);
        }
    }
}
