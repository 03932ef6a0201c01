use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Lines produced by a follow-mode command. Each item carries the line
/// terminator when one was received; the stream ends when the remote command
/// or its channel ends.
pub type LineStream = BoxStream<'static, Result<String, CommandError>>;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("channel error: {0}")]
    Channel(String),
}

impl CommandError {
    pub fn channel(err: impl ToString) -> Self {
        CommandError::Channel(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub exit_code: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RemoteCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Trimmed stdout lines, in order.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_lossy().lines().map(|line| line.trim().to_string()).collect()
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs one command to completion. On timeout the remote command is
    /// abandoned, not killed.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError>;

    /// Starts a command that is expected to run indefinitely and yields its
    /// stdout line by line. No timeout applies.
    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError>;
}

#[async_trait]
impl<E> RemoteExecutor for Arc<E>
where
    E: RemoteExecutor + ?Sized,
{
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError> {
        (**self).execute(command, timeout).await
    }

    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError> {
        (**self).stream_follow(command).await
    }
}

/// Splits a byte stream into lines as chunks arrive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: bytes::BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line including its `\n`, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let position = self.pending.iter().position(|byte| *byte == b'\n')?;
        let line = self.pending.split_to(position + 1);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the stream ended, without a terminator.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
