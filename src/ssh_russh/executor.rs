use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use russh::{client::Msg, Channel, ChannelMsg};
use tracing::debug;

use crate::executor::{CommandError, LineBuffer, LineStream, RemoteCommandResult, RemoteExecutor};

use super::RusshSession;

#[async_trait]
impl RemoteExecutor for RusshSession {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError> {
        match tokio::time::timeout(timeout, self.execute_to_completion(command)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Abandoning `{}` after {:?}", command, timeout);
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError> {
        let channel = self.begin_execute(command).await?;

        let lines = stream::unfold(Some((channel, LineBuffer::new())), |state| async move {
            let (mut channel, mut buffer) = state?;
            loop {
                if let Some(line) = buffer.next_line() {
                    return Some((Ok(line), Some((channel, buffer))));
                }
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => buffer.push(&data),
                    Some(_) => {}
                    None => return buffer.take_remainder().map(|rest| (Ok(rest), None)),
                }
            }
        });
        Ok(lines.boxed())
    }
}

impl RusshSession {
    async fn begin_execute(&self, command: &str) -> Result<Channel<Msg>, CommandError> {
        if self.is_transport_closed() {
            return Err(CommandError::channel("transport closed"));
        }
        let channel = self.handle.channel_open_session().await.map_err(CommandError::channel)?;
        channel.exec(true, command).await.map_err(CommandError::channel)?;
        Ok(channel)
    }

    async fn execute_to_completion(
        &self,
        command: &str,
    ) -> Result<RemoteCommandResult, CommandError> {
        let mut channel = self.begin_execute(command).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        let exit_code = exit_code
            .ok_or_else(|| CommandError::channel("channel closed without an exit status"))?;
        Ok(RemoteCommandResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn is_transport_closed(&self) -> bool {
        self.transport_closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
