//! SSH backend built on `russh`, `russh-keys` and `russh-sftp`.

mod executor;
mod transfer;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use russh::{
    client::{self, DisconnectReason},
    Disconnect,
};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::{
    connection::{ConnectError, ConnectionOptions, Credential, RemoteSession, RemoteTransport},
    transfer::TransferError,
};

pub use transfer::RusshTransfer;

/// Opens password or key authenticated sessions with `russh`.
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    pub fn new(config: client::Config) -> RusshTransport {
        RusshTransport {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        RusshTransport::new(client::Config::default())
    }
}

pub struct RusshSession {
    handle: client::Handle<TrustingHandler>,
    transport_closed: Arc<AtomicBool>,
}

/// Accepts every host key. Robots share one address across many physical
/// units with different keys, so there is nothing stable to pin against.
pub struct TrustingHandler {
    transport_closed: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        self.transport_closed.store(true, Ordering::SeqCst);
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteTransport for RusshTransport {
    type Session = RusshSession;

    async fn open(&self, options: &ConnectionOptions) -> Result<RusshSession, ConnectError> {
        let address = (options.host.as_str(), options.port);
        let connecting = TcpStream::connect(address);
        let stream = match tokio::time::timeout(options.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ConnectError::Socket(err.to_string())),
            Err(_) => {
                return Err(ConnectError::Socket(format!(
                    "no answer from {}:{} within {:?}",
                    options.host, options.port, options.connect_timeout
                )))
            }
        };
        let _ = stream.set_nodelay(true);

        let transport_closed = Arc::new(AtomicBool::new(false));
        let handler = TrustingHandler {
            transport_closed: transport_closed.clone(),
        };
        let mut handle = match tokio::time::timeout(
            options.operation_timeout,
            client::connect_stream(self.config.clone(), stream, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(ConnectError::Protocol(err.to_string())),
            Err(_) => return Err(ConnectError::Protocol("handshake timed out".into())),
        };
        debug!("SSH handshake with {} complete", options.host);

        let authentication = match &options.credential {
            Credential::Password(password) => {
                tokio::time::timeout(
                    options.operation_timeout,
                    handle.authenticate_password(options.username.clone(), password.clone()),
                )
                .await
            }
            Credential::KeyPair(key_pair) => {
                tokio::time::timeout(
                    options.operation_timeout,
                    handle.authenticate_publickey(options.username.clone(), key_pair.clone()),
                )
                .await
            }
        };
        match authentication {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(ConnectError::Auth(format!(
                    "the robot rejected the credentials for {}",
                    options.username
                )))
            }
            Ok(Err(err)) => return Err(ConnectError::Auth(err.to_string())),
            Err(_) => return Err(ConnectError::Protocol("authentication timed out".into())),
        }
        info!("Authenticated as {} on {}", options.username, options.host);

        Ok(RusshSession {
            handle,
            transport_closed,
        })
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    type Transfer = RusshTransfer;

    async fn open_transfer(&self) -> Result<RusshTransfer, TransferError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| {
                TransferError::Session(format!("could not open SFTP channel: {}", err))
            })?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| TransferError::Session(format!("could not request SFTP: {}", err)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|err| TransferError::Session(format!("could not start SFTP: {}", err)))?;
        Ok(RusshTransfer::new(sftp))
    }

    fn is_closed(&self) -> bool {
        self.transport_closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.transport_closed.store(true, Ordering::SeqCst);
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Disconnect did not complete cleanly: {}", err);
        }
    }
}
