use std::{fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    executor::{CommandError, LineStream, RemoteCommandResult, RemoteExecutor},
    transfer::{FileTransfer, TransferError},
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unable to reach the robot: {0}")]
    Socket(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("SSH negotiation failed: {0}")]
    Protocol(String),
    #[error("a connection attempt is already in progress")]
    Busy,
    #[error("the connection attempt was cancelled")]
    Aborted,
}

#[derive(Clone)]
pub enum Credential {
    Password(String),
    #[cfg(feature = "impl-russh")]
    KeyPair(Arc<russh_keys::key::KeyPair>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            #[cfg(feature = "impl-russh")]
            Credential::KeyPair(_) => f.write_str("KeyPair(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost { connection_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct LivenessOptions {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before the connection counts as lost.
    pub failure_threshold: u32,
}

impl Default for LivenessOptions {
    fn default() -> Self {
        LivenessOptions {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(3),
            failure_threshold: 2,
        }
    }
}

/// Opens authenticated sessions. The SSH backend lives in `ssh_russh`.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    type Session: RemoteSession;

    async fn open(&self, options: &ConnectionOptions) -> Result<Self::Session, ConnectError>;
}

/// One authenticated connection. Every logical channel (commands, file
/// transfer, log tail) is multiplexed over it.
#[async_trait]
pub trait RemoteSession: RemoteExecutor + 'static {
    type Transfer: FileTransfer + 'static;

    async fn open_transfer(&self) -> Result<Self::Transfer, TransferError>;

    /// Whether the transport reported that it went away.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

struct ConnectionShared {
    id: Uuid,
    phase: watch::Sender<ConnectionPhase>,
}

/// Cheap, cloneable access to a supervised connection. Every call fails
/// with a channel error once the connection is no longer `Connected`, and
/// calls blocked at that moment return promptly.
pub struct ConnectionHandle<S> {
    session: Arc<S>,
    shared: Arc<ConnectionShared>,
}

impl<S> Clone for ConnectionHandle<S> {
    fn clone(&self) -> Self {
        ConnectionHandle {
            session: self.session.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S: RemoteSession> ConnectionHandle<S> {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.shared.phase.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub async fn open_transfer(&self) -> Result<S::Transfer, TransferError> {
        if !self.is_alive() {
            return Err(TransferError::Session("not connected".into()));
        }
        let mut phase = self.shared.phase.subscribe();
        tokio::select! {
            transfer = self.session.open_transfer() => transfer,
            _ = until_closed(&mut phase) => {
                Err(TransferError::Session("connection closed".into()))
            }
        }
    }

    /// A file transfer whose channel is only opened by the first transfer
    /// operation, then reused.
    pub fn lazy_transfer(&self) -> LazyTransfer<'_, S> {
        LazyTransfer {
            handle: self,
            transfer: OnceCell::new(),
        }
    }

    fn transport_closed(&self) -> bool {
        self.session.is_closed()
    }
}

pub struct LazyTransfer<'a, S: RemoteSession> {
    handle: &'a ConnectionHandle<S>,
    transfer: OnceCell<S::Transfer>,
}

impl<'a, S: RemoteSession> LazyTransfer<'a, S> {
    async fn get(&self) -> Result<&S::Transfer, TransferError> {
        self.transfer.get_or_try_init(|| self.handle.open_transfer()).await
    }
}

#[async_trait]
impl<'a, S: RemoteSession> FileTransfer for LazyTransfer<'a, S> {
    async fn is_dir(&self, remote_path: &str) -> Result<bool, TransferError> {
        self.get().await?.is_dir(remote_path).await
    }

    async fn create_dir(&self, remote_path: &str) -> Result<(), TransferError> {
        self.get().await?.create_dir(remote_path).await
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), TransferError> {
        self.get().await?.put(local_path, remote_path).await
    }

    async fn read_dir(&self, remote_dir: &str) -> Result<Vec<String>, TransferError> {
        self.get().await?.read_dir(remote_dir).await
    }
}

#[async_trait]
impl<S: RemoteSession> RemoteExecutor for ConnectionHandle<S> {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError> {
        if !self.is_alive() {
            return Err(CommandError::channel("not connected"));
        }
        let mut phase = self.shared.phase.subscribe();
        tokio::select! {
            result = self.session.execute(command, timeout) => result,
            _ = until_closed(&mut phase) => {
                Err(CommandError::channel("connection closed"))
            }
        }
    }

    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError> {
        if !self.is_alive() {
            return Err(CommandError::channel("not connected"));
        }
        let lines = self.session.stream_follow(command).await?;
        let phase = self.shared.phase.subscribe();

        // yields one channel error when the connection goes away, then ends
        let guarded = stream::unfold(Some((lines, phase)), |state| async move {
            let (mut lines, mut phase) = state?;
            tokio::select! {
                item = lines.next() => item.map(|item| (item, Some((lines, phase)))),
                _ = until_closed(&mut phase) => {
                    Some((Err(CommandError::channel("connection closed")), None))
                }
            }
        });
        Ok(guarded.boxed())
    }
}

async fn until_closed(phase: &mut watch::Receiver<ConnectionPhase>) {
    let _ = phase.wait_for(|phase| *phase != ConnectionPhase::Connected).await;
}

struct ActiveConnection<S> {
    handle: ConnectionHandle<S>,
    prober: JoinHandle<()>,
}

struct SupervisorState<S> {
    phase: ConnectionPhase,
    /// Bumped by every connect and disconnect so a stale attempt can tell it
    /// was superseded.
    generation: u64,
    active: Option<ActiveConnection<S>>,
}

/// Owns the lifecycle of the single connection to the robot.
pub struct ConnectionSupervisor<T: RemoteTransport> {
    transport: T,
    liveness: LivenessOptions,
    state: Arc<Mutex<SupervisorState<T::Session>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<T: RemoteTransport> ConnectionSupervisor<T> {
    pub fn new(
        transport: T,
        liveness: LivenessOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor {
            transport,
            liveness,
            state: Arc::new(Mutex::new(SupervisorState {
                phase: ConnectionPhase::Disconnected,
                generation: 0,
                active: None,
            })),
            events,
        };
        (supervisor, receiver)
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase
    }

    /// The live connection, if any.
    pub async fn current(&self) -> Option<ConnectionHandle<T::Session>> {
        let state = self.state.lock().await;
        state.active.as_ref().map(|active| active.handle.clone())
    }

    /// Connects, replacing any existing connection. Rejected with
    /// [`ConnectError::Busy`] while another attempt is in flight.
    pub async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<ConnectionHandle<T::Session>, ConnectError> {
        let generation = {
            let mut state = self.state.lock().await;
            if state.phase == ConnectionPhase::Connecting {
                return Err(ConnectError::Busy);
            }
            teardown(&mut state).await;
            state.phase = ConnectionPhase::Connecting;
            state.generation += 1;
            state.generation
        };

        info!("Connecting to {}@{}:{}", options.username, options.host, options.port);
        let opened = self.transport.open(options).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            if let Ok(session) = opened {
                session.close().await;
            }
            return Err(ConnectError::Aborted);
        }

        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                warn!("Connection to {} failed: {}", options.host, err);
                state.phase = ConnectionPhase::Disconnected;
                return Err(err);
            }
        };

        let (phase, _) = watch::channel(ConnectionPhase::Connected);
        let handle = ConnectionHandle {
            session: Arc::new(session),
            shared: Arc::new(ConnectionShared { id: Uuid::new_v4(), phase }),
        };
        let prober = tokio::spawn(probe_liveness(
            handle.clone(),
            self.liveness.clone(),
            self.state.clone(),
            self.events.clone(),
        ));

        state.phase = ConnectionPhase::Connected;
        state.active = Some(ActiveConnection {
            handle: handle.clone(),
            prober,
        });
        info!("Connected to {} (connection {})", options.host, handle.id());
        Ok(handle)
    }

    /// Idempotent. Cancels the prober, closes the transport and fails every
    /// call still blocked on the old connection.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        teardown(&mut state).await;
        state.phase = ConnectionPhase::Disconnected;
    }
}

async fn teardown<S: RemoteSession>(state: &mut SupervisorState<S>) {
    if let Some(active) = state.active.take() {
        info!("Closing connection {}", active.handle.id());
        active.prober.abort();
        active.handle.shared.phase.send_replace(ConnectionPhase::Disconnected);
        active.handle.session.close().await;
    }
}

async fn probe_liveness<S: RemoteSession>(
    handle: ConnectionHandle<S>,
    options: LivenessOptions,
    state: Arc<Mutex<SupervisorState<S>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut interval = tokio::time::interval(options.interval);
    // the first tick completes immediately
    interval.tick().await;
    let mut failures = 0;

    loop {
        interval.tick().await;
        if !handle.is_alive() {
            return;
        }
        if handle.transport_closed() {
            debug!("Transport of connection {} reports inactive", handle.id());
            break;
        }

        match handle.execute("true", options.probe_timeout).await {
            Ok(result) if result.success() => failures = 0,
            outcome => {
                let reason = match outcome {
                    Ok(result) => format!("exit status {}", result.exit_code),
                    Err(err) => err.to_string(),
                };
                failures += 1;
                debug!(
                    "Liveness probe {} of {} failed: {}",
                    failures, options.failure_threshold, reason
                );
                if failures >= options.failure_threshold {
                    break;
                }
            }
        }
    }

    let mut state = state.lock().await;
    let is_current = state
        .active
        .as_ref()
        .map_or(false, |active| active.handle.id() == handle.id());
    if is_current && state.phase == ConnectionPhase::Connected {
        warn!("Connection {} lost", handle.id());
        state.phase = ConnectionPhase::Lost;
        handle.shared.phase.send_replace(ConnectionPhase::Lost);
        let _ = events.send(ConnectionEvent::Lost {
            connection_id: handle.id(),
        });
    }
}
