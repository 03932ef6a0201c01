//! The front end's view of the tool: requests go in as method calls, every
//! outcome comes back as a [`SessionEvent`].

use std::{
    fmt,
    future::Future,
    path::PathBuf,
    sync::{Arc, Weak},
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::{
        ConnectError, ConnectionEvent, ConnectionHandle, ConnectionOptions, ConnectionPhase,
        ConnectionSupervisor, LivenessOptions, RemoteTransport,
    },
    deploy::{restart_program, DeployObserver, DeploymentOrchestrator},
    log_tail::LogTailer,
    network::{AccessPoint, NetworkManager, NetworkSettings},
    robot::{self, RobotVersions},
    settings::Timeouts,
    status::{StatusPoller, StatusReport, StatusUpdate},
    writable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Deploy,
    RestartProgram,
    Shutdown,
    Reboot,
    MakeWritable,
    MakeReadonly,
    ReadNetwork,
    SetCountry,
    SetAccessPoint,
    SetHostname,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Deploy => "deploy",
            Operation::RestartProgram => "restart program",
            Operation::Shutdown => "shutdown",
            Operation::Reboot => "reboot",
            Operation::MakeWritable => "make writable",
            Operation::MakeReadonly => "make read-only",
            Operation::ReadNetwork => "read network settings",
            Operation::SetCountry => "set WiFi country",
            Operation::SetAccessPoint => "set WiFi access point",
            Operation::SetHostname => "set hostname",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(String),
    ConnectionLost,
    Disconnected,
    Progress(String),
    ClearLog,
    LogText(String),
    Versions(RobotVersions),
    Status(StatusReport),
    NetworkSettings(NetworkSettings),
    /// The new hostname only applies after the robot restarts.
    RebootRequired,
    OperationFinished {
        operation: Operation,
        result: Result<(), String>,
    },
}

type EventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub timeouts: Timeouts,
    pub liveness: LivenessOptions,
    /// Local root the manifest's `coreLibFiles` globs are relative to.
    pub core_lib_root: PathBuf,
    pub log_tailer: LogTailer,
}

impl ToolOptions {
    pub fn new(timeouts: Timeouts, core_lib_root: PathBuf) -> ToolOptions {
        ToolOptions {
            timeouts,
            liveness: LivenessOptions::default(),
            core_lib_root,
            log_tailer: LogTailer::default(),
        }
    }
}

struct EventObserver {
    events: EventSender,
}

impl DeployObserver for EventObserver {
    fn progress(&self, message: &str) {
        let _ = self.events.send(SessionEvent::Progress(message.to_string()));
    }

    fn clear_log(&self) {
        let _ = self.events.send(SessionEvent::ClearLog);
    }
}

struct ToolInner<T: RemoteTransport> {
    supervisor: ConnectionSupervisor<T>,
    events: EventSender,
    timeouts: Timeouts,
    core_lib_root: PathBuf,
    log_tailer: LogTailer,
}

/// Runs every request as a background task against the single supervised
/// connection.
pub struct DeployTool<T: RemoteTransport> {
    inner: Arc<ToolInner<T>>,
}

impl<T: RemoteTransport> Clone for DeployTool<T> {
    fn clone(&self) -> Self {
        DeployTool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RemoteTransport> DeployTool<T> {
    /// Must be called inside a tokio runtime.
    pub fn new(
        transport: T,
        options: ToolOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (supervisor, connection_events) =
            ConnectionSupervisor::new(transport, options.liveness);
        let inner = Arc::new(ToolInner {
            supervisor,
            events,
            timeouts: options.timeouts,
            core_lib_root: options.core_lib_root,
            log_tailer: options.log_tailer,
        });
        tokio::spawn(forward_connection_events(Arc::downgrade(&inner), connection_events));
        (DeployTool { inner }, receiver)
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.inner.supervisor.phase().await
    }

    /// Connects in the background. On success the log tail and the status
    /// poller start and run until the connection ends.
    pub fn connect(&self, options: ConnectionOptions) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.supervisor.connect(&options).await {
                Ok(handle) => {
                    inner.emit(SessionEvent::Connected);
                    inner.start_background(handle);
                }
                Err(ConnectError::Aborted) => {
                    debug!("Connection attempt to {} was cancelled", options.host)
                }
                Err(err) => inner.emit(SessionEvent::ConnectFailed(err.to_string())),
            }
        })
    }

    pub async fn disconnect(&self) {
        self.inner.supervisor.disconnect().await;
        self.inner.emit(SessionEvent::Disconnected);
    }

    pub fn deploy(&self, project_folder: PathBuf) -> JoinHandle<()> {
        self.spawn_operation(Operation::Deploy, move |inner, handle| async move {
            let transfer = handle.lazy_transfer();
            let observer = EventObserver {
                events: inner.events.clone(),
            };
            let options = inner.timeouts.deploy_options(inner.core_lib_root.clone());
            DeploymentOrchestrator::new(&handle, &transfer, &observer, &options)
                .deploy(&project_folder)
                .await
                .map_err(|err| err.to_string())
        })
    }

    pub fn restart_program(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::RestartProgram, |inner, handle| async move {
            let observer = EventObserver {
                events: inner.events.clone(),
            };
            restart_program(&handle, &observer, inner.timeouts.program)
                .await
                .map_err(|err| err.to_string())
        })
    }

    pub fn shutdown(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::Shutdown, |inner, handle| async move {
            robot::shutdown(&handle, inner.timeouts.command)
                .await
                .map_err(|err| err.to_string())
        })
    }

    pub fn reboot(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::Reboot, |inner, handle| async move {
            robot::reboot(&handle, inner.timeouts.command)
                .await
                .map_err(|err| err.to_string())
        })
    }

    pub fn make_writable(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::MakeWritable, |inner, handle| async move {
            writable::make_writable(&handle, inner.timeouts.command).await;
            Ok(())
        })
    }

    pub fn make_readonly(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::MakeReadonly, |inner, handle| async move {
            writable::make_readonly(&handle, inner.timeouts.command).await;
            Ok(())
        })
    }

    pub fn read_network_settings(&self) -> JoinHandle<()> {
        self.spawn_operation(Operation::ReadNetwork, |inner, handle| async move {
            let settings = NetworkManager::new(&handle, inner.timeouts.command)
                .settings()
                .await
                .map_err(|err| err.to_string())?;
            inner.emit(SessionEvent::NetworkSettings(settings));
            Ok(())
        })
    }

    pub fn set_country(&self, code: String) -> JoinHandle<()> {
        self.spawn_operation(Operation::SetCountry, move |inner, handle| async move {
            let network = NetworkManager::new(&handle, inner.timeouts.command);
            network.set_country(&code).await.map_err(|err| err.to_string())?;
            let settings = network.settings().await.map_err(|err| err.to_string())?;
            inner.emit(SessionEvent::NetworkSettings(settings));
            Ok(())
        })
    }

    pub fn set_access_point(&self, access_point: AccessPoint) -> JoinHandle<()> {
        self.spawn_operation(Operation::SetAccessPoint, move |inner, handle| async move {
            NetworkManager::new(&handle, inner.timeouts.command)
                .set_access_point(&access_point)
                .await
                .map_err(|err| err.to_string())
        })
    }

    pub fn set_hostname(&self, hostname: String) -> JoinHandle<()> {
        self.spawn_operation(Operation::SetHostname, move |inner, handle| async move {
            NetworkManager::new(&handle, inner.timeouts.command)
                .set_hostname(&hostname)
                .await
                .map_err(|err| err.to_string())?;
            inner.emit(SessionEvent::RebootRequired);
            Ok(())
        })
    }

    fn spawn_operation<F, Fut>(&self, operation: Operation, body: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<ToolInner<T>>, ConnectionHandle<T::Session>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = match inner.supervisor.current().await {
                Some(handle) if handle.is_alive() => {
                    info!("Starting {}", operation);
                    body(inner.clone(), handle).await
                }
                _ => Err("Not connected to a robot.".to_string()),
            };
            if let Err(message) = &result {
                warn!("{} failed: {}", operation, message);
            }
            inner.emit(SessionEvent::OperationFinished { operation, result });
        })
    }
}

impl<T: RemoteTransport> ToolInner<T> {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, nobody is listening");
        }
    }

    fn start_background(&self, handle: ConnectionHandle<T::Session>) {
        let tailer = self.log_tailer.clone();
        let log_handle = handle.clone();
        let log_events = self.events.clone();
        tokio::spawn(async move {
            let alive = log_handle.clone();
            tailer
                .run(&log_handle, move || alive.is_alive(), |line| {
                    let _ = log_events.send(SessionEvent::LogText(line));
                })
                .await;
            debug!("Log tail of connection {} stopped", log_handle.id());
        });

        let poller = StatusPoller::new(self.timeouts.command);
        let status_events = self.events.clone();
        tokio::spawn(async move {
            let alive = handle.clone();
            poller
                .run(&handle, move || alive.is_alive(), |update| {
                    let event = match update {
                        StatusUpdate::Versions(versions) => SessionEvent::Versions(versions),
                        StatusUpdate::Report(report) => SessionEvent::Status(report),
                    };
                    let _ = status_events.send(event);
                })
                .await;
            debug!("Status polling of connection {} stopped", handle.id());
        });
    }
}

/// A lost connection is reported once and then torn down. There is no
/// automatic reconnect.
async fn forward_connection_events<T: RemoteTransport>(
    inner: Weak<ToolInner<T>>,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = connection_events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::Lost { connection_id } => {
                warn!("Lost connection {}", connection_id);
                inner.emit(SessionEvent::ConnectionLost);
                // a newer connection may already have replaced the lost one
                if inner.supervisor.phase().await == ConnectionPhase::Lost {
                    inner.supervisor.disconnect().await;
                }
            }
        }
    }
}
