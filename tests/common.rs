#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use robodeploy::{
    connection::{ConnectError, ConnectionOptions, Credential, RemoteSession, RemoteTransport},
    deploy::DeployObserver,
    executor::{CommandError, LineStream, RemoteCommandResult, RemoteExecutor},
    transfer::{FileTransfer, TransferError},
};
use testcontainers::{core::ContainerPort, runners::AsyncRunner, ContainerAsync, GenericImage};

pub const READ_ONLY_MOUNT: &str = "/dev/mmcblk0p2 on / type ext4 (ro,noatime)\n";
pub const READ_WRITE_MOUNT: &str = "/dev/mmcblk0p2 on / type ext4 (rw,noatime)\n";

/// How the fake robot answers a command.
#[derive(Debug, Clone)]
pub enum Reply {
    Exit(u32, String),
    Fail(String),
    /// Never answers; the caller's timeout or cancellation has to end it.
    Hang,
}

pub fn ok(stdout: &str) -> Reply {
    Reply::Exit(0, stdout.to_string())
}

/// How the fake robot answers one follow command.
#[derive(Debug, Clone)]
enum Follow {
    /// Yields the lines, then ends.
    Lines(Vec<String>),
    /// The channel cannot be opened.
    Refused(String),
    /// Yields the lines, then the channel fails.
    Broken(Vec<String>, String),
}

/// Scripted remote side shared by the fake session, transfer and transport.
/// Commands, transfer operations and observer callbacks all land in one
/// journal so their relative order can be checked.
#[derive(Default)]
pub struct FakeRobot {
    rules: Mutex<Vec<(String, Reply)>>,
    follows: Mutex<VecDeque<Follow>>,
    journal: Mutex<Vec<String>>,
    dirs: Mutex<BTreeSet<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    denied: Mutex<Vec<String>>,
    closed: AtomicBool,
    transfer_refused: AtomicBool,
}

impl FakeRobot {
    pub fn new() -> Arc<FakeRobot> {
        let robot = FakeRobot::default();
        robot.add_dir("/tmp");
        Arc::new(robot)
    }

    /// Commands containing `pattern` get `reply`. Later rules win.
    pub fn on(&self, pattern: &str, reply: Reply) {
        self.rules.lock().unwrap().push((pattern.to_string(), reply));
    }

    /// Lines the next follow command yields before it ends.
    pub fn push_follow(&self, lines: &[&str]) {
        self.follows.lock().unwrap().push_back(Follow::Lines(owned(lines)));
    }

    /// The next follow command fails to open.
    pub fn push_follow_refused(&self, message: &str) {
        self.follows.lock().unwrap().push_back(Follow::Refused(message.to_string()));
    }

    /// The next follow command yields `lines`, then fails with `message`.
    pub fn push_follow_broken(&self, lines: &[&str], message: &str) {
        self.follows
            .lock()
            .unwrap()
            .push_back(Follow::Broken(owned(lines), message.to_string()));
    }

    pub fn note(&self, entry: impl Into<String>) {
        self.journal.lock().unwrap().push(entry.into());
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.journal().iter().filter(|entry| entry.contains(pattern)).count()
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.to_string());
    }

    /// Uploads to paths containing `pattern` fail.
    pub fn deny_put(&self, pattern: &str) {
        self.denied.lock().unwrap().push(pattern.to_string());
    }

    pub fn dirs(&self) -> BTreeSet<String> {
        self.dirs.lock().unwrap().clone()
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.files.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|content| String::from_utf8_lossy(content).into_owned())
    }

    /// Opening a file transfer channel fails from now on.
    pub fn refuse_transfer(&self) {
        self.transfer_refused.store(true, Ordering::SeqCst);
    }

    pub fn drop_transport(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn reply_for(&self, command: &str) -> Reply {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or_else(|| ok(""), |(_, reply)| reply.clone())
    }
}

fn owned(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| line.to_string()).collect()
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}

#[async_trait]
impl RemoteExecutor for FakeRobot {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError> {
        self.note(command);
        let reply = self.reply_for(command);
        let answer = async move {
            match reply {
                Reply::Exit(exit_code, stdout) => Ok(RemoteCommandResult {
                    exit_code,
                    stdout: stdout.into_bytes(),
                    stderr: Vec::new(),
                }),
                Reply::Fail(message) => Err(CommandError::Channel(message)),
                Reply::Hang => std::future::pending().await,
            }
        };
        tokio::time::timeout(timeout, answer)
            .await
            .unwrap_or_else(|_| {
                Err(CommandError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            })
    }

    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError> {
        self.note(command);
        let follow = self.follows.lock().unwrap().pop_front();
        match follow {
            Some(Follow::Lines(lines)) => {
                Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
            }
            Some(Follow::Refused(message)) => Err(CommandError::Channel(message)),
            Some(Follow::Broken(lines, message)) => {
                let failure = std::iter::once(Err(CommandError::Channel(message)));
                Ok(futures::stream::iter(lines.into_iter().map(Ok).chain(failure)).boxed())
            }
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// In-memory remote filesystem. Parents must exist, as with SFTP.
#[derive(Clone)]
pub struct FakeTransfer {
    pub robot: Arc<FakeRobot>,
}

#[async_trait]
impl FileTransfer for FakeTransfer {
    async fn is_dir(&self, remote_path: &str) -> Result<bool, TransferError> {
        Ok(self.robot.dirs.lock().unwrap().contains(remote_path))
    }

    async fn create_dir(&self, remote_path: &str) -> Result<(), TransferError> {
        self.robot.note(format!("mkdir {}", remote_path));
        let mut dirs = self.robot.dirs.lock().unwrap();
        let parent = parent_of(remote_path);
        if parent != "/" && !dirs.contains(parent) {
            return Err(TransferError::remote(remote_path, "no such parent"));
        }
        dirs.insert(remote_path.to_string());
        Ok(())
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), TransferError> {
        self.robot.note(format!("put {}", remote_path));
        let denied = self.robot.denied.lock().unwrap().clone();
        if denied.iter().any(|pattern| remote_path.contains(pattern.as_str())) {
            return Err(TransferError::remote(remote_path, "permission denied"));
        }
        if !self.robot.dirs.lock().unwrap().contains(parent_of(remote_path)) {
            return Err(TransferError::remote(remote_path, "no such parent"));
        }
        let content = tokio::fs::read(local_path).await.map_err(|source| TransferError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        self.robot.files.lock().unwrap().insert(remote_path.to_string(), content);
        Ok(())
    }

    async fn read_dir(&self, remote_dir: &str) -> Result<Vec<String>, TransferError> {
        let remote_dir = remote_dir.trim_end_matches('/');
        let mut names = vec!["..".to_string(), ".".to_string()];
        let dirs = self.robot.dirs.lock().unwrap().clone();
        let files = self.robot.files.lock().unwrap().keys().cloned().collect::<Vec<_>>();
        // reverse order, so callers cannot rely on the server sorting
        for path in dirs.iter().chain(files.iter()).rev() {
            if parent_of(path) == remote_dir {
                if let Some((_, name)) = path.rsplit_once('/') {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

pub struct FakeSession {
    pub robot: Arc<FakeRobot>,
    pub closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteExecutor for FakeSession {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteCommandResult, CommandError> {
        self.robot.execute(command, timeout).await
    }

    async fn stream_follow(&self, command: &str) -> Result<LineStream, CommandError> {
        self.robot.stream_follow(command).await
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    type Transfer = FakeTransfer;

    async fn open_transfer(&self) -> Result<FakeTransfer, TransferError> {
        self.robot.note("open transfer");
        if self.robot.transfer_refused.load(Ordering::SeqCst) {
            return Err(TransferError::Session("subsystem request failed".into()));
        }
        Ok(FakeTransfer {
            robot: self.robot.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.robot.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    pub robot: Arc<FakeRobot>,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// How long an open takes.
    pub open_delay: Duration,
    pub refuse: bool,
}

impl FakeTransport {
    pub fn new(robot: Arc<FakeRobot>) -> FakeTransport {
        FakeTransport {
            robot,
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
            refuse: false,
        }
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    type Session = FakeSession;

    async fn open(&self, _options: &ConnectionOptions) -> Result<FakeSession, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.refuse {
            return Err(ConnectError::Auth("wrong password".into()));
        }
        Ok(FakeSession {
            robot: self.robot.clone(),
            closes: self.closes.clone(),
        })
    }
}

pub fn connection_options() -> ConnectionOptions {
    ConnectionOptions {
        host: "robot.local".into(),
        port: 22,
        username: "arpirobot".into(),
        credential: Credential::Password("arpirobot".into()),
        connect_timeout: Duration::from_secs(3),
        operation_timeout: Duration::from_secs(3),
    }
}

/// Writes progress messages to the robot's journal as `progress: ...` and
/// log clears as `clear-log`.
pub struct JournalObserver {
    pub robot: Arc<FakeRobot>,
}

impl DeployObserver for JournalObserver {
    fn progress(&self, message: &str) {
        self.robot.note(format!("progress: {}", message));
    }

    fn clear_log(&self) {
        self.robot.note("clear-log");
    }
}

/// Writes `files` (relative path, content) below `root`.
pub async fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (relative, content) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("Could not create local dirs");
        }
        tokio::fs::write(&path, content).await.expect("Could not write local file");
    }
}

pub struct SshContainer {
    pub port: u16,
    _container: ContainerAsync<GenericImage>,
}

impl SshContainer {
    pub async fn start() -> SshContainer {
        let container = GenericImage::new("ssh_server", "latest")
            .with_exposed_port(ContainerPort::Tcp(22))
            .start()
            .await
            .expect("Could not start SSH container");
        let ports = container.ports().await.expect("Could not get SSH container ports");
        let port = ports
            .map_to_host_port_ipv4(ContainerPort::Tcp(22))
            .expect("Could not get SSH container port corresponding to 22");
        tokio::time::sleep(Duration::from_millis(100)).await;

        SshContainer {
            port,
            _container: container,
        }
    }

    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: "localhost".into(),
            port: self.port,
            username: "root".into(),
            credential: Credential::Password("root123".into()),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

pub fn tmp_remote_path() -> String {
    format!("/tmp/{}", uuid::Uuid::new_v4())
}

pub fn local_path(root: &Path, relative: &str) -> PathBuf {
    root.join(relative)
}
