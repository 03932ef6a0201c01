//! Runs the russh backend. Apart from the refused connection, these need
//! the `ssh_server` test image, so they are ignored by default:
//! `cargo test -- --ignored`.

use std::time::Duration;

use common::{connection_options, tmp_remote_path, write_tree, SshContainer};
use futures::StreamExt;
use robodeploy::{
    connection::{ConnectError, Credential, RemoteSession, RemoteTransport},
    executor::{CommandError, RemoteExecutor},
    ssh_russh::RusshTransport,
    transfer::FileTransfer,
};

mod common;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn refused_connection_is_a_socket_error() {
    // a port that was just released has nothing listening on it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Could not bind");
    let port = listener.local_addr().expect("Could not get local address").port();
    drop(listener);

    let mut options = connection_options();
    options.host = "127.0.0.1".into();
    options.port = port;

    let outcome = RusshTransport::default().open(&options).await;
    assert!(matches!(outcome, Err(ConnectError::Socket(_))));
}

#[tokio::test]
#[ignore]
async fn execute_collects_output_and_status() {
    let container = SshContainer::start().await;
    let session = RusshTransport::default()
        .open(&container.options())
        .await
        .expect("Could not connect");

    let result = session
        .execute("echo out; echo err >&2; exit 3", TIMEOUT)
        .await
        .expect("Could not execute");
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout_lossy(), "out\n");
    assert_eq!(String::from_utf8_lossy(&result.stderr), "err\n");

    let timed_out = session.execute("sleep 10", Duration::from_millis(200)).await;
    assert!(matches!(timed_out, Err(CommandError::Timeout { .. })));

    session.close().await;
    assert!(session.is_closed());
}

#[tokio::test]
#[ignore]
async fn wrong_password_is_an_auth_error() {
    let container = SshContainer::start().await;
    let mut options = container.options();
    options.credential = Credential::Password("wrong".into());

    let outcome = RusshTransport::default().open(&options).await;
    assert!(matches!(outcome, Err(ConnectError::Auth(_))));
}

#[tokio::test]
#[ignore]
async fn follow_yields_lines_as_they_arrive() {
    let container = SshContainer::start().await;
    let session = RusshTransport::default()
        .open(&container.options())
        .await
        .expect("Could not connect");

    let lines: Vec<String> = session
        .stream_follow("printf 'one\\ntwo\\nthree'")
        .await
        .expect("Could not follow")
        .map(|line| line.expect("Follow failed"))
        .collect()
        .await;
    assert_eq!(lines, vec!["one\n", "two\n", "three"]);
}

#[tokio::test]
#[ignore]
async fn directory_upload_over_sftp() {
    let container = SshContainer::start().await;
    let session = RusshTransport::default()
        .open(&container.options())
        .await
        .expect("Could not connect");
    let transfer = session.open_transfer().await.expect("Could not open SFTP");

    let local = tempfile::tempdir().unwrap();
    write_tree(local.path(), &[("proj/main.py", "main"), ("proj/robot/drive.py", "drive")]).await;
    let remote = tmp_remote_path();
    transfer.mkdir_recursive(&remote).await.expect("Could not create remote dir");

    transfer
        .upload_directory(&local.path().join("proj"), &remote)
        .await
        .expect("Could not upload");

    let listing = transfer
        .list_directory(&format!("{}/proj", remote))
        .await
        .expect("Could not list");
    assert_eq!(listing, vec!["main.py", "robot"]);

    let content = session
        .execute(&format!("cat {}/proj/robot/drive.py", remote), TIMEOUT)
        .await
        .expect("Could not read back");
    assert_eq!(content.stdout_lossy(), "drive");
}
