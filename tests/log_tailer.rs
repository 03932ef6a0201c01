use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use common::FakeRobot;
use robodeploy::log_tail::LogTailer;

mod common;

#[tokio::test(start_paused = true)]
async fn reissues_follow_after_stream_ends() {
    let robot = FakeRobot::new();
    robot.push_follow(&["a\n", "b\n"]);
    robot.push_follow(&["partial"]);
    robot.push_follow(&["c\n"]);

    let connected = AtomicBool::new(true);
    let received = Mutex::new(Vec::new());
    LogTailer::default()
        .retry_delay(Duration::from_millis(200))
        .run(
            robot.as_ref(),
            || connected.load(Ordering::SeqCst),
            |line| {
                if line == "c\n" {
                    connected.store(false, Ordering::SeqCst);
                }
                received.lock().unwrap().push(line);
            },
        )
        .await;

    assert_eq!(
        received.into_inner().unwrap(),
        vec!["a\n", "b\n", "partial", "\n", "c\n"]
    );
    assert_eq!(robot.count("tail -f -n +1 /tmp/arpirobot_program.log"), 3);
}

#[tokio::test(start_paused = true)]
async fn retries_after_channel_errors() {
    let robot = FakeRobot::new();
    robot.push_follow_refused("channel open failed");
    robot.push_follow_broken(&["x\n"], "connection reset");
    robot.push_follow(&["y\n"]);

    let connected = AtomicBool::new(true);
    let received = Mutex::new(Vec::new());
    LogTailer::default()
        .run(
            robot.as_ref(),
            || connected.load(Ordering::SeqCst),
            |line| {
                if line == "y\n" {
                    connected.store(false, Ordering::SeqCst);
                }
                received.lock().unwrap().push(line);
            },
        )
        .await;

    assert_eq!(received.into_inner().unwrap(), vec!["x\n", "y\n"]);
    assert_eq!(robot.count("tail -f -n +1 /tmp/arpirobot_program.log"), 3);
}

#[tokio::test]
async fn does_nothing_when_disconnected() {
    let robot = FakeRobot::new();
    robot.push_follow(&["a\n"]);

    let mut received = Vec::new();
    LogTailer::new("/var/log/robot.log")
        .run(robot.as_ref(), || false, |line| received.push(line))
        .await;

    assert!(received.is_empty());
    assert!(robot.journal().is_empty());
}

#[test]
fn follow_command_quotes_the_path() {
    assert_eq!(
        LogTailer::new("/tmp/my robot.log").command(),
        "tail -f -n +1 '/tmp/my robot.log'"
    );
}
