use std::time::Duration;

use tracing::debug;

use crate::{
    executor::RemoteExecutor,
    robot::{self, RobotVersions},
    writable::{query_state, WritableState},
};

/// One sample of the robot's load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    pub cpu_idle_percent: f64,
    pub mem_used_kb: u64,
    pub mem_avail_kb: u64,
    pub writable_state: WritableState,
}

impl StatusReport {
    pub fn cpu_usage_percent(&self) -> f64 {
        (100.0 - self.cpu_idle_percent).clamp(0.0, 100.0)
    }
}

/// What the poller hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Versions(RobotVersions),
    Report(StatusReport),
}

#[derive(Debug, Clone)]
pub struct StatusPoller {
    period: Duration,
    command_timeout: Duration,
}

impl StatusPoller {
    pub fn new(command_timeout: Duration) -> StatusPoller {
        StatusPoller {
            period: Duration::from_secs(1),
            command_timeout,
        }
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub async fn sample<E>(&self, executor: &E) -> Option<StatusReport>
    where
        E: RemoteExecutor + ?Sized,
    {
        let cpu_idle_percent = robot::idle_cpu(executor, self.command_timeout).await.ok()?;
        let memory = robot::memory(executor, self.command_timeout).await.ok()?;
        let writable_state = query_state(executor, self.command_timeout).await;
        Some(StatusReport {
            cpu_idle_percent,
            mem_used_kb: memory.used_kb,
            mem_avail_kb: memory.available_kb,
            writable_state,
        })
    }

    /// Reads the versions once, then samples every period until
    /// `is_connected` turns false. Failed reads are skipped.
    pub async fn run<E, C, S>(&self, executor: &E, is_connected: C, mut sink: S)
    where
        E: RemoteExecutor + ?Sized,
        C: Fn() -> bool,
        S: FnMut(StatusUpdate),
    {
        match robot::versions(executor, self.command_timeout).await {
            Ok(versions) => sink(StatusUpdate::Versions(versions)),
            Err(err) => debug!("Could not read robot versions: {}", err),
        }

        let mut interval = tokio::time::interval(self.period);
        while is_connected() {
            interval.tick().await;
            if !is_connected() {
                break;
            }
            match self.sample(executor).await {
                Some(report) => sink(StatusUpdate::Report(report)),
                None => debug!("Status sample skipped"),
            }
        }
    }
}
