//! Fixed remote surface of the robot image: helper script names, well-known
//! paths and the simple queries built on them.

use std::time::Duration;

use tracing::info;

use crate::{
    executor::{CommandError, RemoteExecutor},
    shell::RemoteCommand,
};

pub mod scripts {
    pub const STOP_PROGRAM: &str = "dt-stop_program.sh";
    pub const DELETE_PROGRAM: &str = "dt-delete_program.sh";
    pub const UPDATE_PROGRAM: &str = "dt-update_program.sh";
    pub const START_PROGRAM: &str = "dt-start_program.sh";
    pub const GET_VERSIONS: &str = "dt-getversions.sh";
    pub const GET_IDLE_CPU: &str = "dt-getidlecpu.sh";
    pub const GET_MEMINFO: &str = "dt-getmeminfo.sh";
    pub const MAKE_WRITABLE: &str = "dt-rw.sh";
    pub const MAKE_READONLY: &str = "dt-ro.sh";
    pub const SHUTDOWN: &str = "dt-shutdown.sh";
    pub const REBOOT: &str = "dt-reboot.sh";
    pub const HOSTNAME: &str = "dt-hostname.sh";
    pub const WIFI_AP: &str = "dt-wifi_ap.sh";
    pub const WIFI_REGDOM: &str = "dt-wifi_regdom.sh";
    pub const WIFI_CAPS: &str = "dt-wifi_caps.py";
}

/// Scratch directory uploads land in before `dt-update_program.sh` applies them.
pub const STAGING_DIR: &str = "/tmp/robot_proj";

/// Log file the robot program writes to.
pub const PROGRAM_LOG: &str = "/tmp/arpirobot_program.log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotVersions {
    pub image: String,
    pub python: String,
    pub extra: Option<String>,
}

impl RobotVersions {
    pub fn parse(output: &str) -> RobotVersions {
        let mut lines = output.lines().map(str::trim);
        RobotVersions {
            image: lines.next().unwrap_or_default().to_string(),
            python: lines.next().unwrap_or_default().to_string(),
            extra: lines.next().filter(|line| !line.is_empty()).map(str::to_string),
        }
    }
}

/// Used and available memory in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_kb: u64,
    pub available_kb: u64,
}

impl MemoryUsage {
    /// Two integers on separate lines; anything else reads as zero usage.
    pub fn parse(output: &str) -> MemoryUsage {
        let mut lines = output.lines().map(|line| line.trim().parse::<u64>());
        match (lines.next(), lines.next()) {
            (Some(Ok(used_kb)), Some(Ok(available_kb))) => MemoryUsage { used_kb, available_kb },
            _ => MemoryUsage::default(),
        }
    }
}

pub fn parse_idle_cpu(output: &str) -> f64 {
    output
        .lines()
        .next()
        .and_then(|line| line.trim().parse().ok())
        .unwrap_or(0.0)
}

pub async fn versions<E>(executor: &E, timeout: Duration) -> Result<RobotVersions, CommandError>
where
    E: RemoteExecutor + ?Sized,
{
    let result = executor.execute(scripts::GET_VERSIONS, timeout).await?;
    Ok(RobotVersions::parse(&result.stdout_lossy()))
}

pub async fn idle_cpu<E>(executor: &E, timeout: Duration) -> Result<f64, CommandError>
where
    E: RemoteExecutor + ?Sized,
{
    let result = executor.execute(scripts::GET_IDLE_CPU, timeout).await?;
    Ok(parse_idle_cpu(&result.stdout_lossy()))
}

pub async fn memory<E>(executor: &E, timeout: Duration) -> Result<MemoryUsage, CommandError>
where
    E: RemoteExecutor + ?Sized,
{
    let result = executor.execute(scripts::GET_MEMINFO, timeout).await?;
    Ok(MemoryUsage::parse(&result.stdout_lossy()))
}

pub async fn shutdown<E>(executor: &E, timeout: Duration) -> Result<(), CommandError>
where
    E: RemoteExecutor + ?Sized,
{
    info!("Shutting down the robot");
    let command = RemoteCommand::new(scripts::SHUTDOWN).background().render();
    executor.execute(&command, timeout).await.map(|_| ())
}

pub async fn reboot<E>(executor: &E, timeout: Duration) -> Result<(), CommandError>
where
    E: RemoteExecutor + ?Sized,
{
    info!("Rebooting the robot");
    let command = RemoteCommand::new(scripts::REBOOT).background().render();
    executor.execute(&command, timeout).await.map(|_| ())
}
