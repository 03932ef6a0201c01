use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::deploy::DeployOptions;

/// Directory below the home directory holding everything the tool keeps locally.
pub const DATA_DIR: &str = ".arpirobot";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no home directory")]
    NoHome,
}

/// User preferences, persisted as JSON. Unknown keys are ignored and missing
/// ones take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub robot_address: String,
    pub robot_user: String,
    pub longer_timeouts: bool,
    pub last_project_folder: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            robot_address: "192.168.10.1".into(),
            robot_user: "arpirobot".into(),
            longer_timeouts: false,
            last_project_folder: String::new(),
        }
    }
}

impl Settings {
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        Ok(data_dir()?.join("deploytool.json"))
    }

    /// A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Settings, SettingsError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                Ok(Settings::default())
            }
            Err(source) => Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let io_error = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_error)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::new(self.longer_timeouts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub command: Duration,
    pub connect: Duration,
    /// Stopping and starting the program can take a while on its own.
    pub program: Duration,
}

impl Timeouts {
    pub fn new(longer: bool) -> Timeouts {
        let (command, connect) = if longer { (5, 8) } else { (3, 3) };
        Timeouts {
            command: Duration::from_secs(command),
            connect: Duration::from_secs(connect),
            program: Duration::from_secs(10),
        }
    }

    pub fn deploy_options(&self, core_lib_root: PathBuf) -> DeployOptions {
        DeployOptions::new(self.command, core_lib_root)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts::new(false)
    }
}

fn data_dir() -> Result<PathBuf, SettingsError> {
    dirs::home_dir().map(|home| home.join(DATA_DIR)).ok_or(SettingsError::NoHome)
}

/// Local copy of the support library that `coreLibFiles` globs resolve against.
pub fn default_core_lib_root() -> Result<PathBuf, SettingsError> {
    Ok(data_dir()?.join("corelib"))
}

/// Contents of `version.txt` in the support library, if it is installed.
pub async fn core_lib_version(core_lib_root: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(core_lib_root.join("version.txt")).await.ok()?;
    let version = content.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}
