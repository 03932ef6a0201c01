use std::{fmt, str::FromStr, time::Duration};

use bitflags::bitflags;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::{
    executor::{CommandError, RemoteExecutor},
    robot::scripts,
    shell::RemoteCommand,
    writable::{ensure_writable_then_restore, query_state},
};

static LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'([^']*)'|"([^"]*)"|(\d+)"#).expect("list item pattern is valid"));

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{0}")]
    Fatal(String),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WifiBands: u8 {
        const BAND_2_4GHZ = 0b01;
        const BAND_5GHZ = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiBand {
    /// 2.4 GHz, `g` on the wire.
    G,
    /// 5 GHz, `a` on the wire.
    A,
}

impl WifiBand {
    pub fn code(self) -> &'static str {
        match self {
            WifiBand::G => "g",
            WifiBand::A => "a",
        }
    }
}

impl fmt::Display for WifiBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WifiBand::G => "2.4GHz",
            WifiBand::A => "5.0GHz",
        })
    }
}

impl FromStr for WifiBand {
    type Err = NetworkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "g" | "2.4" | "2.4GHz" => Ok(WifiBand::G),
            "a" | "5" | "5.0" | "5.0GHz" => Ok(WifiBand::A),
            other => Err(NetworkError::InvalidSettings(format!("Unknown WiFi band `{}`.", other))),
        }
    }
}

/// Channels the robot's radio may use under the current regulatory domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiCapabilities {
    pub channels_2_4ghz: Vec<u32>,
    pub channels_5ghz: Vec<u32>,
}

impl WifiCapabilities {
    /// Parses `dt-wifi_caps.py` output: `2.4GHz: [..]`, `5.0GHz: [..]` and
    /// their `Disabled:` variants, whose channels are removed again.
    pub fn parse(output: &str) -> WifiCapabilities {
        let mut caps = WifiCapabilities::default();
        let mut disabled_2_4ghz = Vec::new();
        let mut disabled_5ghz = Vec::new();

        for line in output.lines().map(str::trim) {
            if let Some(list) = line.strip_prefix("2.4GHz Disabled:") {
                disabled_2_4ghz = parse_list(list);
            } else if let Some(list) = line.strip_prefix("5.0GHz Disabled:") {
                disabled_5ghz = parse_list(list);
            } else if let Some(list) = line.strip_prefix("2.4GHz:") {
                caps.channels_2_4ghz = parse_list(list);
            } else if let Some(list) = line.strip_prefix("5.0GHz:") {
                caps.channels_5ghz = parse_list(list);
            }
        }

        caps.channels_2_4ghz.retain(|channel| !disabled_2_4ghz.contains(channel));
        caps.channels_5ghz.retain(|channel| !disabled_5ghz.contains(channel));
        caps
    }

    pub fn bands(&self) -> WifiBands {
        let mut bands = WifiBands::empty();
        if !self.channels_2_4ghz.is_empty() {
            bands |= WifiBands::BAND_2_4GHZ;
        }
        if !self.channels_5ghz.is_empty() {
            bands |= WifiBands::BAND_5GHZ;
        }
        bands
    }

    pub fn channels(&self, band: WifiBand) -> &[u32] {
        match band {
            WifiBand::G => &self.channels_2_4ghz,
            WifiBand::A => &self.channels_5ghz,
        }
    }
}

/// Numbers from a list literal such as `['1', '6', '11']` or `[36, 40]`.
fn parse_list(list: &str) -> Vec<u32> {
    LIST_ITEM
        .captures_iter(list)
        .filter_map(|captures| {
            captures
                .iter()
                .skip(1)
                .flatten()
                .next()
                .and_then(|item| item.as_str().trim().parse().ok())
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub password: String,
    /// `None` lets the robot pick a channel.
    pub channel: Option<u32>,
    pub band: WifiBand,
}

impl AccessPoint {
    /// Four lines: ssid, password, channel (`0` = automatic), band code.
    pub fn parse(output: &str) -> Option<AccessPoint> {
        let mut lines = output.lines().map(str::trim);
        let ssid = lines.next()?.to_string();
        let password = lines.next()?.to_string();
        let channel = match lines.next()?.parse::<u32>().ok()? {
            0 => None,
            channel => Some(channel),
        };
        let band = lines.next()?.parse().ok()?;
        Some(AccessPoint {
            ssid,
            password,
            channel,
            band,
        })
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.ssid.chars().count() < 2 {
            return Err(NetworkError::InvalidSettings(
                "SSID must be at least 2 characters in length.".into(),
            ));
        }
        if self.password.chars().count() < 8 {
            return Err(NetworkError::InvalidSettings(
                "Password must be at least 8 characters in length.".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub hostname: String,
    pub access_point: Option<AccessPoint>,
    pub country: String,
    pub capabilities: WifiCapabilities,
}

/// Reads and changes the robot's hostname and WiFi access point.
pub struct NetworkManager<'a, E: RemoteExecutor + ?Sized> {
    executor: &'a E,
    timeout: Duration,
}

impl<'a, E: RemoteExecutor + ?Sized> NetworkManager<'a, E> {
    pub fn new(executor: &'a E, timeout: Duration) -> Self {
        NetworkManager { executor, timeout }
    }

    pub async fn settings(&self) -> Result<NetworkSettings, NetworkError> {
        Ok(NetworkSettings {
            hostname: self.hostname().await?,
            access_point: self.access_point().await?,
            country: self.country().await?,
            capabilities: self.capabilities().await?,
        })
    }

    pub async fn hostname(&self) -> Result<String, NetworkError> {
        self.first_line(scripts::HOSTNAME).await
    }

    pub async fn access_point(&self) -> Result<Option<AccessPoint>, NetworkError> {
        let result = self.executor.execute(scripts::WIFI_AP, self.timeout).await?;
        Ok(AccessPoint::parse(&result.stdout_lossy()))
    }

    pub async fn country(&self) -> Result<String, NetworkError> {
        self.first_line(scripts::WIFI_REGDOM).await
    }

    pub async fn capabilities(&self) -> Result<WifiCapabilities, NetworkError> {
        let result = self.executor.execute(scripts::WIFI_CAPS, self.timeout).await?;
        Ok(WifiCapabilities::parse(&result.stdout_lossy()))
    }

    /// Changes the regulatory domain and returns the channels valid under it.
    pub async fn set_country(&self, code: &str) -> Result<WifiCapabilities, NetworkError> {
        info!("Changing WiFi country to {}", code);
        let mut command = RemoteCommand::new(scripts::WIFI_REGDOM);
        command.arg(code);
        self.executor.execute(&command.render(), self.timeout).await?;
        self.capabilities().await
    }

    /// The script makes the root writable itself and may drop the WiFi link
    /// while applying, so it runs under `nohup` and is not awaited further.
    pub async fn set_access_point(&self, access_point: &AccessPoint) -> Result<(), NetworkError> {
        access_point.validate()?;
        info!("Changing WiFi access point to {}", access_point.ssid);
        let mut command = RemoteCommand::new(scripts::WIFI_AP);
        command
            .arg(access_point.ssid.as_str())
            .arg(access_point.password.as_str())
            .arg(access_point.channel.unwrap_or(0).to_string())
            .arg(access_point.band.code())
            .quiet();
        self.executor.execute(&command.render(), self.timeout).await?;
        Ok(())
    }

    /// Takes effect after a reboot.
    pub async fn set_hostname(&self, hostname: &str) -> Result<(), NetworkError> {
        if hostname.trim().is_empty() {
            return Err(NetworkError::InvalidSettings("Hostname must not be empty.".into()));
        }
        info!("Changing hostname to {}", hostname);
        let original = query_state(self.executor, self.timeout).await;
        let mut command = RemoteCommand::new(scripts::HOSTNAME);
        command.arg(hostname).quiet();
        let command = command.render();

        ensure_writable_then_restore(self.executor, original, self.timeout, || async {
            self.executor.execute(&command, self.timeout).await?;
            Ok(())
        })
        .await
    }

    async fn first_line(&self, command: &str) -> Result<String, NetworkError> {
        let result = self.executor.execute(command, self.timeout).await?;
        Ok(result.stdout_lines().into_iter().next().unwrap_or_default())
    }
}
