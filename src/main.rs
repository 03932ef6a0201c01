use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use robodeploy::{
    app::{DeployTool, Operation, SessionEvent, ToolOptions},
    connection::{ConnectionOptions, Credential},
    network::{AccessPoint, NetworkSettings, WifiBand},
    settings::{self, Settings},
    ssh_russh::RusshTransport,
    status::StatusReport,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Deploys, monitors and configures an ArPiRobot")]
struct Cli {
    /// Robot address, defaults to the saved one
    #[arg(long)]
    address: Option<String>,
    #[arg(long, default_value_t = 22)]
    port: u16,
    /// SSH user, defaults to the saved one
    #[arg(long)]
    user: Option<String>,
    #[arg(long, env = "ROBODEPLOY_PASSWORD", default_value = "arpirobot", hide_env_values = true)]
    password: String,
    /// Private key to authenticate with instead of the password
    #[arg(long)]
    key: Option<PathBuf>,
    /// Settings file, defaults to ~/.arpirobot/deploytool.json
    #[arg(long)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a project folder, defaults to the last deployed one
    Deploy { folder: Option<PathBuf> },
    /// Follow the robot program's log
    Log,
    /// Print versions and load every second
    Status,
    /// Restart the robot program
    Restart,
    Shutdown,
    Reboot,
    /// Remount the root filesystem read-write
    Writable,
    /// Remount the root filesystem read-only
    Readonly,
    /// Print hostname and WiFi settings
    Network,
    Hostname { name: String },
    Wifi {
        ssid: String,
        psk: String,
        /// 0 picks a channel automatically
        #[arg(long, default_value_t = 0)]
        channel: u32,
        #[arg(long, default_value = "g")]
        band: WifiBand,
    },
    /// Set the WiFi regulatory domain
    Country { code: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("robodeploy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let settings_path = match cli.settings.clone() {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load(&settings_path).await?;
    let timeouts = settings.timeouts();

    let deploy_folder = match &cli.command {
        Command::Deploy { folder } => Some(match folder {
            Some(folder) => folder.clone(),
            None if !settings.last_project_folder.is_empty() => {
                PathBuf::from(&settings.last_project_folder)
            }
            None => bail!("No project folder given and none deployed before"),
        }),
        _ => None,
    };

    let credential = match &cli.key {
        Some(path) => {
            let key_pair = russh_keys::load_secret_key(path, None)
                .with_context(|| format!("Could not load key {}", path.display()))?;
            Credential::KeyPair(Arc::new(key_pair))
        }
        None => Credential::Password(cli.password.clone()),
    };
    let options = ConnectionOptions {
        host: cli.address.clone().unwrap_or_else(|| settings.robot_address.clone()),
        port: cli.port,
        username: cli.user.clone().unwrap_or_else(|| settings.robot_user.clone()),
        credential,
        connect_timeout: timeouts.connect,
        operation_timeout: timeouts.command,
    };

    let core_lib_root = settings::default_core_lib_root()?;
    if settings::core_lib_version(&core_lib_root).await.is_none() {
        tracing::warn!("No support library installed at {}", core_lib_root.display());
    }
    let tool_options = ToolOptions::new(timeouts, core_lib_root);
    let (tool, mut events) = DeployTool::new(RusshTransport::default(), tool_options);

    tool.connect(options).await.context("connect task failed")?;
    wait_connected(&mut events).await?;

    let outcome = match cli.command {
        Command::Log => follow(&mut events, true).await,
        Command::Status => follow(&mut events, false).await,
        Command::Deploy { .. } => {
            let folder = deploy_folder.ok_or_else(|| anyhow!("missing project folder"))?;
            settings.last_project_folder = folder.to_string_lossy().into_owned();
            run(tool.deploy(folder), &mut events).await
        }
        Command::Restart => run(tool.restart_program(), &mut events).await,
        Command::Shutdown => run(tool.shutdown(), &mut events).await,
        Command::Reboot => run(tool.reboot(), &mut events).await,
        Command::Writable => run(tool.make_writable(), &mut events).await,
        Command::Readonly => run(tool.make_readonly(), &mut events).await,
        Command::Network => run(tool.read_network_settings(), &mut events).await,
        Command::Hostname { name } => run(tool.set_hostname(name), &mut events).await,
        Command::Wifi {
            ssid,
            psk,
            channel,
            band,
        } => {
            let access_point = AccessPoint {
                ssid,
                password: psk,
                channel: (channel != 0).then_some(channel),
                band,
            };
            run(tool.set_access_point(access_point), &mut events).await
        }
        Command::Country { code } => run(tool.set_country(code), &mut events).await,
    };

    tool.disconnect().await;
    if outcome.is_ok() {
        settings.save(&settings_path).await?;
    }
    outcome
}

async fn wait_connected(events: &mut UnboundedReceiver<SessionEvent>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected => return Ok(()),
            SessionEvent::ConnectFailed(message) => {
                bail!("Failed to connect to the robot: {}", message)
            }
            _ => {}
        }
    }
    bail!("event channel closed")
}

/// Prints events until the operation reports back.
async fn run(
    task: JoinHandle<()>,
    events: &mut UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<()> {
    task.await.context("operation task failed")?;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::OperationFinished { operation, result } => {
                result.map_err(|message| anyhow!("{} failed: {}", operation, message))?;
                if operation == Operation::Deploy {
                    println!("Deploy finished.");
                }
                return Ok(());
            }
            SessionEvent::ConnectionLost => bail!("Lost connection to the robot"),
            event => print_event(event, false),
        }
    }
    bail!("event channel closed")
}

async fn follow(
    events: &mut UnboundedReceiver<SessionEvent>,
    show_log: bool,
) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::ConnectionLost) => bail!("Lost connection to the robot"),
                Some(event) => print_event(event, show_log),
                None => bail!("event channel closed"),
            },
            _ = &mut ctrl_c => return Ok(()),
        }
    }
}

fn print_event(event: SessionEvent, show_log: bool) {
    match event {
        SessionEvent::Progress(message) => eprintln!("{}", message),
        SessionEvent::LogText(text) if show_log => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::Versions(versions) if !show_log => {
            println!("Image version:  {}", versions.image);
            println!("Python version: {}", versions.python);
            if let Some(extra) = versions.extra {
                println!("                {}", extra);
            }
        }
        SessionEvent::Status(report) if !show_log => print_status(&report),
        SessionEvent::NetworkSettings(settings) => print_network(&settings),
        SessionEvent::RebootRequired => {
            println!("The hostname was changed. Reboot the robot for it to take effect.")
        }
        _ => {}
    }
}

fn print_status(report: &StatusReport) {
    println!(
        "CPU {:5.1}%  memory {} / {} kB  filesystem {}",
        report.cpu_usage_percent(),
        report.mem_used_kb,
        report.mem_used_kb + report.mem_avail_kb,
        report.writable_state
    );
}

fn print_network(settings: &NetworkSettings) {
    println!("Hostname: {}", settings.hostname);
    println!("Country:  {}", settings.country);
    match &settings.access_point {
        Some(ap) => {
            let channel = ap
                .channel
                .map_or_else(|| "auto".to_string(), |channel| channel.to_string());
            println!("SSID:     {}", ap.ssid);
            println!("Band:     {}", ap.band);
            println!("Channel:  {}", channel);
        }
        None => println!("Access point settings unavailable"),
    }
    let caps = &settings.capabilities;
    println!("2.4GHz channels: {:?}", caps.channels_2_4ghz);
    println!("5.0GHz channels: {:?}", caps.channels_5ghz);
}
