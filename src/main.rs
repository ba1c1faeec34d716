use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use onvif_camera_manager::{CameraManager, Credentials, ManagerConfig};

#[derive(Parser, Debug)]
#[command(name = "camera-manager")]
#[command(about = "Discover, register and monitor ONVIF cameras")]
struct Args {
    /// Configuration file (TOML, or JSON when the name ends in .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the local network once and register every new device
    Discover,
    /// Register a camera by address
    Add {
        address: String,
        #[arg(short, long, default_value_t = 80)]
        port: u16,
        #[arg(short, long, requires = "password")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        password: Option<String>,
    },
    /// Print every registered camera with its current status
    List,
    /// Remove a camera by id
    Remove { id: String },
    /// Run discovery and health polling until Ctrl-C, printing fleet stats
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onvif_camera_manager=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let manager = CameraManager::global().await;
    manager
        .initialize(config.clone())
        .await
        .context("failed to initialize camera manager")?;

    let outcome = run(manager, &config, args.command).await;
    manager.shutdown().await;
    outcome
}

fn load_config(path: &str) -> Result<ManagerConfig> {
    if !Path::new(path).exists() {
        warn!("Could not find {}, using default configuration", path);
        return Ok(ManagerConfig::default());
    }
    ManagerConfig::load(path).with_context(|| format!("invalid configuration in {}", path))
}

async fn run(manager: &CameraManager, config: &ManagerConfig, command: Command) -> Result<()> {
    match command {
        Command::Discover => {
            let registered = manager.discover_and_register().await;
            info!("Registered {} new camera(s)", registered.len());
            print_json(&registered)?;
        }
        Command::Add { address, port, username, password } => {
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials::new(username, password)),
                _ => None,
            };
            let record = manager.add_camera(&address, port, credentials).await?;
            print_json(&record)?;
        }
        Command::List => {
            manager.poll_now().await;
            print_json(&manager.list_overview().await)?;
        }
        Command::Remove { id } => {
            if !manager.remove_camera(&id).await {
                anyhow::bail!("no camera with id '{}'", id);
            }
            info!("Removed camera {}", id);
        }
        Command::Monitor => monitor(manager, config).await?,
    }
    Ok(())
}

async fn monitor(manager: &CameraManager, config: &ManagerConfig) -> Result<()> {
    let mut ticker = tokio::time::interval(config.poll_interval);
    info!("Monitoring {} camera(s), press Ctrl-C to stop", manager.list_cameras().await.len());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C, stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                print_json(&manager.get_stats().await)?;
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
