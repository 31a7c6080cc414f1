//! # Beamline Simulator
//!
//! Builds the devices declared in the configuration on simulated hardware and
//! drives them from the command line.
//!
//! # Usage
//!
//! ```bash
//! # List registered devices and their state as JSON
//! beamline-sim --config beamline.toml list
//!
//! # Move a positioner and wait for the outcome
//! beamline-sim move slits.top 1.25
//!
//! # Open a shutter
//! beamline-sim actuate stopper open
//!
//! # Print the effective configuration
//! beamline-sim config
//! ```

use anyhow::{bail, Context, Result};
use beamline_devices::config::EngineConfig;
use beamline_devices::device::DeviceState;
use beamline_devices::logging;
use beamline_devices::sim::{self, SimBeamline};
use beamline_devices::status::StatusPhase;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Beamline device simulator
#[derive(Parser, Debug)]
#[command(name = "beamline-sim")]
#[command(version)]
#[command(about = "Drive simulated beamline devices through the device engine")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = beamline_devices::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every registered device tree
    List,
    /// Show one device or group by dotted path
    Show { path: String },
    /// Move a positioner to an absolute position
    Move {
        path: String,
        target: String,
        /// Seconds to wait for completion
        #[arg(long, default_value_t = 60)]
        wait: u64,
    },
    /// Open or close a shutter
    Actuate {
        path: String,
        /// "open" or "close"
        position: String,
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("beamline-sim failed: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    logging::init_from_config(&config.application)?;
    info!(
        config = %args.config.display(),
        devices = config.devices.len(),
        "{} v{} starting",
        config.application.name,
        env!("CARGO_PKG_VERSION")
    );

    if let Command::Config = args.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let beamline = sim::build_beamline(&config)?;
    let outcome = execute(&beamline, args.command).await;
    beamline.registry.shutdown().await;
    outcome
}

async fn execute(beamline: &SimBeamline, command: Command) -> Result<()> {
    match command {
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&beamline.registry.snapshot())?);
        }
        Command::Show { path } => {
            let node = beamline.registry.require(&path)?;
            println!("{}", serde_json::to_string_pretty(&node.snapshot())?);
        }
        Command::Move { path, target, wait } => {
            beamline.positioner(&path)?;
            drive(beamline, &path, &target, wait).await?;
        }
        Command::Actuate {
            path,
            position,
            wait,
        } => {
            beamline.shutter(&path)?;
            drive(beamline, &path, &position, wait).await?;
        }
        Command::Config => {}
    }
    Ok(())
}

async fn drive(beamline: &SimBeamline, path: &str, target: &str, wait: u64) -> Result<()> {
    let device = beamline.device(path)?;
    device
        .wait_for_state(DeviceState::Idle, Duration::from_secs(5))
        .await
        .with_context(|| format!("device '{}' did not become ready", path))?;

    let status = beamline.command(path, target).await?;
    let phase = status.wait(Duration::from_secs(wait)).await;
    println!("{}", serde_json::to_string_pretty(&status.snapshot())?);

    if phase != StatusPhase::Success {
        let reason = status
            .reason()
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| phase.to_string());
        bail!("{} {}: {}", path, phase, reason);
    }
    Ok(())
}
