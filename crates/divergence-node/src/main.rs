//! Divergence Node - keeps a Divergence meter connected and drives it
//!
//! This binary runs the meter service against the host Bluetooth adapter
//! and reads commands from standard input.

mod shell;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use divergence_meter::{Meter, MeterAccessory, MeterConfig, MeterHandle, MeterService};

#[derive(Parser)]
#[command(name = "divergence-node")]
#[command(about = "Keep a Divergence meter connected and control it from the terminal")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Delay before rescanning after another consumer stopped the scan (e.g. "3s")
    #[arg(long, value_parser = humantime::parse_duration)]
    rescan_delay: Option<Duration>,

    /// Turn the display off this many seconds after it was turned on
    #[arg(long)]
    auto_off: Option<u32>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the meter and start the command shell (default)
    Run,
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<MeterConfig> {
    let mut config = match &args.config {
        Some(path) => MeterConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeterConfig::default(),
    };

    if let Some(delay) = args.rescan_delay {
        config.reconnect.rescan_delay = delay;
    }
    if let Some(secs) = args.auto_off {
        config.auto_off.enabled = true;
        config.auto_off.duration_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "ble")]
async fn run(config: MeterConfig) -> anyhow::Result<()> {
    use divergence_meter::BleCentral;

    info!("Starting Divergence node for '{}'", config.device.name);
    let central =
        BleCentral::new(vec![config.device.service_uuid], config.device.name.clone()).await?;
    let central = Arc::new(central);
    let (service, meter) = MeterService::new(central, &config);
    let service_task = service.spawn();

    let accessory = MeterAccessory::new(meter.clone(), &config.auto_off);
    if config.auto_off.enabled {
        info!(
            "Auto-off after {}s (retry every {}s)",
            config.auto_off.duration_secs, config.auto_off.retry_delay_secs
        );
    }

    tokio::spawn(sync_time_on_connect(meter.clone()));

    println!("{}", shell::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match shell::parse(&line) {
                    Ok(Some(command)) => {
                        if !shell::execute(command, &meter, &accessory) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(accessory);
    if let Err(e) = meter.shutdown() {
        warn!("Meter service already stopped: {}", e);
    }
    match service_task.await {
        Ok(result) => result?,
        Err(e) => error!("Meter service task failed: {}", e),
    }
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn run(_config: MeterConfig) -> anyhow::Result<()> {
    anyhow::bail!("divergence-node was built without the `ble` feature")
}

/// Set the meter clock the first time the link comes up
async fn sync_time_on_connect(meter: MeterHandle) {
    if meter.wait_connected().await.is_err() {
        return;
    }
    info!("Meter connected, syncing time");
    if let Err(e) = meter.sync_time() {
        warn!("Failed to sync meter time: {}", e);
    }
}
