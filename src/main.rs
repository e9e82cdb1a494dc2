//! CLI entry point for the sensor bridge
//!
//! ```bash
//! sensor-bridge presets
//! sensor-bridge show-config
//! sensor-bridge probe --device-type golink --json
//! sensor-bridge collect --sensor temperature --sensor force --seconds 5
//! ```
//!
//! Only the pseudo device ships with this binary; other device types resolve
//! to their driver ids and are reported by `probe`, but open the simulated
//! interface.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::info;

use sensor_bridge::config::{BridgeConfig, DEFAULT_CONFIG_PATH};
use sensor_bridge::device::pseudo::PseudoDeviceFactory;
use sensor_bridge::device::DeviceConfig;
use sensor_bridge::logging::{self, OutputFormat, TracingConfig};
use sensor_bridge::sensor::catalog::{default_period, sensor_request_for, PRESETS};
use sensor_bridge::DeviceSessionController;

#[derive(Parser)]
#[command(name = "sensor-bridge")]
#[command(about = "Serialized session control for sensor-acquisition interfaces", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured device type
    #[arg(long, global = true)]
    device_type: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the named sensor presets
    Presets,

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Report whether the interface is collectable and what it reports
    Probe {
        /// Print the reported configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample the named sensors and print every delivered batch
    Collect {
        /// Preset name; repeat for more channels
        #[arg(long = "sensor", required = true)]
        sensors: Vec<String>,

        /// How long to sample
        #[arg(long, default_value = "3")]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(device_type) = cli.device_type {
        config.device_type = device_type;
    }

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format);
    logging::init(tracing_config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Presets => print_presets(),
        Commands::ShowConfig => println!("{}", toml::to_string_pretty(&config)?),
        Commands::Probe { json } => probe(&config, json)?,
        Commands::Collect { sensors, seconds } => collect(&config, &sensors, seconds)?,
    }

    Ok(())
}

fn print_presets() {
    println!(
        "{:<18} {:<12} {:>6} {:>10} {:>10} {:>6} {:>8}",
        "name", "quantity", "prec", "min", "max", "step", "period"
    );
    for (name, request) in PRESETS {
        println!(
            "{:<18} {:<12} {:>6} {:>10} {:>10} {:>6} {:>8}",
            name,
            request.quantity().to_string(),
            request.display_precision(),
            request.required_min(),
            request.required_max(),
            request.step_size(),
            default_period(request.quantity()),
        );
    }
}

fn probe(config: &BridgeConfig, json: bool) -> Result<()> {
    let resolved = DeviceConfig::resolve(&config.device_type, &config.parameters);
    println!("device type: {}", config.device_type);
    println!("driver:      {}", resolved.device_id);
    if let Some(open_string) = &resolved.open_string {
        println!("open string: {}", open_string);
    }

    let mut session = DeviceSessionController::from_config(config, PseudoDeviceFactory)?;
    let collectable = session.is_collectable();
    println!("collectable: {}", collectable);
    if collectable {
        match session.get_config()? {
            Some(reported) if json => println!("{}", serde_json::to_string_pretty(&reported)?),
            Some(reported) => println!("{}", reported),
            None => println!("no configuration reported"),
        }
    }
    session.destroy();
    Ok(())
}

fn collect(config: &BridgeConfig, sensors: &[String], seconds: u64) -> Result<()> {
    let channels = sensors.iter().map(|name| sensor_request_for(name)).collect();

    let mut session = DeviceSessionController::from_config(config, PseudoDeviceFactory)?;
    session.setup(channels)?;
    if let Some(negotiated) = session.actual_config()? {
        println!("{}", negotiated);
    }

    session.start(|num_samples: usize, channel_count: usize, samples: Vec<f32>| {
        for frame in samples.chunks(channel_count.max(1)).take(num_samples) {
            let values: Vec<String> = frame.iter().map(|v| format!("{:>9.4}", v)).collect();
            println!("{}", values.join(" "));
        }
    })?;

    thread::sleep(Duration::from_secs(seconds));
    info!(running = session.is_running(), "Collection window elapsed");

    session.stop();
    session.destroy();
    Ok(())
}
