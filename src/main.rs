//! RideBridge - BLE fitness telemetry bridge
//!
//! Main entry point for the bridge binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ridebridge::config::{self, SensorTarget};
use ridebridge::sensors::simulated::{RideProfile, SimulatedRide};
use ridebridge::sensors::types::Capability;
use ridebridge::{Bridge, BridgeConfig, BtleplugTransport, Encoding, SimulatedTransport};

const SIMULATED_NAMES: [&str; 3] = ["SIM POWER", "SIM CSC", "SIM HR"];

#[derive(Parser)]
#[command(name = "ridebridge")]
#[command(about = "Bridge BLE cycling sensors to local WebSocket consumers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for consumers
    #[arg(long)]
    host: Option<String>,

    /// Listen port for consumers
    #[arg(short, long)]
    port: Option<u16>,

    /// Name filter for the power meter or trainer
    #[arg(long)]
    power_filter: Option<String>,

    /// Name filter for a dedicated speed/cadence sensor
    #[arg(long)]
    cadence_filter: Option<String>,

    /// Name filter for the heart rate monitor
    #[arg(long)]
    hr_filter: Option<String>,

    /// Pinned device address of the power meter or trainer
    #[arg(long)]
    power_address: Option<String>,

    /// Pinned device address of the heart rate monitor
    #[arg(long)]
    hr_address: Option<String>,

    /// Wheel circumference in meters
    #[arg(long)]
    wheel_circumference: Option<f64>,

    /// Zero power/cadence/speed after this many milliseconds without data
    #[arg(long)]
    stall_timeout_ms: Option<u64>,

    /// Broadcast period in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Default consumer encoding
    #[arg(long, value_parser = parse_encoding)]
    encoding: Option<Encoding>,

    /// Use simulated sensors instead of Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run the bridge (default)
    Run,

    /// List nearby BLE devices and exit
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_encoding(value: &str) -> Result<Encoding, String> {
    value.parse().map_err(|e: ridebridge::streaming::StreamingError| e.to_string())
}

impl Cli {
    /// File configuration with command line overrides applied.
    fn effective_config(&self) -> Result<BridgeConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(config::default_config_path);
        let mut config = config::load_config(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(filter) = &self.power_filter {
            set_name_filter(&mut config, Capability::Power, filter);
        }
        if let Some(filter) = &self.cadence_filter {
            set_name_filter(&mut config, Capability::CadenceSpeed, filter);
        }
        if let Some(filter) = &self.hr_filter {
            set_name_filter(&mut config, Capability::HeartRate, filter);
        }
        if let Some(address) = &self.power_address {
            set_device_id(&mut config, Capability::Power, address);
        }
        if let Some(address) = &self.hr_address {
            set_device_id(&mut config, Capability::HeartRate, address);
        }
        if let Some(circumference) = self.wheel_circumference {
            config.sensors.wheel_circumference_m = circumference;
        }
        if let Some(timeout) = self.stall_timeout_ms {
            config.watchdog.cycling_timeout_ms = timeout;
        }
        if let Some(tick) = self.tick_ms {
            config.broadcast.tick_ms = tick;
        }
        if let Some(encoding) = self.encoding {
            config.broadcast.encoding = encoding;
        }

        if self.simulate {
            config.sensors.power = Some(SensorTarget::by_name(SIMULATED_NAMES[0]));
            config.sensors.cadence_speed = Some(SensorTarget::by_name(SIMULATED_NAMES[1]));
            config.sensors.heart_rate = Some(SensorTarget::by_name(SIMULATED_NAMES[2]));
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn set_name_filter(config: &mut BridgeConfig, capability: Capability, filter: &str) {
    config
        .sensors
        .target_mut(capability)
        .get_or_insert_with(SensorTarget::default)
        .name_filter = Some(filter.to_string());
}

fn set_device_id(config: &mut BridgeConfig, capability: Capability, device_id: &str) {
    config
        .sensors
        .target_mut(capability)
        .get_or_insert_with(SensorTarget::default)
        .device_id = Some(device_id.to_string());
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli).await,
        Commands::Scan { seconds } => scan(Duration::from_secs(seconds)).await,
        Commands::Config => {
            let config = cli.effective_config()?;
            print!("{}", config::to_toml(&config)?);
            Ok(())
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = cli.effective_config()?;

    tracing::info!("Starting RideBridge v{}", env!("CARGO_PKG_VERSION"));

    let bridge = if cli.simulate {
        let transport = SimulatedTransport::new();
        let ride = SimulatedRide::install(
            &transport,
            SIMULATED_NAMES,
            RideProfile {
                wheel_circumference_m: config.sensors.wheel_circumference_m,
                ..RideProfile::default()
            },
        );

        let bridge = Bridge::start(config, transport)
            .await
            .context("Failed to start bridge")?;
        tokio::spawn(ride.run(bridge.shutdown_signal()));
        bridge
    } else {
        let transport = BtleplugTransport::new()
            .await
            .context("Bluetooth is unavailable")?;
        Bridge::start(config, transport)
            .await
            .context("Failed to start bridge")?
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    bridge.shutdown().await;
    Ok(())
}

async fn scan(duration: Duration) -> Result<()> {
    let transport = BtleplugTransport::new()
        .await
        .context("Bluetooth is unavailable")?;

    println!("Scanning for {} seconds...", duration.as_secs());
    let sensors = transport
        .list_nearby(duration)
        .await
        .context("Scan failed")?;

    if sensors.is_empty() {
        println!("No devices found");
    }
    for sensor in sensors {
        let rssi = sensor
            .signal_strength
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<24} {:<40} {}", sensor.name, sensor.device_id, rssi);
    }

    Ok(())
}
