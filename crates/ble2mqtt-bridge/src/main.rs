//! ble2mqtt - Bridge BLE devices to MQTT.
//!
//! Run with: `cargo run -p ble2mqtt-bridge -- --config ./ble2mqtt.json`

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ble2mqtt_bridge::config::DEFAULT_CONFIG_PATH;
use ble2mqtt_bridge::{Bridge, BridgeSettings, Config, MqttSettings, RumqttBroker};
use ble2mqtt_core::build_device;

/// ble2mqtt - Bridge Bluetooth Low Energy devices to MQTT.
#[derive(Parser, Debug)]
#[command(name = "ble2mqtt")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "BLE2MQTT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load_or_default(&args.config);
    if let Err(e) = config.validate() {
        warn!("{}", e);
    }

    let broker = Arc::new(RumqttBroker::new(MqttSettings::from(&config)));
    let mut bridge = Bridge::new(BridgeSettings::from(&config), broker);

    for device_config in &config.devices {
        let device = match build_device(device_config) {
            Ok(device) => device,
            Err(e) => {
                error!("Skipping device {}: {}", device_config.address, e);
                continue;
            }
        };
        if let Err(e) = bridge.register(device) {
            error!("Skipping device {}: {}", device_config.address, e);
        }
    }
    if bridge.devices().is_empty() {
        warn!("No devices configured");
    }

    bridge.start()?;

    let outcome = tokio::select! {
        result = bridge.stopped() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    };

    bridge.close().await;

    if let Err(e) = &outcome {
        error!("Bridge stopped: {}", e);
    }
    outcome?;
    Ok(())
}
