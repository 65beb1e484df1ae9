use std::path::PathBuf;

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use log::{error, info, warn};

use beacon_central::config::{AppConfig, CONFIG_FILE_NAME};
use beacon_central::core::bluetooth::{BeaconProfile, BluestTransport, CentralManager};
use beacon_central::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let level = logging::level_from_name(&std::env::var("BEACON_LOG").unwrap_or_default());
    if logging::init(level.to_level().unwrap_or(log::Level::Info)).is_err() {
        // fall back to env_logger if the forwarder could not be installed
        env_logger::builder().filter_level(level).init();
    }

    let config_path = std::env::var("BEACON_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE_NAME));
    let mut config = AppConfig::load_config(&config_path).await?;
    if let Some(name) = std::env::args().nth(1) {
        config.profile.device_name = Some(name);
    }

    let (transport, events) = BluestTransport::new()
        .await
        .map_err(|e| anyhow!("No Bluetooth adapter found: {}", e))?;
    let manager = CentralManager::start(transport, events, &config.session);

    let Some(name) = config.profile.device_name.clone() else {
        info!("No device name given, listing nearby devices.");
        let mut devices = manager.scan().await?;
        while let Some(device) = devices.next().await {
            println!("{}  {}  rssi={:?}", device.id, device.display_name(), device.rssi);
        }
        return Ok(());
    };

    let mut profile = BeaconProfile::new(manager.clone(), config.profile.clone());
    let services = profile.connect().await?;
    info!("Connected to {} with {} services", name, services.len());

    let mut notifications = profile.start_listening().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            value = notifications.recv() => match value {
                Some((_, value)) => println!("{}", String::from_utf8_lossy(&value)),
                None => {
                    warn!("Notification stream closed.");
                    break;
                }
            },
        }
    }

    if let Err(e) = profile.stop_listening().await {
        warn!("Failed to unsubscribe: {}", e);
    }
    if let Err(e) = manager.disconnect().await {
        error!("Failed to disconnect: {}", e);
    }
    manager.shutdown();
    Ok(())
}
