use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use log::{error, info};
use regex::Regex;
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

fn mac_address_regex() -> Option<&'static Regex> {
    static MAC_RE: OnceLock<Option<Regex>> = OnceLock::new();
    MAC_RE
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()
}

/// Pulls the last MAC address out of a platform device identifier, if any.
/// BlueZ paths use underscores, so those are normalized first.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    let normalized = device_id.replace('_', ":");
    mac_address_regex()?
        .find_iter(&normalized)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}
