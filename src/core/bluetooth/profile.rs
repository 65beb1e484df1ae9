//! Beacon profile client
//! Wraps a [`CentralManager`] with the service, write and notify
//! characteristics from the profile configuration, so callers talk in
//! payloads rather than UUIDs.

use log::{debug, info};
use tokio::sync::mpsc;

use crate::config::profile_config::ProfileConfig;
use crate::core::bluetooth::error::{Error, Result};
use crate::core::bluetooth::manager::CentralManager;
use crate::core::bluetooth::notification::{Notification, NotificationListener};
use crate::core::bluetooth::types::ServiceInfo;

pub struct BeaconProfile {
    manager: CentralManager,
    profile: ProfileConfig,
    listener: Option<NotificationListener>,
}

impl BeaconProfile {
    pub fn new(manager: CentralManager, profile: ProfileConfig) -> Self {
        Self {
            manager,
            profile,
            listener: None,
        }
    }

    pub fn manager(&self) -> &CentralManager {
        &self.manager
    }

    pub fn profile(&self) -> &ProfileConfig {
        &self.profile
    }

    /// Connects to the configured device name.
    pub async fn connect(&self) -> Result<Vec<ServiceInfo>> {
        let Some(name) = self.profile.device_name.clone() else {
            return Err(Error::DeviceNotFound("no device name configured".to_string()));
        };
        self.manager.connect_by_name(name).await
    }

    /// Writes a raw payload to the write characteristic.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let target = self.profile.write_target();
        debug!("Sending {} bytes to {}", payload.len(), target);
        self.manager
            .write(target.service, target.characteristic, payload.to_vec())
            .await
    }

    /// Writes UTF-8 text to the write characteristic.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    pub async fn read_notify_source(&self) -> Result<Vec<u8>> {
        let source = self.profile.notify_source();
        self.manager.read(source.service, source.characteristic).await
    }

    /// Subscribes to the notify characteristic and returns the channel its
    /// values arrive on.
    pub async fn start_listening(&mut self) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let source = self.profile.notify_source();
        if let Some(mut previous) = self.listener.take() {
            previous.stop().await;
        }
        // listen before subscribing so the first value is not missed
        let (listener, rx) = NotificationListener::start(self.manager.events(), Some(source));
        if let Err(e) = self.manager.subscribe(source.service, source.characteristic).await {
            let mut listener = listener;
            listener.stop().await;
            return Err(e);
        }
        info!("Listening on {}", source);
        self.listener = Some(listener);
        Ok(rx)
    }

    /// Stops the listener and unsubscribes.
    pub async fn stop_listening(&mut self) -> Result<()> {
        if let Some(mut listener) = self.listener.take() {
            listener.stop().await;
        }
        self.manager.unsubscribe().await
    }
}
