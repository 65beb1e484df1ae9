//! Platform transport over `bluest`
//! Translates transport calls into `bluest` adapter, device and
//! characteristic calls. Long-running work (connecting, scanning, notification
//! streams) runs in spawned tasks that report back through the event sink;
//! discovery, reads and writes are awaited inline and report their result as
//! an event once done.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, Characteristic, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{
    EventSink, EventStream, ScanFilter, Transport, TransportEvent, TransportResult, event_channel,
};
use crate::core::bluetooth::types::{
    CharacteristicProperties, CharacteristicRef, Device, DeviceHandle, DiscoveredCharacteristic,
    PowerState, WriteMode,
};

#[derive(Default)]
struct Handles {
    next: u64,
    by_id: HashMap<String, DeviceHandle>,
    devices: HashMap<DeviceHandle, bluest::Device>,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<CharacteristicRef, Characteristic>,
    notify_tasks: HashMap<CharacteristicRef, CancellationToken>,
    connects: HashMap<DeviceHandle, CancellationToken>,
}

impl Handles {
    /// Returns the handle for a native device, allocating one on first sight.
    fn register(&mut self, device: &bluest::Device) -> DeviceHandle {
        let key = device.id().to_string();
        if let Some(handle) = self.by_id.get(&key) {
            self.devices.insert(*handle, device.clone());
            return *handle;
        }
        self.next += 1;
        let handle = DeviceHandle::new(self.next);
        self.by_id.insert(key, handle);
        self.devices.insert(handle, device.clone());
        handle
    }

    /// Tracks a new connect attempt, cancelling an older one for the same
    /// device.
    fn begin_connect(&mut self, handle: DeviceHandle) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.connects.insert(handle, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancels the running connect attempt. Returns false when there was none.
    fn cancel_connect(&mut self, handle: DeviceHandle) -> bool {
        match self.connects.remove(&handle) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets an attempt that ran to completion. A cancelled attempt has
    /// been removed already and a newer one may hold the slot.
    fn finish_connect(&mut self, handle: DeviceHandle, token: &CancellationToken) {
        if !token.is_cancelled() {
            self.connects.remove(&handle);
        }
    }

    /// Drops everything tied to the current connection.
    fn forget_gatt(&mut self) {
        for (_, token) in self.notify_tasks.drain() {
            token.cancel();
        }
        self.characteristics.clear();
        self.services.clear();
    }
}

/// Transport backed by the default system Bluetooth adapter
#[derive(Clone)]
pub struct BluestTransport {
    adapter: Adapter,
    sink: EventSink,
    handles: Arc<Mutex<Handles>>,
    scan_token: Arc<Mutex<Option<CancellationToken>>>,
}

impl BluestTransport {
    /// Opens the default adapter and starts watching its power state.
    pub async fn new() -> Result<(Self, EventStream), TransportError> {
        let adapter = Adapter::default().await.ok_or(TransportError::Unavailable)?;
        let (sink, events) = event_channel();
        let transport = Self {
            adapter,
            sink,
            handles: Arc::new(Mutex::new(Handles::default())),
            scan_token: Arc::new(Mutex::new(None)),
        };

        let powered = transport.adapter.is_available().await.unwrap_or(false);
        transport.sink.emit(TransportEvent::StateChanged(if powered {
            PowerState::PoweredOn
        } else {
            PowerState::PoweredOff
        }));
        transport.watch_adapter();
        info!("Bluetooth adapter opened | available={}", powered);
        Ok((transport, events))
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watch_adapter(&self) {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to watch adapter state: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                match event {
                    Ok(AdapterEvent::Available) => sink.emit(TransportEvent::StateChanged(PowerState::PoweredOn)),
                    Ok(AdapterEvent::Unavailable) => {
                        sink.emit(TransportEvent::StateChanged(PowerState::PoweredOff))
                    }
                    Err(e) => warn!("Adapter event error: {}", e),
                }
            }
            debug!("Adapter event stream ended");
        });
    }

    fn device(&self, handle: DeviceHandle) -> Result<bluest::Device, TransportError> {
        self.handles()
            .devices
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("unknown device handle {}", handle.raw())))
    }

    fn characteristic(&self, target: CharacteristicRef) -> Result<Characteristic, TransportError> {
        self.handles()
            .characteristics
            .get(&target)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("characteristic {target} not discovered")))
    }

    async fn run_notifications(
        characteristic: Characteristic,
        target: CharacteristicRef,
        device: bluest::Device,
        sink: EventSink,
        cancel_token: CancellationToken,
    ) {
        let mut stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to subscribe to notifications on {}: {}", target, e);
                sink.emit(TransportEvent::NotifyStateUpdated {
                    characteristic: target,
                    notifying: false,
                });
                return;
            }
        };
        sink.emit(TransportEvent::NotifyStateUpdated {
            characteristic: target,
            notifying: true,
        });

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    sink.emit(TransportEvent::NotifyStateUpdated { characteristic: target, notifying: false });
                    return;
                }
                item = stream.next() => match item {
                    Some(Ok(value)) => sink.emit(TransportEvent::ValueUpdated { characteristic: target, value }),
                    Some(Err(e)) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        // the stream only ends on its own when the link is gone
        info!("Notification stream ended");
        if !device.is_connected().await {
            sink.emit(TransportEvent::Disconnected {
                device: device.id().to_string().into(),
                error: Some("link lost".to_string()),
            });
        } else {
            sink.emit(TransportEvent::NotifyStateUpdated {
                characteristic: target,
                notifying: false,
            });
        }
    }
}

fn map_properties(properties: bluest::CharacteristicProperties) -> CharacteristicProperties {
    CharacteristicProperties {
        read: properties.read,
        write: properties.write,
        write_without_response: properties.write_without_response,
        notify: properties.notify,
        indicate: properties.indicate,
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn start_scan(&self, filter: &ScanFilter) -> TransportResult {
        self.stop_scan().await?;
        let cancel_token = CancellationToken::new();
        *self.scan_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel_token.clone());

        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let handles = self.handles.clone();
        let services = filter.services.clone();
        tokio::spawn(async move {
            info!("Starting bluetooth scan");
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    if TransportError::from(e) == TransportError::Unavailable {
                        sink.emit(TransportEvent::StateChanged(PowerState::PoweredOff));
                    }
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = scan_stream.next() => match result {
                        Some(discovered) => {
                            let native = discovered.device;
                            let name = discovered.adv_data.local_name.or_else(|| native.name().ok());
                            let handle = handles.lock().unwrap_or_else(PoisonError::into_inner).register(&native);
                            debug!("Found device - Device: {:?}, RSSI: {:?}", native, discovered.rssi);
                            let device = Device::new(native.id().to_string(), name, handle);
                            sink.emit(TransportEvent::DeviceDiscovered { device, rssi: discovered.rssi });
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult {
        if let Some(token) = self.scan_token.lock().unwrap_or_else(PoisonError::into_inner).take() {
            info!("Stopping Bluetooth scan.");
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, handle: DeviceHandle) -> TransportResult {
        let device = self.device(handle)?;
        let cancel_token = self.handles().begin_connect(handle);
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let handles = self.handles.clone();
        tokio::spawn(async move {
            let id = device.id().to_string();
            info!("Initiating connection to {}...", id);
            let outcome = tokio::select! {
                _ = cancel_token.cancelled() => None,
                result = adapter.connect_device(&device) => Some(result),
            };
            handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish_connect(handle, &cancel_token);
            match outcome {
                Some(Ok(())) if !cancel_token.is_cancelled() => sink.emit(TransportEvent::Connected(id.into())),
                Some(Err(e)) if !cancel_token.is_cancelled() => sink.emit(TransportEvent::ConnectFailed {
                    device: id.into(),
                    error: e.to_string(),
                }),
                _ => {
                    // nobody is waiting for this link any more
                    info!("Connection attempt to {} was cancelled", id);
                    if device.is_connected().await {
                        if let Err(e) = adapter.disconnect_device(&device).await {
                            warn!("Failed to drop cancelled connection to {}: {}", id, e);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn cancel_connection(&self, handle: DeviceHandle) -> TransportResult {
        let device = self.device(handle)?;
        let attempt_cancelled = {
            let mut handles = self.handles();
            handles.forget_gatt();
            handles.cancel_connect(handle)
        };
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(&device).await?;
        } else if attempt_cancelled {
            debug!("Cancelled pending connect to {}", device.id());
        }
        self.sink.emit(TransportEvent::Disconnected {
            device: device.id().to_string().into(),
            error: None,
        });
        Ok(())
    }

    async fn discover_services(&self, handle: DeviceHandle) -> TransportResult {
        let device = self.device(handle)?;
        let services = device.discover_services().await?;
        let uuids = services.iter().map(Service::uuid).collect();
        {
            let mut handles = self.handles();
            handles.forget_gatt();
            for service in services {
                handles.services.insert(service.uuid(), service);
            }
        }
        self.sink.emit(TransportEvent::ServicesDiscovered {
            device: device.id().to_string().into(),
            services: uuids,
        });
        Ok(())
    }

    async fn discover_characteristics(&self, handle: DeviceHandle, service: Uuid) -> TransportResult {
        self.device(handle)?;
        let native = self
            .handles()
            .services
            .get(&service)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("service {service} not discovered")))?;
        let mut found = Vec::new();
        for characteristic in native.discover_characteristics().await? {
            let properties = map_properties(characteristic.properties().await?);
            let uuid = characteristic.uuid();
            self.handles()
                .characteristics
                .insert(CharacteristicRef::new(service, uuid), characteristic);
            found.push(DiscoveredCharacteristic::new(uuid, properties));
        }
        self.sink.emit(TransportEvent::CharacteristicsDiscovered {
            service,
            characteristics: found,
        });
        Ok(())
    }

    async fn read_value(&self, handle: DeviceHandle, target: CharacteristicRef) -> TransportResult {
        self.device(handle)?;
        let value = self.characteristic(target)?.read().await?;
        self.sink.emit(TransportEvent::ValueUpdated {
            characteristic: target,
            value,
        });
        Ok(())
    }

    async fn write_value(
        &self,
        handle: DeviceHandle,
        target: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> TransportResult {
        self.device(handle)?;
        let characteristic = self.characteristic(target)?;
        match mode {
            WriteMode::WithResponse => {
                characteristic.write(value).await?;
                self.sink.emit(TransportEvent::ValueWritten(target));
            }
            WriteMode::WithoutResponse => characteristic.write_without_response(value).await?,
        }
        Ok(())
    }

    async fn set_notify(&self, handle: DeviceHandle, target: CharacteristicRef, enable: bool) -> TransportResult {
        let device = self.device(handle)?;
        if !enable {
            match self.handles().notify_tasks.remove(&target) {
                // the task reports notifying=false once it has let go
                Some(token) => token.cancel(),
                None => self.sink.emit(TransportEvent::NotifyStateUpdated {
                    characteristic: target,
                    notifying: false,
                }),
            }
            return Ok(());
        }

        let characteristic = self.characteristic(target)?;
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.handles().notify_tasks.insert(target, cancel_token.clone()) {
            previous.cancel();
        }
        let sink = self.sink.clone();
        tokio::spawn(Self::run_notifications(characteristic, target, device, sink, cancel_token));
        debug!("Notification task started for {}", target);
        Ok(())
    }
}
