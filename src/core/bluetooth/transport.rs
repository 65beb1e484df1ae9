//! Transport adapter contract
//! The platform radio sits behind [`Transport`]: calls are forwarded 1:1 with
//! no retries or validation, and everything the radio reports comes back as a
//! [`TransportEvent`] through an [`EventSink`].

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::types::{
    CharacteristicRef, Device, DeviceHandle, DeviceId, DiscoveredCharacteristic, PowerState,
    WriteMode,
};

pub type TransportResult = std::result::Result<(), TransportError>;

/// Optional service filter for scans
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn services(services: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            services: services.into_iter().collect(),
        }
    }

    /// Whether every device `other` would let through also passes this filter
    pub fn covers(&self, other: &ScanFilter) -> bool {
        self.services.is_empty()
            || (!other.services.is_empty() && other.services.iter().all(|s| self.services.contains(s)))
    }
}

/// Capability set of the platform radio
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start_scan(&self, filter: &ScanFilter) -> TransportResult;

    async fn stop_scan(&self) -> TransportResult;

    async fn connect(&self, device: DeviceHandle) -> TransportResult;

    async fn cancel_connection(&self, device: DeviceHandle) -> TransportResult;

    async fn discover_services(&self, device: DeviceHandle) -> TransportResult;

    async fn discover_characteristics(&self, device: DeviceHandle, service: Uuid) -> TransportResult;

    async fn read_value(&self, device: DeviceHandle, characteristic: CharacteristicRef) -> TransportResult;

    async fn write_value(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> TransportResult;

    async fn set_notify(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        enable: bool,
    ) -> TransportResult;
}

/// Raw events coming up from the radio
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(PowerState),
    DeviceDiscovered {
        device: Device,
        rssi: Option<i16>,
    },
    Connected(DeviceId),
    ConnectFailed {
        device: DeviceId,
        error: String,
    },
    Disconnected {
        device: DeviceId,
        error: Option<String>,
    },
    ServicesDiscovered {
        device: DeviceId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    ValueUpdated {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    ValueWritten(CharacteristicRef),
    NotifyStateUpdated {
        characteristic: CharacteristicRef,
        notifying: bool,
    },
}

/// A transport call the session wants issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    StartScan(ScanFilter),
    StopScan,
    Connect(DeviceHandle),
    CancelConnection(DeviceHandle),
    DiscoverServices(DeviceHandle),
    DiscoverCharacteristics {
        device: DeviceHandle,
        service: Uuid,
    },
    ReadValue {
        device: DeviceHandle,
        characteristic: CharacteristicRef,
    },
    WriteValue {
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        enable: bool,
    },
}

impl TransportCommand {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartScan(_) => "startScan",
            Self::StopScan => "stopScan",
            Self::Connect(_) => "connect",
            Self::CancelConnection(_) => "cancelConnection",
            Self::DiscoverServices(_) => "discoverServices",
            Self::DiscoverCharacteristics { .. } => "discoverCharacteristics",
            Self::ReadValue { .. } => "readValue",
            Self::WriteValue { .. } => "writeValue",
            Self::SetNotify { .. } => "setNotify",
        }
    }

    /// Forwards the command to the transport.
    pub async fn issue<T: Transport + ?Sized>(&self, transport: &T) -> TransportResult {
        match self {
            Self::StartScan(filter) => transport.start_scan(filter).await,
            Self::StopScan => transport.stop_scan().await,
            Self::Connect(device) => transport.connect(*device).await,
            Self::CancelConnection(device) => transport.cancel_connection(*device).await,
            Self::DiscoverServices(device) => transport.discover_services(*device).await,
            Self::DiscoverCharacteristics { device, service } => {
                transport.discover_characteristics(*device, *service).await
            }
            Self::ReadValue { device, characteristic } => {
                transport.read_value(*device, *characteristic).await
            }
            Self::WriteValue {
                device,
                characteristic,
                value,
                mode,
            } => transport.write_value(*device, *characteristic, value, *mode).await,
            Self::SetNotify {
                device,
                characteristic,
                enable,
            } => transport.set_notify(*device, *characteristic, *enable).await,
        }
    }
}

/// Sending half handed to a transport adapter
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Delivers an event to the central. Events sent after the central has
    /// shut down are dropped.
    pub fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("Dropping transport event, central is gone: {:?}", e.0);
        }
    }
}

/// Receiving half owned by the central
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the channel a transport uses to report events to the central
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}
