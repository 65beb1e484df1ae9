//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::UNNAMED_DEVICE;
use crate::utils::extract_mac_address;

/// Platform-stable identity of a peripheral (a UUID on Apple platforms, an
/// address-bearing path or string elsewhere)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque handle the transport adapter uses to find its native peripheral
/// object again. Only the adapter gives it meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// Platform-specific unique identifier for the device
    pub id: DeviceId,
    /// The advertised name of the device, if any
    pub name: Option<String>,
    /// The MAC address embedded in the identifier, when the platform exposes one
    pub address: Option<String>,
    /// The signal strength (RSSI) of the last sighting
    pub rssi: Option<i16>,
    /// Whether the session currently holds a link to this device
    pub connected: bool,
    /// Raw transport handle
    #[serde(skip)]
    pub handle: DeviceHandle,
}

impl Device {
    /// Creates a new Device; the address is derived from the identifier.
    pub fn new(id: impl Into<DeviceId>, name: Option<String>, handle: DeviceHandle) -> Self {
        let id = id.into();
        let address = extract_mac_address(id.as_str());
        Self {
            id,
            name,
            address,
            rssi: None,
            connected: false,
            handle,
        }
    }

    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Name shown in device lists
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_DEVICE)
    }
}

// Two devices are equal if they have the same identity
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

/// Power/authorization state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl PowerState {
    /// Whether this state rules out any radio operation
    pub fn is_unavailable(self) -> bool {
        matches!(
            self,
            Self::Unsupported | Self::Unauthorized | Self::PoweredOff | Self::Resetting
        )
    }
}

/// Capability flags of a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn readable() -> Self {
        Self { read: true, ..Self::default() }
    }

    pub fn with_write(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn with_write_without_response(mut self) -> Self {
        self.write_without_response = true;
        self
    }

    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    pub fn with_indicate(mut self) -> Self {
        self.indicate = true;
        self
    }

    /// Picks the write mode a write on this characteristic uses, if any.
    pub fn write_mode(&self) -> Option<WriteMode> {
        if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.write {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// Write type handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Addresses one characteristic within the connected peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A characteristic as reported by the transport during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl DiscoveredCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }
}

/// Public view of a discovered service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Public view of a discovered characteristic
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub notifying: bool,
}

/// What a connect command is looking for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectTarget {
    Id(DeviceId),
    Name(String),
}

impl ConnectTarget {
    /// Exact name or identity match
    pub fn matches(&self, device: &Device) -> bool {
        match self {
            Self::Id(id) => &device.id == id,
            Self::Name(name) => device.name.as_deref() == Some(name.as_str()),
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Name(name) => write!(f, "name {name:?}"),
        }
    }
}

/// Lifecycle state of the single session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SessionState {
    Idle,
    ScanningForConnect,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Ready,
    Disconnecting,
    Reconnecting { attempt: u32 },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a platform link to the device is up
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::ServiceDiscovery | Self::CharacteristicDiscovery | Self::Ready | Self::Disconnecting
        )
    }
}

/// Which operation an outstanding confirmation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "characteristic")]
pub enum IntentKind {
    Read(CharacteristicRef),
    Write(CharacteristicRef),
    Subscribe(CharacteristicRef),
    Unsubscribe(CharacteristicRef),
    Disconnect,
}

/// Point-in-time view of the central for the UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub power: PowerState,
    pub device: Option<Device>,
    pub services: Vec<ServiceInfo>,
    pub subscribed: Option<CharacteristicRef>,
    pub pending: Option<IntentKind>,
    pub scanning: bool,
}

/// Notifications emitted to subscribers of the central
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    PowerStateChanged(PowerState),
    ScanStarted,
    DeviceDiscovered(Device),
    ScanStopped,
    Connecting(Device),
    SessionReady {
        device: Device,
        services: Vec<ServiceInfo>,
    },
    NotificationReceived {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    SubscriptionChanged {
        characteristic: CharacteristicRef,
        subscribed: bool,
    },
    ConnectionLost {
        device: Device,
        attempt: u32,
    },
    ConnectFailed {
        target: ConnectTarget,
        reason: String,
    },
    SessionClosed {
        device: Option<Device>,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_equality_ignores_name_and_handle() {
        let a = Device::new("AA:BB:CC:DD:EE:FF", Some("one".into()), DeviceHandle::new(1));
        let b = Device::new("AA:BB:CC:DD:EE:FF", None, DeviceHandle::new(2));
        let c = Device::new("11:22:33:44:55:66", Some("one".into()), DeviceHandle::new(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unnamed_devices_get_placeholder() {
        let device = Device::new("5E6B1A22-0000-4000-8000-00805F9B34FB", None, DeviceHandle::new(7));
        assert_eq!(device.display_name(), "<no name>");
        assert_eq!(device.address, None);
    }

    #[test]
    fn write_mode_prefers_without_response() {
        let both = CharacteristicProperties::default().with_write().with_write_without_response();
        assert_eq!(both.write_mode(), Some(WriteMode::WithoutResponse));
        let acked = CharacteristicProperties::default().with_write();
        assert_eq!(acked.write_mode(), Some(WriteMode::WithResponse));
        assert_eq!(CharacteristicProperties::readable().write_mode(), None);
    }

    #[test]
    fn connect_target_matches_exact_name_only() {
        let device = Device::new("id-1", Some("BeaconX".into()), DeviceHandle::new(1));
        assert!(ConnectTarget::Name("BeaconX".into()).matches(&device));
        assert!(!ConnectTarget::Name("Beacon".into()).matches(&device));
        assert!(ConnectTarget::Id(DeviceId::from("id-1")).matches(&device));
    }
}
