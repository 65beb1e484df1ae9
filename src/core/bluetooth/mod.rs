//! Bluetooth functionality for the beacon central
//! This module handles all bluetooth operations including scanning,
//! connecting, discovering, reading, writing and receiving notifications
//! from a single peripheral.

pub mod cache;
pub mod connection;
pub mod constants;
pub mod error;
pub mod manager;
pub mod notification;
pub mod profile;
pub mod registry;
pub mod session;
pub mod simulated;
pub mod transport;
pub mod types;

#[cfg(feature = "bluest")]
pub mod bluest_transport;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
pub use connection::ReconnectPolicy;
pub use constants::*; // Re-export all constants
pub use error::{Error, Result, TransportError};
pub use manager::{CentralManager, DeviceStream};
pub use notification::{Notification, NotificationListener};
pub use profile::BeaconProfile;
pub use simulated::{Faults, SimulatedPeripheral, SimulatedTransport};
pub use transport::{
    EventSink, EventStream, ScanFilter, Transport, TransportCommand, TransportEvent,
    TransportResult, event_channel,
};
pub use types::*;
