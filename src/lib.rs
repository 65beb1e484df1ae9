//! Beacon central library
//! A single-peripheral Bluetooth Low Energy central: scan, connect, discover
//! services and characteristics, read, write and subscribe, with every
//! platform callback funnelled through one session state machine.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use crate::config::AppConfig;
pub use crate::core::bluetooth::{
    BeaconProfile, CentralEvent, CentralManager, Device, Error, Result, SessionSnapshot,
    SessionState,
};
