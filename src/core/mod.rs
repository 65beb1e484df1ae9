//! Core functionality for the beacon central
//! This module contains the session manager and everything it needs to talk
//! to a peripheral.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{CentralManager, Error, Result};
