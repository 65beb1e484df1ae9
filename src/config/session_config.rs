use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    DEFAULT_CONNECT_SCAN_TIMEOUT_MS, DEFAULT_EVENT_CAPACITY, DEFAULT_OPERATION_TIMEOUT_MS,
    DEFAULT_SCAN_TIMEOUT_MS, MAX_RECONNECT_ATTEMPTS, RECONNECT_INITIAL_DELAY_MS,
    RECONNECT_MAX_DELAY_MS,
};

/// Bounded reconnect behaviour after an unexpected disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before the session gives up. 0 disables reconnecting.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles on every further attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_delay_ms: RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: RECONNECT_MAX_DELAY_MS,
        }
    }
}

/// Runtime behaviour of the session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default duration of a user scan.
    pub scan_timeout_ms: u64,

    /// How long connect-by-name/id scans for its target before giving up.
    pub connect_scan_timeout_ms: u64,

    /// Time allowed for connect, discovery, read, write, subscribe and
    /// disconnect confirmations.
    pub operation_timeout_ms: u64,

    /// Advertisements weaker than this are ignored.
    pub min_rssi: Option<i16>,

    pub reconnect: ReconnectConfig,

    /// Follow a no-response write with a read of the same characteristic and
    /// only report success once the value comes back.
    pub confirm_unacknowledged_writes: bool,

    /// Tear the connection down once an unsubscribe is confirmed.
    pub disconnect_on_unsubscribe: bool,

    /// Capacity of the central event broadcast; slow listeners lag past it.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            connect_scan_timeout_ms: DEFAULT_CONNECT_SCAN_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            min_rssi: None,
            reconnect: ReconnectConfig::default(),
            confirm_unacknowledged_writes: false,
            disconnect_on_unsubscribe: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_scan_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
