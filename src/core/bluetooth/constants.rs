//! Constants used throughout the crate
//! This module contains the default values for the configurable parts of the
//! central: the target peripheral's UUIDs, timeouts and reconnect limits.

use uuid::Uuid;

/// Display name used for peripherals that do not advertise one
pub const UNNAMED_DEVICE: &str = "<no name>";

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Default primary service of the beacon peripherals (Nordic UART layout)
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Default characteristic the central writes commands to
pub const DEFAULT_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Default characteristic the peripheral pushes notifications from
pub const DEFAULT_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Scan duration in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 5_000;

/// How long a connect-by-name/id keeps scanning for its target
pub const DEFAULT_CONNECT_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Timeout for a single awaited Bluetooth operation in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Maximum number of reconnect attempts after an unexpected drop
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before the first reconnect attempt in milliseconds
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound for the exponential reconnect delay in milliseconds
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Capacity of the central event broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Capacity of the command channel between handles and the session actor
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;
