use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_NOTIFY_CHAR_UUID, DEFAULT_SERVICE_UUID, DEFAULT_WRITE_CHAR_UUID,
};
use crate::core::bluetooth::types::CharacteristicRef;

/// Identifiers of the peripherals this application talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Primary service carrying the data characteristics
    pub service_uuid: Uuid,
    /// Characteristic commands are written to
    pub write_characteristic_uuid: Uuid,
    /// Characteristic the peripheral pushes live data from
    pub notify_characteristic_uuid: Uuid,
    /// Advertised name to connect to when none is given
    pub device_name: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        ProfileConfig {
            service_uuid: DEFAULT_SERVICE_UUID,
            write_characteristic_uuid: DEFAULT_WRITE_CHAR_UUID,
            notify_characteristic_uuid: DEFAULT_NOTIFY_CHAR_UUID,
            device_name: None,
        }
    }
}

impl ProfileConfig {
    pub fn write_target(&self) -> CharacteristicRef {
        CharacteristicRef::new(self.service_uuid, self.write_characteristic_uuid)
    }

    pub fn notify_source(&self) -> CharacteristicRef {
        CharacteristicRef::new(self.service_uuid, self.notify_characteristic_uuid)
    }
}
