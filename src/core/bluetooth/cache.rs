//! Characteristic cache
//! Services and characteristics discovered on the connected peripheral, with
//! the last value seen for each characteristic. Invalidated wholesale when the
//! connection goes away.

use log::debug;
use uuid::Uuid;

use crate::core::bluetooth::error::{Error, Result};
use crate::core::bluetooth::types::{
    CharacteristicInfo, CharacteristicProperties, CharacteristicRef, DiscoveredCharacteristic,
    ServiceInfo,
};

#[derive(Debug, Clone)]
pub struct CachedCharacteristic {
    pub uuid: Uuid,
    /// Parent service
    pub service: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub notifying: bool,
}

#[derive(Debug, Clone)]
struct CachedService {
    uuid: Uuid,
    characteristics: Vec<CachedCharacteristic>,
}

#[derive(Debug, Default)]
pub struct CharacteristicCache {
    services: Vec<CachedService>,
}

impl CharacteristicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the characteristics discovered for a service, replacing any
    /// earlier result for the same service.
    pub fn insert_service(&mut self, service: Uuid, characteristics: Vec<DiscoveredCharacteristic>) {
        let characteristics = characteristics
            .into_iter()
            .map(|c| CachedCharacteristic {
                uuid: c.uuid,
                service,
                properties: c.properties,
                value: None,
                notifying: false,
            })
            .collect();
        let entry = CachedService {
            uuid: service,
            characteristics,
        };
        match self.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => *existing = entry,
            None => self.services.push(entry),
        }
    }

    /// Resolves a service+characteristic pair.
    pub fn lookup(&self, characteristic: CharacteristicRef) -> Result<&CachedCharacteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == characteristic.service)
            .and_then(|s| s.characteristics.iter().find(|c| c.uuid == characteristic.characteristic))
            .ok_or(Error::CharacteristicNotFound {
                service: characteristic.service,
                characteristic: characteristic.characteristic,
            })
    }

    fn lookup_mut(&mut self, characteristic: CharacteristicRef) -> Option<&mut CachedCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == characteristic.service)
            .and_then(|s| {
                s.characteristics
                    .iter_mut()
                    .find(|c| c.uuid == characteristic.characteristic)
            })
    }

    /// Records a value; unknown characteristics are ignored.
    pub fn set_value(&mut self, characteristic: CharacteristicRef, value: Vec<u8>) {
        match self.lookup_mut(characteristic) {
            Some(entry) => entry.value = Some(value),
            None => debug!("Value for unknown characteristic {} not cached", characteristic),
        }
    }

    pub fn set_notifying(&mut self, characteristic: CharacteristicRef, notifying: bool) {
        if let Some(entry) = self.lookup_mut(characteristic) {
            entry.notifying = notifying;
        }
    }

    pub fn is_notifying(&self, characteristic: CharacteristicRef) -> bool {
        self.lookup(characteristic).map(|c| c.notifying).unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.services.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Public view of everything cached, in discovery order
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .map(|s| ServiceInfo {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: c.properties,
                        value: c.value.clone(),
                        notifying: c.notifying,
                    })
                    .collect(),
            })
            .collect()
    }
}
