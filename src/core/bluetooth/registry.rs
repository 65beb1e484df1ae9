//! Device registry
//! Holds the peripherals seen during the current scan cycle, in the order they
//! were first sighted. The buffer is cleared whenever a new scan starts.

use std::collections::HashMap;

use log::debug;
use tokio::time::Instant;

use crate::core::bluetooth::transport::ScanFilter;
use crate::core::bluetooth::types::{ConnectTarget, Device, DeviceId};

/// Outcome of recording a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First sighting of this identity in the current scan cycle
    New,
    /// Known identity; cached fields were refreshed silently
    Refreshed,
    /// Dropped (no scan running, or below the RSSI floor)
    Ignored,
}

#[derive(Debug, Clone)]
struct ScanWindow {
    filter: ScanFilter,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
    scan: Option<ScanWindow>,
    min_rssi: Option<i16>,
}

impl DeviceRegistry {
    pub fn new(min_rssi: Option<i16>) -> Self {
        Self {
            min_rssi,
            ..Self::default()
        }
    }

    /// Opens a new scan window and clears the previous buffer.
    pub fn begin_scan(&mut self, filter: ScanFilter, deadline: Option<Instant>) {
        self.devices.clear();
        self.index.clear();
        self.scan = Some(ScanWindow { filter, deadline });
    }

    /// Closes the scan window. Returns false when no scan was running.
    pub fn end_scan(&mut self) -> bool {
        self.scan.take().is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    pub fn filter(&self) -> Option<&ScanFilter> {
        self.scan.as_ref().map(|scan| &scan.filter)
    }

    /// Deadline of the automatic stop, if the running scan has one
    pub fn deadline(&self) -> Option<Instant> {
        self.scan.as_ref().and_then(|scan| scan.deadline)
    }

    /// Drops the automatic stop of the running scan; someone else now owns
    /// its lifetime.
    pub fn release_deadline(&mut self) {
        if let Some(scan) = self.scan.as_mut() {
            scan.deadline = None;
        }
    }

    pub fn scan_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Records a discovery event, de-duplicating by identity.
    pub fn record(&mut self, device: Device) -> Sighting {
        if self.scan.is_none() {
            debug!("Ignoring late discovery of {} outside a scan window", device.id);
            return Sighting::Ignored;
        }
        if let (Some(floor), Some(rssi)) = (self.min_rssi, device.rssi) {
            if rssi < floor {
                debug!("Ignoring {} | rssi={} below floor {}", device.id, rssi, floor);
                return Sighting::Ignored;
            }
        }
        match self.index.get(&device.id) {
            Some(&slot) => {
                if let Some(existing) = self.devices.get_mut(slot) {
                    // A re-sighting may lack the name the first one carried
                    let name = device.name.clone().or_else(|| existing.name.take());
                    *existing = Device { name, ..device };
                }
                Sighting::Refreshed
            }
            None => {
                self.index.insert(device.id.clone(), self.devices.len());
                self.devices.push(device);
                Sighting::New
            }
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.index.get(id).and_then(|&slot| self.devices.get(slot))
    }

    /// First device (in sighting order) matching the target
    pub fn find(&self, target: &ConnectTarget) -> Option<&Device> {
        match target {
            ConnectTarget::Id(id) => self.get(id),
            ConnectTarget::Name(_) => self.devices.iter().find(|device| target.matches(device)),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::DeviceHandle;

    fn device(id: &str, name: Option<&str>, handle: u64) -> Device {
        Device::new(id, name.map(str::to_string), DeviceHandle::new(handle))
    }

    #[test]
    fn rediscovery_refreshes_in_place() {
        let mut registry = DeviceRegistry::new(None);
        registry.begin_scan(ScanFilter::default(), None);
        assert_eq!(registry.record(device("a", Some("Alpha"), 1)), Sighting::New);
        assert_eq!(registry.record(device("b", None, 2)), Sighting::New);
        assert_eq!(
            registry.record(device("a", None, 3).with_rssi(Some(-40))),
            Sighting::Refreshed
        );

        let ids: Vec<_> = registry.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        let alpha = registry.get(&DeviceId::from("a")).unwrap();
        assert_eq!(alpha.name.as_deref(), Some("Alpha"));
        assert_eq!(alpha.rssi, Some(-40));
        assert_eq!(alpha.handle, DeviceHandle::new(3));
    }

    #[test]
    fn new_scan_clears_buffer() {
        let mut registry = DeviceRegistry::new(None);
        registry.begin_scan(ScanFilter::default(), None);
        registry.record(device("a", None, 1));
        registry.begin_scan(ScanFilter::default(), None);
        assert!(registry.is_empty());
        assert_eq!(registry.record(device("a", None, 1)), Sighting::New);
    }

    #[test]
    fn end_scan_is_idempotent() {
        let mut registry = DeviceRegistry::new(None);
        registry.begin_scan(ScanFilter::default(), None);
        assert!(registry.end_scan());
        assert!(!registry.end_scan());
        assert_eq!(registry.record(device("late", None, 9)), Sighting::Ignored);
    }

    #[test]
    fn weak_signals_are_dropped() {
        let mut registry = DeviceRegistry::new(Some(-70));
        registry.begin_scan(ScanFilter::default(), None);
        assert_eq!(
            registry.record(device("far", None, 1).with_rssi(Some(-90))),
            Sighting::Ignored
        );
        assert_eq!(
            registry.record(device("near", None, 2).with_rssi(Some(-50))),
            Sighting::New
        );
    }

    #[test]
    fn name_lookup_returns_first_sighting() {
        let mut registry = DeviceRegistry::new(None);
        registry.begin_scan(ScanFilter::default(), None);
        registry.record(device("one", Some("Twin"), 1));
        registry.record(device("two", Some("Twin"), 2));
        let found = registry.find(&ConnectTarget::Name("Twin".into())).unwrap();
        assert_eq!(found.id.as_str(), "one");
    }
}
