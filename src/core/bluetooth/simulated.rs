//! In-memory transport
//! Stands in for the platform radio: it answers every call with the events a
//! well-behaved peripheral would produce and records the calls it saw. Faults
//! (silence, refused calls, rejected notifications, dropped links) can be
//! switched on per test.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_NOTIFY_CHAR_UUID, DEFAULT_SERVICE_UUID, DEFAULT_WRITE_CHAR_UUID,
    UUID_DEVICE_INFORMATION_SERVICE, UUID_GENERIC_ACCESS_SERVICE,
};
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{
    EventSink, EventStream, ScanFilter, Transport, TransportCommand, TransportEvent,
    TransportResult, event_channel,
};
use crate::core::bluetooth::types::{
    CharacteristicProperties, CharacteristicRef, Device, DeviceHandle, DiscoveredCharacteristic,
    PowerState, WriteMode,
};

/// GAP device name characteristic
const UUID_DEVICE_NAME_CHAR: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
/// Manufacturer name string characteristic
const UUID_MANUFACTURER_NAME_CHAR: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Clone)]
pub struct SimulatedCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SimulatedService {
    pub uuid: Uuid,
    pub characteristics: Vec<SimulatedCharacteristic>,
}

/// A fake peripheral and its GATT table
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub device: Device,
    pub rssi: Option<i16>,
    pub services: Vec<SimulatedService>,
}

impl SimulatedPeripheral {
    pub fn new(id: &str, name: Option<&str>, handle: u64) -> Self {
        Self {
            device: Device::new(id, name.map(str::to_string), DeviceHandle::new(handle)),
            rssi: Some(-60),
            services: Vec::new(),
        }
    }

    /// A peripheral laid out like the beacons this crate targets: GAP, device
    /// information and the data service with its write and notify
    /// characteristics.
    pub fn beacon(id: &str, name: &str, handle: u64) -> Self {
        Self::new(id, Some(name), handle)
            .with_characteristic(
                UUID_GENERIC_ACCESS_SERVICE,
                UUID_DEVICE_NAME_CHAR,
                CharacteristicProperties::readable(),
                name.as_bytes().to_vec(),
            )
            .with_characteristic(
                UUID_DEVICE_INFORMATION_SERVICE,
                UUID_MANUFACTURER_NAME_CHAR,
                CharacteristicProperties::readable(),
                b"Beacon Labs".to_vec(),
            )
            .with_characteristic(
                DEFAULT_SERVICE_UUID,
                DEFAULT_WRITE_CHAR_UUID,
                CharacteristicProperties::default()
                    .with_write()
                    .with_write_without_response(),
                Vec::new(),
            )
            .with_characteristic(
                DEFAULT_SERVICE_UUID,
                DEFAULT_NOTIFY_CHAR_UUID,
                CharacteristicProperties::readable().with_notify(),
                vec![0x00],
            )
    }

    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }

    /// Adds a characteristic, creating its service on first use.
    pub fn with_characteristic(
        mut self,
        service: Uuid,
        uuid: Uuid,
        properties: CharacteristicProperties,
        value: Vec<u8>,
    ) -> Self {
        let characteristic = SimulatedCharacteristic { uuid, properties, value };
        match self.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(characteristic),
            None => self.services.push(SimulatedService {
                uuid: service,
                characteristics: vec![characteristic],
            }),
        }
        self
    }

    fn advertises_any(&self, filter: &ScanFilter) -> bool {
        filter.services.is_empty()
            || self
                .services
                .iter()
                .any(|s| filter.services.contains(&s.uuid))
    }

    fn characteristic(&self, target: CharacteristicRef) -> Option<&SimulatedCharacteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == target.service)
            .and_then(|s| s.characteristics.iter().find(|c| c.uuid == target.characteristic))
    }

    fn characteristic_mut(&mut self, target: CharacteristicRef) -> Option<&mut SimulatedCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == target.service)
            .and_then(|s| s.characteristics.iter_mut().find(|c| c.uuid == target.characteristic))
    }
}

/// Switchable misbehaviour
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Report every successful connect twice
    pub duplicate_connected: bool,
    /// Connect attempts end in a connect-failed event with this reason
    pub refuse_connect: Option<String>,
    /// The peripheral answers subscribe requests with notifying=false
    pub reject_notify: bool,
    /// Calls (by command name) that succeed but never produce their event
    pub silent: HashSet<&'static str>,
    /// Calls (by command name) that fail outright
    pub failing: HashMap<&'static str, TransportError>,
}

#[derive(Debug)]
struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    calls: Vec<TransportCommand>,
    power: PowerState,
    faults: Faults,
}

/// Transport backed by in-memory peripherals
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    sink: EventSink,
}

impl SimulatedTransport {
    /// Creates the transport with a powered-on radio.
    pub fn new(peripherals: Vec<SimulatedPeripheral>) -> (Self, EventStream) {
        let (sink, events) = event_channel();
        let transport = Self {
            state: Arc::new(Mutex::new(SimState {
                peripherals,
                calls: Vec::new(),
                power: PowerState::PoweredOn,
                faults: Faults::default(),
            })),
            sink,
        };
        transport.sink.emit(TransportEvent::StateChanged(PowerState::PoweredOn));
        (transport, events)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the misbehaviour switches.
    pub fn configure(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.state().faults);
    }

    /// Pushes a raw event as if the radio had reported it.
    pub fn inject(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    pub fn set_power(&self, power: PowerState) {
        self.state().power = power;
        self.sink.emit(TransportEvent::StateChanged(power));
    }

    /// Simulates a value pushed by the peripheral.
    pub fn notify(&self, characteristic: CharacteristicRef, value: Vec<u8>) {
        self.sink.emit(TransportEvent::ValueUpdated { characteristic, value });
    }

    /// Simulates the link dropping without the central asking.
    pub fn drop_link(&self, handle: DeviceHandle, reason: &str) {
        let device = self
            .state()
            .peripherals
            .iter()
            .find(|p| p.device.handle == handle)
            .map(|p| p.device.id.clone());
        if let Some(device) = device {
            self.sink.emit(TransportEvent::Disconnected {
                device,
                error: Some(reason.to_string()),
            });
        }
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<TransportCommand> {
        self.state().calls.clone()
    }

    /// Number of calls with the given command name
    pub fn count(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| c.name() == name).count()
    }

    /// Current stored value of a characteristic on a peripheral
    pub fn value_of(&self, handle: DeviceHandle, target: CharacteristicRef) -> Option<Vec<u8>> {
        self.state()
            .peripherals
            .iter()
            .find(|p| p.device.handle == handle)
            .and_then(|p| p.characteristic(target).map(|c| c.value.clone()))
    }

    /// Records the call and decides whether it goes through. `Ok(true)` means
    /// the call should produce its event.
    fn begin(&self, command: TransportCommand) -> Result<bool, TransportError> {
        let mut state = self.state();
        let name = command.name();
        debug!("Simulated transport call: {:?}", command);
        state.calls.push(command);
        if state.power.is_unavailable() {
            return Err(TransportError::Unavailable);
        }
        if let Some(err) = state.faults.failing.get(name) {
            return Err(err.clone());
        }
        Ok(!state.faults.silent.contains(name))
    }

    fn peripheral(&self, handle: DeviceHandle) -> Result<SimulatedPeripheral, TransportError> {
        self.state()
            .peripherals
            .iter()
            .find(|p| p.device.handle == handle)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("unknown device handle {}", handle.raw())))
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn start_scan(&self, filter: &ScanFilter) -> TransportResult {
        if !self.begin(TransportCommand::StartScan(filter.clone()))? {
            return Ok(());
        }
        let found: Vec<_> = self
            .state()
            .peripherals
            .iter()
            .filter(|p| p.advertises_any(filter))
            .map(|p| (p.device.clone(), p.rssi))
            .collect();
        for (device, rssi) in found {
            self.sink.emit(TransportEvent::DeviceDiscovered { device, rssi });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult {
        self.begin(TransportCommand::StopScan)?;
        Ok(())
    }

    async fn connect(&self, device: DeviceHandle) -> TransportResult {
        let emit = self.begin(TransportCommand::Connect(device))?;
        let peripheral = self.peripheral(device)?;
        if !emit {
            return Ok(());
        }
        let faults = self.state().faults.clone();
        let id = peripheral.device.id;
        if let Some(reason) = faults.refuse_connect {
            self.sink.emit(TransportEvent::ConnectFailed { device: id, error: reason });
            return Ok(());
        }
        self.sink.emit(TransportEvent::Connected(id.clone()));
        if faults.duplicate_connected {
            self.sink.emit(TransportEvent::Connected(id));
        }
        Ok(())
    }

    async fn cancel_connection(&self, device: DeviceHandle) -> TransportResult {
        let emit = self.begin(TransportCommand::CancelConnection(device))?;
        let peripheral = self.peripheral(device)?;
        if emit {
            self.sink.emit(TransportEvent::Disconnected {
                device: peripheral.device.id,
                error: None,
            });
        }
        Ok(())
    }

    async fn discover_services(&self, device: DeviceHandle) -> TransportResult {
        let emit = self.begin(TransportCommand::DiscoverServices(device))?;
        let peripheral = self.peripheral(device)?;
        if emit {
            self.sink.emit(TransportEvent::ServicesDiscovered {
                device: peripheral.device.id,
                services: peripheral.services.iter().map(|s| s.uuid).collect(),
            });
        }
        Ok(())
    }

    async fn discover_characteristics(&self, device: DeviceHandle, service: Uuid) -> TransportResult {
        let emit = self.begin(TransportCommand::DiscoverCharacteristics { device, service })?;
        let peripheral = self.peripheral(device)?;
        let Some(found) = peripheral.services.iter().find(|s| s.uuid == service) else {
            return Err(TransportError::Failed(format!("no service {service}")));
        };
        if emit {
            self.sink.emit(TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics: found
                    .characteristics
                    .iter()
                    .map(|c| DiscoveredCharacteristic::new(c.uuid, c.properties))
                    .collect(),
            });
        }
        Ok(())
    }

    async fn read_value(&self, device: DeviceHandle, characteristic: CharacteristicRef) -> TransportResult {
        let emit = self.begin(TransportCommand::ReadValue { device, characteristic })?;
        let value = self
            .value_of(device, characteristic)
            .ok_or_else(|| TransportError::Failed(format!("no characteristic {characteristic}")))?;
        if emit {
            self.sink.emit(TransportEvent::ValueUpdated { characteristic, value });
        }
        Ok(())
    }

    async fn write_value(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> TransportResult {
        let emit = self.begin(TransportCommand::WriteValue {
            device,
            characteristic,
            value: value.to_vec(),
            mode,
        })?;
        {
            let mut state = self.state();
            let slot = state
                .peripherals
                .iter_mut()
                .find(|p| p.device.handle == device)
                .and_then(|p| p.characteristic_mut(characteristic))
                .ok_or_else(|| TransportError::Failed(format!("no characteristic {characteristic}")))?;
            slot.value = value.to_vec();
        }
        if emit && mode == WriteMode::WithResponse {
            self.sink.emit(TransportEvent::ValueWritten(characteristic));
        }
        Ok(())
    }

    async fn set_notify(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        enable: bool,
    ) -> TransportResult {
        let emit = self.begin(TransportCommand::SetNotify {
            device,
            characteristic,
            enable,
        })?;
        if emit {
            let notifying = enable && !self.state().faults.reject_notify;
            self.sink.emit(TransportEvent::NotifyStateUpdated {
                characteristic,
                notifying,
            });
        }
        Ok(())
    }
}
