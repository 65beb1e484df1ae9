use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{Instant, timeout};
use uuid::Uuid;

use beacon_central::config::profile_config::ProfileConfig;
use beacon_central::config::session_config::{ReconnectConfig, SessionConfig};
use beacon_central::core::bluetooth::{
    BeaconProfile, CentralEvent, CentralManager, CharacteristicProperties, CharacteristicRef,
    DEFAULT_NOTIFY_CHAR_UUID, DEFAULT_SERVICE_UUID, DEFAULT_WRITE_CHAR_UUID, DeviceHandle, Error,
    IntentKind, PowerState, ScanFilter, SessionState, SimulatedPeripheral, SimulatedTransport,
    Transport, TransportEvent, TransportResult, UUID_DEVICE_INFORMATION_SERVICE,
    UUID_GENERIC_ACCESS_SERVICE, WriteMode,
};

const SENSOR_SERVICE: Uuid = Uuid::from_u128(0x0000aa00_0000_1000_8000_00805f9b34fb);
const SENSOR_DATA: Uuid = Uuid::from_u128(0x0000aa01_0000_1000_8000_00805f9b34fb);
const SENSOR_CONFIG: Uuid = Uuid::from_u128(0x0000aa02_0000_1000_8000_00805f9b34fb);
const SENSOR_LABEL: Uuid = Uuid::from_u128(0x0000aa03_0000_1000_8000_00805f9b34fb);
const DEVICE_NAME_CHAR: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// Two services: GAP plus a sensor service with a notifying data
/// characteristic, a no-response config characteristic and an acknowledged
/// label characteristic.
fn sensor(id: &str, name: &str, handle: u64) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id, Some(name), handle)
        .with_characteristic(
            UUID_GENERIC_ACCESS_SERVICE,
            DEVICE_NAME_CHAR,
            CharacteristicProperties::readable(),
            name.as_bytes().to_vec(),
        )
        .with_characteristic(
            SENSOR_SERVICE,
            SENSOR_DATA,
            CharacteristicProperties::readable().with_notify(),
            vec![0],
        )
        .with_characteristic(
            SENSOR_SERVICE,
            SENSOR_CONFIG,
            CharacteristicProperties::readable().with_write_without_response(),
            vec![1],
        )
        .with_characteristic(
            SENSOR_SERVICE,
            SENSOR_LABEL,
            CharacteristicProperties::default().with_write(),
            Vec::new(),
        )
}

fn config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectConfig {
            max_attempts: 2,
            initial_delay_ms: 1_000,
            max_delay_ms: 4_000,
        },
        ..SessionConfig::default()
    }
}

fn start(peripherals: Vec<SimulatedPeripheral>) -> (CentralManager, SimulatedTransport) {
    start_with(peripherals, &config())
}

fn start_with(peripherals: Vec<SimulatedPeripheral>, config: &SessionConfig) -> (CentralManager, SimulatedTransport) {
    let (transport, events) = SimulatedTransport::new(peripherals);
    let manager = CentralManager::start(transport.clone(), events, config);
    (manager, transport)
}

/// Simulated radio whose reads never come back
#[derive(Clone)]
struct StuckReads(SimulatedTransport);

#[async_trait]
impl Transport for StuckReads {
    async fn start_scan(&self, filter: &ScanFilter) -> TransportResult {
        self.0.start_scan(filter).await
    }

    async fn stop_scan(&self) -> TransportResult {
        self.0.stop_scan().await
    }

    async fn connect(&self, device: DeviceHandle) -> TransportResult {
        self.0.connect(device).await
    }

    async fn cancel_connection(&self, device: DeviceHandle) -> TransportResult {
        self.0.cancel_connection(device).await
    }

    async fn discover_services(&self, device: DeviceHandle) -> TransportResult {
        self.0.discover_services(device).await
    }

    async fn discover_characteristics(&self, device: DeviceHandle, service: Uuid) -> TransportResult {
        self.0.discover_characteristics(device, service).await
    }

    async fn read_value(&self, _device: DeviceHandle, _characteristic: CharacteristicRef) -> TransportResult {
        std::future::pending().await
    }

    async fn write_value(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> TransportResult {
        self.0.write_value(device, characteristic, value, mode).await
    }

    async fn set_notify(
        &self,
        device: DeviceHandle,
        characteristic: CharacteristicRef,
        enable: bool,
    ) -> TransportResult {
        self.0.set_notify(device, characteristic, enable).await
    }
}

async fn next_matching(
    rx: &mut broadcast::Receiver<CentralEvent>,
    wanted: impl Fn(&CentralEvent) -> bool,
) -> CentralEvent {
    timeout(Duration::from_secs(300), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drains what has been broadcast so far; a snapshot round trip makes sure
/// the actor has caught up first.
async fn drain(manager: &CentralManager, rx: &mut broadcast::Receiver<CentralEvent>) -> Vec<CentralEvent> {
    manager.current_state().await.unwrap();
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn scan_without_match_ends_empty_after_timeout() {
    let (manager, _transport) = start(Vec::new());
    let mut events = manager.events();
    let started = Instant::now();

    let found: Vec<_> = manager
        .scan_for(ScanFilter::default(), Duration::from_secs(5))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(found.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(5));
    next_matching(&mut events, |e| matches!(e, CentralEvent::ScanStopped)).await;
    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.scanning);
}

#[tokio::test(start_paused = true)]
async fn scan_reports_each_device_once() {
    let (manager, transport) = start(vec![
        sensor("dev-a", "BeaconX", 1),
        SimulatedPeripheral::new("dev-b", None, 2),
    ]);
    let mut stream = manager
        .scan_for(ScanFilter::default(), Duration::from_secs(5))
        .await
        .unwrap();

    let first = stream.next().await.unwrap();
    assert_eq!(first.display_name(), "BeaconX");
    let second = stream.next().await.unwrap();
    assert_eq!(second.display_name(), "<no name>");

    // re-advertisement refreshes silently
    let again = SimulatedPeripheral::new("dev-a", None, 1).device;
    transport.inject(TransportEvent::DeviceDiscovered {
        device: again,
        rssi: Some(-30),
    });
    assert!(stream.next().await.is_none());

    let devices = manager.devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name.as_deref(), Some("BeaconX"));
    assert_eq!(devices[0].rssi, Some(-30));
}

#[tokio::test(start_paused = true)]
async fn stopping_twice_reports_one_stop() {
    let (manager, _transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    let mut events = manager.events();
    let _stream = manager.scan().await.unwrap();

    manager.stop_scan().await.unwrap();
    manager.stop_scan().await.unwrap();

    let stops = drain(&manager, &mut events)
        .await
        .into_iter()
        .filter(|e| matches!(e, CentralEvent::ScanStopped))
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_mid_scan_walks_through_discovery() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    transport.configure(|faults| faults.duplicate_connected = true);
    let mut events = manager.events();

    let _stream = manager
        .scan_for(ScanFilter::default(), Duration::from_secs(5))
        .await
        .unwrap();
    let services = manager.connect_by_name("BeaconX").await.unwrap();

    assert_eq!(transport.count("stopScan"), 1);
    assert_eq!(transport.count("connect"), 1);
    assert_eq!(transport.count("discoverServices"), 1);
    assert_eq!(transport.count("discoverCharacteristics"), 2);
    assert_eq!(services.len(), 2);
    assert_eq!(services[1].characteristics.len(), 3);

    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.device.unwrap().id.as_str(), "dev-a");
    next_matching(&mut events, |e| matches!(e, CentralEvent::SessionReady { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn connect_scans_for_an_unseen_device() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_id("dev-a").await.unwrap();
    assert_eq!(transport.count("startScan"), 1);
    assert_eq!(transport.count("stopScan"), 1);
    assert!(!manager.current_state().await.unwrap().scanning);
}

#[tokio::test(start_paused = true)]
async fn connect_replaces_a_filtered_scan() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    let mut stream = manager
        .scan_for(ScanFilter::services([Uuid::from_u128(0xbb00)]), Duration::from_secs(60))
        .await
        .unwrap();

    manager.connect_by_name("BeaconX").await.unwrap();

    assert_eq!(transport.count("startScan"), 2);
    assert!(stream.next().await.is_none());
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn refused_connect_returns_to_idle() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    transport.configure(|faults| faults.refuse_connect = Some("out of range".into()));
    let mut events = manager.events();

    assert_eq!(
        manager.connect_by_name("BeaconX").await,
        Err(Error::ConnectFailed("out of range".into()))
    );

    let failed = next_matching(&mut events, |e| matches!(e, CentralEvent::ConnectFailed { .. })).await;
    assert!(matches!(
        failed,
        CentralEvent::ConnectFailed { ref reason, .. } if reason.contains("out of range")
    ));
    assert_eq!(transport.count("connect"), 1);
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_searching_cancels_the_connect() {
    let (manager, _transport) = start(Vec::new());
    let mut events = manager.events();

    let connecting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect_by_name("Ghost").await }
    });
    while manager.current_state().await.unwrap().state != SessionState::ScanningForConnect {
        tokio::task::yield_now().await;
    }

    manager.disconnect().await.unwrap();

    assert_eq!(connecting.await.unwrap(), Err(Error::Cancelled));
    next_matching(&mut events, |e| matches!(e, CentralEvent::ScanStopped)).await;
    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.scanning);
}

#[tokio::test(start_paused = true)]
async fn device_list_marks_the_linked_device() {
    let (manager, _transport) = start(vec![
        sensor("dev-a", "BeaconX", 1),
        SimulatedPeripheral::new("dev-b", None, 2),
    ]);
    manager.connect_by_name("BeaconX").await.unwrap();

    let devices = manager.devices().await.unwrap();
    let linked: Vec<_> = devices.iter().filter(|d| d.connected).map(|d| d.id.as_str()).collect();
    assert_eq!(linked, ["dev-a"]);

    manager.disconnect().await.unwrap();
    assert!(manager.devices().await.unwrap().iter().all(|d| !d.connected));
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_when_target_never_appears() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    let started = Instant::now();

    let result = manager.connect_by_name("Ghost").await;

    assert!(matches!(result, Err(Error::DeviceNotFound(_))));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(transport.count("connect"), 0);
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_refused() {
    let (manager, _transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    assert_eq!(manager.connect_by_name("BeaconX").await, Err(Error::SessionActive));
}

#[tokio::test(start_paused = true)]
async fn reads_standard_services() {
    let (manager, _transport) = start(vec![SimulatedPeripheral::beacon("dev-b", "BeaconY", 2)]);
    let services = manager.connect_by_name("BeaconY").await.unwrap();
    let uuids: Vec<_> = services.iter().map(|s| s.uuid).collect();
    assert_eq!(
        uuids,
        [UUID_GENERIC_ACCESS_SERVICE, UUID_DEVICE_INFORMATION_SERVICE, DEFAULT_SERVICE_UUID]
    );

    let name = manager
        .read(UUID_GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR)
        .await
        .unwrap();
    assert_eq!(name, b"BeaconY");

    let cached = manager.current_state().await.unwrap().services;
    assert_eq!(cached[0].characteristics[0].value.as_deref(), Some(&b"BeaconY"[..]));
}

#[tokio::test(start_paused = true)]
async fn operations_require_a_session() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    assert_eq!(manager.read(SENSOR_SERVICE, SENSOR_DATA).await, Err(Error::NotConnected));
    assert_eq!(manager.disconnect().await, Err(Error::NotConnected));
    assert_eq!(manager.unsubscribe().await, Err(Error::NotConnected));
    assert_eq!(transport.calls().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_read_while_one_is_pending_fails_fast() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    transport.configure(|faults| {
        faults.silent.insert("readValue");
    });

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.read(SENSOR_SERVICE, SENSOR_DATA).await }
    });
    while manager.current_state().await.unwrap().pending.is_none() {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        manager.current_state().await.unwrap().pending,
        Some(IntentKind::Read(CharacteristicRef::new(SENSOR_SERVICE, SENSOR_DATA)))
    );

    assert_eq!(
        manager.read(SENSOR_SERVICE, SENSOR_CONFIG).await,
        Err(Error::OperationInFlight)
    );
    assert_eq!(transport.count("readValue"), 1);

    // the silent read eventually times out
    assert_eq!(first.await.unwrap(), Err(Error::Timeout("read")));
}

#[tokio::test(start_paused = true)]
async fn hung_radio_call_does_not_stall_the_session() {
    let (simulated, transport_events) = SimulatedTransport::new(vec![sensor("dev-a", "BeaconX", 1)]);
    let manager = CentralManager::start(StuckReads(simulated), transport_events, &config());
    manager.connect_by_name("BeaconX").await.unwrap();

    let started = Instant::now();
    assert_eq!(
        manager.read(SENSOR_SERVICE, SENSOR_DATA).await,
        Err(Error::Timeout("read"))
    );
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Ready);

    let reading = tokio::spawn({
        let manager = manager.clone();
        async move { manager.read(SENSOR_SERVICE, SENSOR_DATA).await }
    });
    while manager.current_state().await.unwrap().pending.is_none() {
        tokio::task::yield_now().await;
    }
    manager.disconnect().await.unwrap();

    assert_eq!(reading.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_write_reads_back() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();

    manager
        .write(SENSOR_SERVICE, SENSOR_CONFIG, vec![0xde, 0xad])
        .await
        .unwrap();
    let value = manager.read(SENSOR_SERVICE, SENSOR_CONFIG).await.unwrap();
    assert_eq!(value, vec![0xde, 0xad]);
    assert_eq!(
        transport.value_of(DeviceHandle::new(1), CharacteristicRef::new(SENSOR_SERVICE, SENSOR_CONFIG)),
        Some(vec![0xde, 0xad])
    );
}

#[tokio::test(start_paused = true)]
async fn confirmed_unacknowledged_write() {
    let config = SessionConfig {
        confirm_unacknowledged_writes: true,
        ..config()
    };
    let (manager, transport) = start_with(vec![sensor("dev-a", "BeaconX", 1)], &config);
    manager.connect_by_name("BeaconX").await.unwrap();

    manager.write(SENSOR_SERVICE, SENSOR_CONFIG, vec![5]).await.unwrap();
    assert_eq!(transport.count("writeValue"), 1);
    assert_eq!(transport.count("readValue"), 1);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_write_waits_for_confirmation() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();

    manager.write(SENSOR_SERVICE, SENSOR_LABEL, b"kitchen".to_vec()).await.unwrap();
    let snapshot = manager.current_state().await.unwrap();
    let label = snapshot.services[1]
        .characteristics
        .iter()
        .find(|c| c.uuid == SENSOR_LABEL)
        .unwrap();
    assert_eq!(label.value.as_deref(), Some(&b"kitchen"[..]));

    transport.configure(|faults| {
        faults.silent.insert("writeValue");
    });
    assert_eq!(
        manager.write(SENSOR_SERVICE, SENSOR_LABEL, b"hall".to_vec()).await,
        Err(Error::Timeout("write"))
    );
}

#[tokio::test(start_paused = true)]
async fn write_without_capability_never_reaches_transport() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();

    assert_eq!(
        manager.write(SENSOR_SERVICE, SENSOR_DATA, vec![1]).await,
        Err(Error::WriteUnsupported)
    );
    assert_eq!(
        manager.write(SENSOR_SERVICE, Uuid::from_u128(0xdead), vec![1]).await,
        Err(Error::CharacteristicNotFound {
            service: SENSOR_SERVICE,
            characteristic: Uuid::from_u128(0xdead)
        })
    );
    assert_eq!(transport.count("writeValue"), 0);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_value_becomes_notification() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    let mut events = manager.events();

    manager.subscribe(SENSOR_SERVICE, SENSOR_DATA).await.unwrap();
    let data = CharacteristicRef::new(SENSOR_SERVICE, SENSOR_DATA);
    assert_eq!(manager.current_state().await.unwrap().subscribed, Some(data));

    transport.notify(data, vec![21, 22]);
    let event = next_matching(&mut events, |e| matches!(e, CentralEvent::NotificationReceived { .. })).await;
    assert_eq!(
        event,
        CentralEvent::NotificationReceived {
            characteristic: data,
            value: vec![21, 22]
        }
    );
    assert_eq!(manager.current_state().await.unwrap().pending, None);

    // subscribing again to the same characteristic is a no-op
    manager.subscribe(SENSOR_SERVICE, SENSOR_DATA).await.unwrap();
    assert_eq!(transport.count("setNotify"), 1);
}

#[tokio::test(start_paused = true)]
async fn stray_value_is_dropped() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    let mut events = manager.events();

    transport.notify(CharacteristicRef::new(SENSOR_SERVICE, SENSOR_CONFIG), vec![9]);
    let seen = drain(&manager, &mut events).await;
    assert!(seen.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_subscription_is_reported() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    transport.configure(|faults| faults.reject_notify = true);

    assert_eq!(
        manager.subscribe(SENSOR_SERVICE, SENSOR_DATA).await,
        Err(Error::NotifyRejected)
    );
    assert_eq!(
        manager.subscribe(SENSOR_SERVICE, SENSOR_CONFIG).await,
        Err(Error::NotifyUnsupported)
    );
    assert_eq!(manager.current_state().await.unwrap().subscribed, None);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_keeps_the_session() {
    let (manager, _transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    assert_eq!(manager.unsubscribe().await, Err(Error::NotSubscribed));

    manager.subscribe(SENSOR_SERVICE, SENSOR_DATA).await.unwrap();
    manager.unsubscribe().await.unwrap();

    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.subscribed, None);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_the_session() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    let mut events = manager.events();

    manager.disconnect().await.unwrap();

    assert_eq!(transport.count("cancelConnection"), 1);
    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.services.is_empty());
    assert!(snapshot.device.is_none());
    let closed = next_matching(&mut events, |e| matches!(e, CentralEvent::SessionClosed { .. })).await;
    assert!(matches!(closed, CentralEvent::SessionClosed { reason: None, .. }));

    // the device is still known, so a new session can start right away
    manager.connect_by_name("BeaconX").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_disconnect_is_forced_closed() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    transport.configure(|faults| {
        faults.silent.insert("cancelConnection");
    });

    let started = Instant::now();
    manager.disconnect().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn unexpected_drop_reconnects() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    manager.subscribe(SENSOR_SERVICE, SENSOR_DATA).await.unwrap();
    let mut events = manager.events();

    transport.drop_link(DeviceHandle::new(1), "supervision timeout");

    let lost = next_matching(&mut events, |e| matches!(e, CentralEvent::ConnectionLost { .. })).await;
    assert!(matches!(lost, CentralEvent::ConnectionLost { attempt: 1, .. }));
    next_matching(&mut events, |e| matches!(e, CentralEvent::SessionReady { .. })).await;

    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.subscribed, None);
    assert_eq!(transport.count("connect"), 2);
    assert_eq!(transport.count("discoverServices"), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_runs_out() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    let mut events = manager.events();
    transport.configure(|faults| faults.refuse_connect = Some("out of range".into()));

    transport.drop_link(DeviceHandle::new(1), "supervision timeout");

    let closed = next_matching(&mut events, |e| matches!(e, CentralEvent::SessionClosed { .. })).await;
    assert_eq!(
        closed,
        CentralEvent::SessionClosed {
            device: Some(sensor("dev-a", "BeaconX", 1).device),
            reason: Some(Error::UnexpectedDisconnect.to_string()),
        }
    );
    assert_eq!(transport.count("connect"), 3);
    assert_eq!(manager.current_state().await.unwrap().state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn power_loss_tears_everything_down() {
    let (manager, transport) = start(vec![sensor("dev-a", "BeaconX", 1)]);
    manager.connect_by_name("BeaconX").await.unwrap();
    let mut events = manager.events();

    transport.set_power(PowerState::PoweredOff);

    next_matching(&mut events, |e| {
        matches!(e, CentralEvent::PowerStateChanged(PowerState::PoweredOff))
    })
    .await;
    let closed = next_matching(&mut events, |e| matches!(e, CentralEvent::SessionClosed { .. })).await;
    assert!(matches!(
        closed,
        CentralEvent::SessionClosed { reason: Some(ref reason), .. } if *reason == Error::TransportUnavailable.to_string()
    ));
    let snapshot = manager.current_state().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.power, PowerState::PoweredOff);

    assert_eq!(manager.connect_by_name("BeaconX").await, Err(Error::TransportUnavailable));
    assert!(matches!(manager.scan().await, Err(Error::TransportUnavailable)));
}

#[tokio::test(start_paused = true)]
async fn profile_sends_and_listens() {
    let (manager, transport) = start(vec![SimulatedPeripheral::beacon("dev-b", "BeaconY", 2)]);
    let profile_config = ProfileConfig {
        device_name: Some("BeaconY".into()),
        ..ProfileConfig::default()
    };
    let mut profile = BeaconProfile::new(manager, profile_config);
    profile.connect().await.unwrap();

    profile.send_text("ping").await.unwrap();
    let write_target = CharacteristicRef::new(DEFAULT_SERVICE_UUID, DEFAULT_WRITE_CHAR_UUID);
    assert_eq!(transport.value_of(DeviceHandle::new(2), write_target), Some(b"ping".to_vec()));
    assert_eq!(profile.read_notify_source().await.unwrap(), vec![0x00]);

    let mut values = profile.start_listening().await.unwrap();
    let source = CharacteristicRef::new(DEFAULT_SERVICE_UUID, DEFAULT_NOTIFY_CHAR_UUID);
    transport.notify(source, b"pong".to_vec());
    assert_eq!(values.recv().await, Some((source, b"pong".to_vec())));

    profile.stop_listening().await.unwrap();
    assert_eq!(values.recv().await, None);
    assert_eq!(
        profile.manager().current_state().await.unwrap().state,
        SessionState::Ready
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_later_calls() {
    let (manager, _transport) = start(Vec::new());
    manager.shutdown();
    tokio::task::yield_now().await;
    assert_eq!(manager.devices().await.map(|d| d.len()), Err(Error::ManagerStopped));
}
