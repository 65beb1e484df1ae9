//! Central manager
//! This module provides the main interface for bluetooth operations. A
//! [`CentralManager`] is a cheap handle onto a single actor task that owns the
//! transport, the device registry and the session state machine. Requests from
//! every handle and events from the radio are processed one at a time in
//! arrival order, so no locking is needed around session state. Transport
//! calls run in their own tasks and report back through a completion channel,
//! so a radio call that never returns cannot stall the actor.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::constants::COMMAND_CHANNEL_CAPACITY;
use crate::core::bluetooth::error::{Error, Result};
use crate::core::bluetooth::registry::{DeviceRegistry, Sighting};
use crate::core::bluetooth::session::{Effect, Reply, Session};
use crate::core::bluetooth::transport::{
    EventStream, ScanFilter, Transport, TransportCommand, TransportEvent, TransportResult,
};
use crate::core::bluetooth::types::{
    CentralEvent, CharacteristicRef, ConnectTarget, Device, DeviceId, ServiceInfo,
    SessionSnapshot, SessionState,
};

/// Devices found by a scan, ending when the scan stops
pub type DeviceStream = Pin<Box<dyn Stream<Item = Device> + Send>>;

enum Request {
    Scan {
        filter: ScanFilter,
        timeout: Duration,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        target: ConnectTarget,
        reply: Reply<Vec<ServiceInfo>>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Read {
        target: CharacteristicRef,
        reply: Reply<Vec<u8>>,
    },
    Write {
        target: CharacteristicRef,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    Subscribe {
        target: CharacteristicRef,
        reply: Reply<()>,
    },
    Unsubscribe {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Devices {
        reply: Reply<Vec<Device>>,
    },
}

/// Handle onto the central. Clones share the same session.
#[derive(Clone)]
pub struct CentralManager {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<CentralEvent>,
    shutdown: CancellationToken,
    scan_timeout: Duration,
}

impl CentralManager {
    /// Spawns the session actor on the current tokio runtime.
    pub fn start<T: Transport>(transport: T, transport_events: EventStream, config: &SessionConfig) -> Self {
        let (requests, request_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shutdown = CancellationToken::new();

        let transport = Arc::new(transport);
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let actor = CentralActor {
            scan_lane: spawn_scan_lane(transport.clone(), completions.clone()),
            transport,
            completions,
            session: Session::new(config),
            registry: DeviceRegistry::new(config.min_rssi),
            events: events.clone(),
            scan_generation: 0,
            pending_scan: None,
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            actor.run(request_rx, transport_events, completion_rx, token).await;
        });
        info!("Central manager started.");

        Self {
            requests,
            events,
            shutdown,
            scan_timeout: config.scan_timeout(),
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(build(reply)).await?;
        rx.await?
    }

    /// Subscribes to everything the central reports.
    pub fn events(&self) -> broadcast::Receiver<CentralEvent> {
        self.events.subscribe()
    }

    /// Scans with the configured default duration.
    pub async fn scan(&self) -> Result<DeviceStream> {
        self.scan_for(ScanFilter::default(), self.scan_timeout).await
    }

    /// Starts a scan that stops on its own after `timeout`. The returned
    /// stream yields each newly sighted device once and ends with the scan.
    pub async fn scan_for(&self, filter: ScanFilter, timeout: Duration) -> Result<DeviceStream> {
        // subscribe first so no sighting is lost
        let rx = self.events.subscribe();
        self.request(|reply| Request::Scan { filter, timeout, reply }).await?;
        Ok(device_stream(rx))
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| Request::StopScan { reply }).await
    }

    /// Connects to the first device advertising exactly this name.
    pub async fn connect_by_name(&self, name: impl Into<String>) -> Result<Vec<ServiceInfo>> {
        self.connect(ConnectTarget::Name(name.into())).await
    }

    pub async fn connect_by_id(&self, id: impl Into<DeviceId>) -> Result<Vec<ServiceInfo>> {
        self.connect(ConnectTarget::Id(id.into())).await
    }

    /// Connects and discovers every service and characteristic. Resolves
    /// once the session is ready to use.
    pub async fn connect(&self, target: ConnectTarget) -> Result<Vec<ServiceInfo>> {
        self.request(|reply| Request::Connect { target, reply }).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let target = CharacteristicRef::new(service, characteristic);
        self.request(|reply| Request::Read { target, reply }).await
    }

    pub async fn write(&self, service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Result<()> {
        let target = CharacteristicRef::new(service, characteristic);
        let value = value.into();
        self.request(|reply| Request::Write { target, value, reply }).await
    }

    /// Enables notifications; values arrive as
    /// [`CentralEvent::NotificationReceived`].
    pub async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let target = CharacteristicRef::new(service, characteristic);
        self.request(|reply| Request::Subscribe { target, reply }).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.request(|reply| Request::Unsubscribe { reply }).await
    }

    pub async fn current_state(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    /// Devices sighted during the current (or last) scan
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.request(|reply| Request::Devices { reply }).await
    }

    /// Stops the actor. Pending callers get [`Error::ManagerStopped`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn device_stream(rx: broadcast::Receiver<CentralEvent>) -> DeviceStream {
    // events before our ScanStarted belong to a scan we replaced
    Box::pin(stream::unfold((rx, false), |(mut rx, mut started)| async move {
        loop {
            match rx.recv().await {
                Ok(CentralEvent::ScanStarted) => started = true,
                Ok(CentralEvent::DeviceDiscovered(device)) if started => {
                    return Some((device, (rx, started)));
                }
                Ok(CentralEvent::ScanStopped) if started => return None,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scan listener lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

/// Where a transport call came from, so its result reaches the right place
#[derive(Debug, Clone, Copy)]
enum Origin {
    Session,
    UserScan(u64),
    ConnectScan(u64),
    Housekeeping,
}

/// A finished transport call
struct Completion {
    command: TransportCommand,
    origin: Origin,
    result: TransportResult,
}

type ScanJob = (TransportCommand, Origin);

/// Scan start/stop calls go through one worker so the radio sees them in the
/// order they were issued.
fn spawn_scan_lane<T: Transport>(
    transport: Arc<T>,
    completions: mpsc::UnboundedSender<Completion>,
) -> mpsc::UnboundedSender<ScanJob> {
    let (lane, mut jobs) = mpsc::unbounded_channel::<ScanJob>();
    tokio::spawn(async move {
        while let Some((command, origin)) = jobs.recv().await {
            let result = command.issue(transport.as_ref()).await;
            if completions.send(Completion { command, origin, result }).is_err() {
                break;
            }
        }
        debug!("Scan lane closed.");
    });
    lane
}

struct CentralActor<T: Transport> {
    transport: Arc<T>,
    completions: mpsc::UnboundedSender<Completion>,
    scan_lane: mpsc::UnboundedSender<ScanJob>,
    session: Session,
    registry: DeviceRegistry,
    events: broadcast::Sender<CentralEvent>,
    /// Bumped on every scan start; stale scan results are recognised by it
    scan_generation: u64,
    /// Caller of a user scan whose start has not been confirmed yet
    pending_scan: Option<(u64, Reply<()>)>,
}

impl<T: Transport> CentralActor<T> {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut transport_events: EventStream,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        shutdown: CancellationToken,
    ) {
        let mut transport_open = true;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Central manager shutting down.");
                    break;
                }
                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Transport event stream ended.");
                        transport_open = false;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!("All central handles dropped.");
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_timer();
                }
            }
        }

        let scanning = self.registry.end_scan();
        let handle = self.session.device().map(|device| device.handle);
        let transport = self.transport.clone();
        // pending callers see ManagerStopped once the session is gone
        drop(self);
        tokio::spawn(async move {
            if scanning {
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to stop scan on shutdown: {}", e);
                }
            }
            if let Some(handle) = handle {
                if let Err(e) = transport.cancel_connection(handle).await {
                    warn!("Failed to disconnect on shutdown: {}", e);
                }
            }
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.session.next_deadline(), self.registry.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn emit(&self, event: CentralEvent) {
        debug!("Central event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Issues a transport call in its own task.
    fn dispatch(&self, command: TransportCommand, origin: Origin) {
        debug!("Issuing {}", command.name());
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = command.issue(transport.as_ref()).await;
            // the actor may have shut down meanwhile
            let _ = completions.send(Completion { command, origin, result });
        });
    }

    fn dispatch_scan(&self, command: TransportCommand, origin: Origin) {
        debug!("Queueing {}", command.name());
        if self.scan_lane.send((command, origin)).is_err() {
            error!("Scan lane is gone, dropping scan call");
        }
    }

    fn handle_request(&mut self, request: Request) {
        let now = Instant::now();
        let effects = match request {
            Request::Scan { filter, timeout, reply } => self.start_user_scan(filter, timeout, reply),
            Request::StopScan { reply } => {
                let effects = self.stop_scan();
                let _ = reply.send(Ok(()));
                effects
            }
            Request::Connect { target, reply } => {
                let known = self.registry.find(&target).cloned();
                self.session.connect(target, known, reply, now)
            }
            Request::Disconnect { reply } => self.session.disconnect(reply, now),
            Request::Read { target, reply } => self.session.read(target, reply, now),
            Request::Write { target, value, reply } => self.session.write(target, value, reply, now),
            Request::Subscribe { target, reply } => self.session.subscribe(target, reply, now),
            Request::Unsubscribe { reply } => self.session.unsubscribe(reply, now),
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.session.snapshot(self.registry.is_scanning())));
                Vec::new()
            }
            Request::Devices { reply } => {
                let _ = reply.send(Ok(self.device_list()));
                Vec::new()
            }
        };
        self.apply(effects);
    }

    /// Registry contents with the linked device marked
    fn device_list(&self) -> Vec<Device> {
        let linked = self
            .session
            .device()
            .filter(|_| self.session.state().has_link())
            .map(|device| device.id.clone());
        self.registry
            .devices()
            .iter()
            .cloned()
            .map(|mut device| {
                device.connected = linked.as_ref() == Some(&device.id);
                device
            })
            .collect()
    }

    fn start_user_scan(&mut self, filter: ScanFilter, timeout: Duration, reply: Reply<()>) -> Vec<Effect> {
        if self.session.power().is_unavailable() {
            let _ = reply.send(Err(Error::TransportUnavailable));
            return Vec::new();
        }
        if self.session.state() == &SessionState::ScanningForConnect {
            let _ = reply.send(Err(Error::SessionActive));
            return Vec::new();
        }

        // a new scan replaces the running one
        let effects = self.stop_scan();

        info!("Starting bluetooth scan | timeout={:?} | filter={:?}", timeout, filter.services);
        let generation = self.begin_scan(filter.clone(), Some(Instant::now() + timeout));
        self.pending_scan = Some((generation, reply));
        self.dispatch_scan(TransportCommand::StartScan(filter), Origin::UserScan(generation));
        effects
    }

    fn begin_scan(&mut self, filter: ScanFilter, deadline: Option<Instant>) -> u64 {
        self.scan_generation += 1;
        self.registry.begin_scan(filter, deadline);
        self.emit(CentralEvent::ScanStarted);
        self.scan_generation
    }

    /// Ends the running scan and tells the session. Stopping twice is
    /// harmless.
    fn stop_scan(&mut self) -> Vec<Effect> {
        if !self.end_scan() {
            return Vec::new();
        }
        self.session.on_scan_stopped()
    }

    /// Ends the running scan without involving the session.
    fn end_scan(&mut self) -> bool {
        if !self.registry.end_scan() {
            return false;
        }
        info!("Stopping Bluetooth scan. {} devices found.", self.registry.len());
        self.dispatch_scan(TransportCommand::StopScan, Origin::Housekeeping);
        self.emit(CentralEvent::ScanStopped);
        self.resolve_pending_scan(Ok(()));
        true
    }

    fn resolve_pending_scan(&mut self, result: Result<()>) {
        if let Some((_, reply)) = self.pending_scan.take() {
            let _ = reply.send(result);
        }
    }

    /// Tears down the scan a failed start belonged to, unless a newer scan
    /// has replaced it already.
    fn scan_start_failed(&mut self, generation: u64) -> bool {
        if generation != self.scan_generation || !self.registry.end_scan() {
            return false;
        }
        self.emit(CentralEvent::ScanStopped);
        true
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { command, origin, result } = completion;
        let now = Instant::now();
        let effects = match (origin, result) {
            (Origin::Session, result) => self.session.command_completed(&command, result, now),
            (Origin::UserScan(generation), Ok(())) => {
                if self.pending_scan.as_ref().is_some_and(|(g, _)| *g == generation) {
                    self.resolve_pending_scan(Ok(()));
                }
                Vec::new()
            }
            (Origin::UserScan(generation), Err(e)) => {
                error!("Failed to start scan: {}", e);
                if self.pending_scan.as_ref().is_some_and(|(g, _)| *g == generation) {
                    self.resolve_pending_scan(Err(e.into()));
                }
                if self.scan_start_failed(generation) {
                    self.session.on_scan_stopped()
                } else {
                    Vec::new()
                }
            }
            (Origin::ConnectScan(_), Ok(())) => Vec::new(),
            (Origin::ConnectScan(generation), Err(e)) => {
                if self.scan_start_failed(generation) {
                    self.session.command_completed(&command, Err(e), now)
                } else {
                    debug!("Ignoring failure of a replaced scan: {}", e);
                    Vec::new()
                }
            }
            (Origin::Housekeeping, Ok(())) => Vec::new(),
            (Origin::Housekeeping, Err(e)) => {
                warn!("Transport call {} failed: {}", command.name(), e);
                Vec::new()
            }
        };
        self.apply(effects);
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let now = Instant::now();
        let effects = match event {
            TransportEvent::StateChanged(power) => self.session.on_power_state(power),
            TransportEvent::DeviceDiscovered { device, rssi } => {
                let rssi = rssi.or(device.rssi);
                let id = device.id.clone();
                match self.registry.record(device.with_rssi(rssi)) {
                    Sighting::Ignored => Vec::new(),
                    sighting => match self.registry.get(&id).cloned() {
                        Some(device) => {
                            if sighting == Sighting::New {
                                info!(
                                    "Found device | id={} | name={} | address={:?} | rssi={:?}",
                                    device.id,
                                    device.display_name(),
                                    device.address,
                                    device.rssi
                                );
                                self.emit(CentralEvent::DeviceDiscovered(device.clone()));
                            }
                            self.session.on_device_discovered(&device, now)
                        }
                        None => Vec::new(),
                    },
                }
            }
            TransportEvent::Connected(id) => self.session.on_connected(&id, now),
            TransportEvent::ConnectFailed { device, error } => {
                self.session.on_connect_failed(&device, &error, now)
            }
            TransportEvent::Disconnected { device, error } => {
                self.session.on_disconnected(&device, error.as_deref(), now)
            }
            TransportEvent::ServicesDiscovered { device, services } => {
                self.session.on_services_discovered(&device, &services, now)
            }
            TransportEvent::CharacteristicsDiscovered { service, characteristics } => {
                self.session.on_characteristics_discovered(service, characteristics)
            }
            TransportEvent::ValueUpdated { characteristic, value } => {
                self.session.on_value_updated(characteristic, value)
            }
            TransportEvent::ValueWritten(characteristic) => self.session.on_value_written(characteristic),
            TransportEvent::NotifyStateUpdated { characteristic, notifying } => {
                self.session.on_notify_state(characteristic, notifying, now)
            }
        };
        self.apply(effects);
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();
        let mut effects = Vec::new();
        if self.registry.scan_expired(now) {
            debug!("Scan window elapsed.");
            effects.extend(self.stop_scan());
        }
        effects.extend(self.session.on_timer(now));
        self.apply(effects);
    }

    /// Runs effects in order; effects produced along the way are queued
    /// behind the current ones.
    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let more = self.perform(effect);
            queue.extend(more);
        }
    }

    fn perform(&mut self, effect: Effect) -> Vec<Effect> {
        match effect {
            Effect::Notify(event) => {
                self.emit(event);
                Vec::new()
            }
            Effect::StartScan(filter) => {
                if self.registry.is_scanning() {
                    if self.registry.filter().is_some_and(|running| running.covers(&filter)) {
                        debug!("Reusing running scan | filter={:?}", self.registry.filter());
                        self.registry.release_deadline();
                        return Vec::new();
                    }
                    // the running filter could hide the target
                    info!("Replacing filtered scan for connect.");
                    self.end_scan();
                }
                info!("Starting bluetooth scan for connect.");
                let generation = self.begin_scan(filter.clone(), None);
                self.dispatch_scan(TransportCommand::StartScan(filter), Origin::ConnectScan(generation));
                Vec::new()
            }
            Effect::StopScan => self.stop_scan(),
            Effect::AbandonScan => {
                if self.registry.end_scan() {
                    info!("Scan ended by the radio.");
                    self.emit(CentralEvent::ScanStopped);
                    self.resolve_pending_scan(Err(Error::TransportUnavailable));
                }
                Vec::new()
            }
            Effect::Command(command) => {
                self.dispatch(command, Origin::Session);
                Vec::new()
            }
        }
    }
}
