//! Session state machine
//! Owns the lifecycle of the single active connection and the one pending
//! intent. Every input (a caller request, a transport event, a finished
//! transport call or an elapsed deadline) goes in through a method here and
//! comes back out as a list of [`Effect`]s for the manager to carry out.
//! Inputs that make no sense in the current state are logged and ignored, so
//! duplicated or late radio callbacks cannot move the machine.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::cache::CharacteristicCache;
use crate::core::bluetooth::connection::ReconnectPolicy;
use crate::core::bluetooth::error::{Error, Result};
use crate::core::bluetooth::transport::{ScanFilter, TransportCommand, TransportResult};
use crate::core::bluetooth::types::{
    CentralEvent, CharacteristicRef, ConnectTarget, Device, DeviceHandle, DeviceId,
    DiscoveredCharacteristic, IntentKind, PowerState, ServiceInfo, SessionSnapshot, SessionState,
    WriteMode,
};

/// Reply channel of a suspended caller
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Work the manager performs on behalf of the session
#[derive(Debug)]
pub enum Effect {
    /// Make sure a scan with this filter is running. A running scan whose
    /// filter covers it is kept and loses its automatic stop.
    StartScan(ScanFilter),
    /// Stop the running scan, if any.
    StopScan,
    /// Forget the running scan without calling the radio (it is gone).
    AbandonScan,
    /// Issue a transport call and report back through
    /// [`Session::command_completed`].
    Command(TransportCommand),
    /// Broadcast to subscribers.
    Notify(CentralEvent),
}

#[derive(Debug)]
enum Operation {
    Read {
        target: CharacteristicRef,
        reply: Reply<Vec<u8>>,
    },
    Write {
        target: CharacteristicRef,
        value: Vec<u8>,
        mode: WriteMode,
        /// A confirming read has been issued for a no-response write
        confirming: bool,
        reply: Reply<()>,
    },
    Subscribe {
        target: CharacteristicRef,
        reply: Reply<()>,
    },
    Unsubscribe {
        target: CharacteristicRef,
        reply: Reply<()>,
    },
    Disconnect {
        replies: Vec<Reply<()>>,
    },
}

#[derive(Debug)]
struct PendingIntent {
    operation: Operation,
    deadline: Instant,
}

impl PendingIntent {
    fn kind(&self) -> IntentKind {
        match &self.operation {
            Operation::Read { target, .. } => IntentKind::Read(*target),
            Operation::Write { target, .. } => IntentKind::Write(*target),
            Operation::Subscribe { target, .. } => IntentKind::Subscribe(*target),
            Operation::Unsubscribe { target, .. } => IntentKind::Unsubscribe(*target),
            Operation::Disconnect { .. } => IntentKind::Disconnect,
        }
    }

    fn target(&self) -> Option<CharacteristicRef> {
        match &self.operation {
            Operation::Read { target, .. }
            | Operation::Write { target, .. }
            | Operation::Subscribe { target, .. }
            | Operation::Unsubscribe { target, .. } => Some(*target),
            Operation::Disconnect { .. } => None,
        }
    }

    fn name(&self) -> &'static str {
        match &self.operation {
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
            Operation::Disconnect { .. } => "disconnect",
        }
    }

    /// Resolves the caller with a failure. A disconnect always completes.
    fn fail(self, err: Error) {
        match self.operation {
            Operation::Read { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::Write { reply, .. }
            | Operation::Subscribe { reply, .. }
            | Operation::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::Disconnect { replies } => {
                for reply in replies {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}

pub struct Session {
    policy: ReconnectPolicy,
    operation_timeout: Duration,
    connect_scan_timeout: Duration,
    confirm_unacknowledged_writes: bool,
    disconnect_on_unsubscribe: bool,

    state: SessionState,
    power: PowerState,
    target: Option<ConnectTarget>,
    device: Option<Device>,
    intent: Option<PendingIntent>,
    connect_reply: Option<Reply<Vec<ServiceInfo>>>,
    /// Services still waiting for their characteristics
    outstanding: HashSet<Uuid>,
    cache: CharacteristicCache,
    subscribed: Option<CharacteristicRef>,
    /// Reconnect attempts since the link was last ready
    attempts: u32,
    /// Deadline of the current connect phase, or the resume time while
    /// reconnecting
    phase_deadline: Option<Instant>,
}

impl Session {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            policy: ReconnectPolicy::from(&config.reconnect),
            operation_timeout: config.operation_timeout(),
            connect_scan_timeout: config.connect_scan_timeout(),
            confirm_unacknowledged_writes: config.confirm_unacknowledged_writes,
            disconnect_on_unsubscribe: config.disconnect_on_unsubscribe,
            state: SessionState::Idle,
            power: PowerState::Unknown,
            target: None,
            device: None,
            intent: None,
            connect_reply: None,
            outstanding: HashSet::new(),
            cache: CharacteristicCache::new(),
            subscribed: None,
            attempts: 0,
            phase_deadline: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn subscribed(&self) -> Option<CharacteristicRef> {
        self.subscribed
    }

    pub fn pending(&self) -> Option<IntentKind> {
        self.intent.as_ref().map(PendingIntent::kind)
    }

    pub fn snapshot(&self, scanning: bool) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            power: self.power,
            device: self.device.clone(),
            services: self.cache.services(),
            subscribed: self.subscribed,
            pending: self.pending(),
            scanning,
        }
    }

    /// Earliest instant at which [`Session::on_timer`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let intent = self.intent.as_ref().map(|i| i.deadline);
        match (intent, self.phase_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session state | from={:?} | to={:?}", self.state, next);
            self.state = next;
        }
    }

    fn handle(&self) -> Option<DeviceHandle> {
        self.device.as_ref().map(|d| d.handle)
    }

    fn is_our_device(&self, id: &DeviceId) -> bool {
        self.device.as_ref().is_some_and(|d| &d.id == id)
    }

    /// Drops every trace of the session and returns to Idle.
    fn reset(&mut self) {
        self.set_state(SessionState::Idle);
        self.target = None;
        self.device = None;
        self.intent = None;
        self.outstanding.clear();
        self.cache.clear();
        self.subscribed = None;
        self.attempts = 0;
        self.phase_deadline = None;
    }

    fn fail_intent(&mut self, err: Error) {
        if let Some(intent) = self.intent.take() {
            debug!("Failing pending {} | err={}", intent.name(), err);
            intent.fail(err);
        }
    }

    fn fail_connect_reply(&mut self, err: Error) {
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    /// Ends an accepted connect that never became ready.
    fn abort_connect(&mut self, err: Error) -> Vec<Effect> {
        warn!("Connect failed | err={}", err);
        let target = self.target.clone();
        self.fail_connect_reply(err.clone());
        self.fail_intent(err.clone());
        self.reset();
        match target {
            Some(target) => vec![Effect::Notify(CentralEvent::ConnectFailed {
                target,
                reason: err.to_string(),
            })],
            None => Vec::new(),
        }
    }

    /// Ends the session and tells subscribers why.
    fn close(&mut self, reason: Option<Error>) -> Vec<Effect> {
        let device = self.device.clone();
        if let Some(err) = &reason {
            self.fail_connect_reply(err.clone());
            self.fail_intent(err.clone());
        } else {
            self.fail_connect_reply(Error::Cancelled);
            self.fail_intent(Error::Cancelled);
        }
        self.reset();
        info!("Session closed | reason={:?}", reason);
        vec![Effect::Notify(CentralEvent::SessionClosed {
            device,
            reason: reason.map(|e| e.to_string()),
        })]
    }

    fn start_connecting(&mut self, device: Device, now: Instant) -> Vec<Effect> {
        let handle = device.handle;
        info!("Connecting | device={} | name={}", device.id, device.display_name());
        self.device = Some(device.clone());
        self.set_state(SessionState::Connecting);
        self.phase_deadline = Some(now + self.operation_timeout);
        vec![
            Effect::Command(TransportCommand::Connect(handle)),
            Effect::Notify(CentralEvent::Connecting(device)),
        ]
    }

    fn become_ready(&mut self) -> Vec<Effect> {
        self.set_state(SessionState::Ready);
        self.attempts = 0;
        self.phase_deadline = None;
        let services = self.cache.services();
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(services.clone()));
        }
        match self.device.clone() {
            Some(device) => vec![Effect::Notify(CentralEvent::SessionReady { device, services })],
            None => Vec::new(),
        }
    }

    /// Counts an attempt against the reconnect budget and either waits for
    /// the next one or gives up.
    fn schedule_reconnect(&mut self, now: Instant, reason: &str) -> Vec<Effect> {
        self.attempts += 1;
        match (self.policy.delay_for(self.attempts), self.device.clone()) {
            (Some(delay), Some(device)) => {
                warn!(
                    "Link to {} lost ({}) | reconnect attempt {} in {:?}",
                    device.id, reason, self.attempts, delay
                );
                self.set_state(SessionState::Reconnecting {
                    attempt: self.attempts,
                });
                self.phase_deadline = Some(now + delay);
                vec![Effect::Notify(CentralEvent::ConnectionLost {
                    device,
                    attempt: self.attempts,
                })]
            }
            _ => {
                warn!("Giving up on reconnect after {} attempts | reason={}", self.attempts - 1, reason);
                self.close(Some(Error::UnexpectedDisconnect))
            }
        }
    }

    /// A connect attempt (initial or reconnect) went wrong before Ready.
    fn connect_attempt_failed(&mut self, err: Error, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if matches!(
            self.state,
            SessionState::ServiceDiscovery | SessionState::CharacteristicDiscovery
        ) {
            if let Some(handle) = self.handle() {
                effects.push(Effect::Command(TransportCommand::CancelConnection(handle)));
            }
        }
        self.outstanding.clear();
        self.cache.clear();
        if self.attempts > 0 {
            effects.extend(self.schedule_reconnect(now, &err.to_string()));
        } else {
            effects.extend(self.abort_connect(err));
        }
        effects
    }

    fn ready_handle(&self) -> Result<DeviceHandle> {
        match (&self.state, self.handle()) {
            (SessionState::Ready, Some(handle)) => Ok(handle),
            _ => Err(Error::NotConnected),
        }
    }

    /// Common preconditions of read/write/subscribe: connected, nothing in
    /// flight, characteristic known.
    fn prepare(&self, target: CharacteristicRef) -> Result<DeviceHandle> {
        let handle = self.ready_handle()?;
        if self.intent.is_some() {
            return Err(Error::OperationInFlight);
        }
        self.cache.lookup(target)?;
        Ok(handle)
    }

    fn begin(&mut self, operation: Operation, now: Instant) {
        self.intent = Some(PendingIntent {
            operation,
            deadline: now + self.operation_timeout,
        });
    }

    // ---- caller requests ----------------------------------------------

    /// Accepts a connect request. `known` is a device already in the
    /// registry that matches the target.
    pub fn connect(
        &mut self,
        target: ConnectTarget,
        known: Option<Device>,
        reply: Reply<Vec<ServiceInfo>>,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.state.is_idle() {
            let _ = reply.send(Err(Error::SessionActive));
            return Vec::new();
        }
        if self.power.is_unavailable() {
            let _ = reply.send(Err(Error::TransportUnavailable));
            return Vec::new();
        }
        info!("Connect requested | target={}", target);
        self.target = Some(target);
        self.connect_reply = Some(reply);
        self.attempts = 0;
        match known {
            Some(device) => {
                let mut effects = vec![Effect::StopScan];
                effects.extend(self.start_connecting(device, now));
                effects
            }
            None => {
                self.set_state(SessionState::ScanningForConnect);
                self.phase_deadline = Some(now + self.connect_scan_timeout);
                vec![Effect::StartScan(ScanFilter::default())]
            }
        }
    }

    pub fn disconnect(&mut self, reply: Reply<()>, now: Instant) -> Vec<Effect> {
        match self.state {
            SessionState::Idle => {
                let _ = reply.send(Err(Error::NotConnected));
                Vec::new()
            }
            SessionState::ScanningForConnect | SessionState::Reconnecting { .. } => {
                let mut effects = Vec::new();
                if self.state == SessionState::ScanningForConnect {
                    effects.push(Effect::StopScan);
                }
                effects.extend(self.close(None));
                let _ = reply.send(Ok(()));
                effects
            }
            SessionState::Disconnecting => {
                if let Some(PendingIntent {
                    operation: Operation::Disconnect { replies },
                    ..
                }) = self.intent.as_mut()
                {
                    replies.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
                Vec::new()
            }
            SessionState::Connecting
            | SessionState::ServiceDiscovery
            | SessionState::CharacteristicDiscovery
            | SessionState::Ready => self.begin_disconnect(Some(reply), now),
        }
    }

    fn begin_disconnect(&mut self, reply: Option<Reply<()>>, now: Instant) -> Vec<Effect> {
        self.fail_intent(Error::Cancelled);
        self.fail_connect_reply(Error::Cancelled);
        let Some(handle) = self.handle() else {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return self.close(None);
        };
        self.outstanding.clear();
        self.phase_deadline = None;
        self.begin(
            Operation::Disconnect {
                replies: reply.into_iter().collect(),
            },
            now,
        );
        self.set_state(SessionState::Disconnecting);
        vec![Effect::Command(TransportCommand::CancelConnection(handle))]
    }

    pub fn read(&mut self, target: CharacteristicRef, reply: Reply<Vec<u8>>, now: Instant) -> Vec<Effect> {
        let device = match self.prepare(target) {
            Ok(device) => device,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Vec::new();
            }
        };
        if !self.cache.lookup(target).is_ok_and(|c| c.properties.read) {
            let _ = reply.send(Err(Error::ReadUnsupported));
            return Vec::new();
        }
        self.begin(Operation::Read { target, reply }, now);
        vec![Effect::Command(TransportCommand::ReadValue {
            device,
            characteristic: target,
        })]
    }

    pub fn write(
        &mut self,
        target: CharacteristicRef,
        value: Vec<u8>,
        reply: Reply<()>,
        now: Instant,
    ) -> Vec<Effect> {
        let device = match self.prepare(target) {
            Ok(device) => device,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Vec::new();
            }
        };
        let Some(mode) = self
            .cache
            .lookup(target)
            .ok()
            .and_then(|c| c.properties.write_mode())
        else {
            let _ = reply.send(Err(Error::WriteUnsupported));
            return Vec::new();
        };
        let command = TransportCommand::WriteValue {
            device,
            characteristic: target,
            value: value.clone(),
            mode,
        };
        self.begin(
            Operation::Write {
                target,
                value,
                mode,
                confirming: false,
                reply,
            },
            now,
        );
        vec![Effect::Command(command)]
    }

    pub fn subscribe(&mut self, target: CharacteristicRef, reply: Reply<()>, now: Instant) -> Vec<Effect> {
        let device = match self.prepare(target) {
            Ok(device) => device,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Vec::new();
            }
        };
        if !self.cache.lookup(target).is_ok_and(|c| c.properties.notify) {
            let _ = reply.send(Err(Error::NotifyUnsupported));
            return Vec::new();
        }
        match self.subscribed {
            Some(current) if current == target && self.cache.is_notifying(target) => {
                let _ = reply.send(Ok(()));
                return Vec::new();
            }
            Some(current) => {
                let _ = reply.send(Err(Error::SubscriptionActive(current.characteristic)));
                return Vec::new();
            }
            None => {}
        }
        self.begin(Operation::Subscribe { target, reply }, now);
        vec![Effect::Command(TransportCommand::SetNotify {
            device,
            characteristic: target,
            enable: true,
        })]
    }

    pub fn unsubscribe(&mut self, reply: Reply<()>, now: Instant) -> Vec<Effect> {
        let device = match self.ready_handle() {
            Ok(device) => device,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Vec::new();
            }
        };
        if self.intent.is_some() {
            let _ = reply.send(Err(Error::OperationInFlight));
            return Vec::new();
        }
        let Some(target) = self.subscribed else {
            let _ = reply.send(Err(Error::NotSubscribed));
            return Vec::new();
        };
        self.begin(Operation::Unsubscribe { target, reply }, now);
        vec![Effect::Command(TransportCommand::SetNotify {
            device,
            characteristic: target,
            enable: false,
        })]
    }

    /// The registry's scan ended for a reason other than a match.
    pub fn on_scan_stopped(&mut self) -> Vec<Effect> {
        if self.state == SessionState::ScanningForConnect {
            return self.abort_connect(Error::Cancelled);
        }
        Vec::new()
    }

    // ---- transport events ---------------------------------------------

    pub fn on_power_state(&mut self, power: PowerState) -> Vec<Effect> {
        if power == self.power {
            return Vec::new();
        }
        info!("Radio power state | from={:?} | to={:?}", self.power, power);
        self.power = power;
        let mut effects = vec![Effect::Notify(CentralEvent::PowerStateChanged(power))];
        if power.is_unavailable() {
            effects.push(Effect::AbandonScan);
            match self.state {
                SessionState::Idle => {}
                SessionState::ScanningForConnect => {
                    effects.extend(self.abort_connect(Error::TransportUnavailable))
                }
                _ => effects.extend(self.close(Some(Error::TransportUnavailable))),
            }
        }
        effects
    }

    pub fn on_device_discovered(&mut self, device: &Device, now: Instant) -> Vec<Effect> {
        if self.state != SessionState::ScanningForConnect {
            return Vec::new();
        }
        if !self.target.as_ref().is_some_and(|t| t.matches(device)) {
            return Vec::new();
        }
        info!("Connect target found | device={}", device.id);
        let mut effects = vec![Effect::StopScan];
        effects.extend(self.start_connecting(device.clone(), now));
        effects
    }

    pub fn on_connected(&mut self, id: &DeviceId, now: Instant) -> Vec<Effect> {
        if !self.is_our_device(id) {
            debug!("Stray connected event for {}", id);
            return Vec::new();
        }
        match self.state {
            SessionState::Connecting => {
                let Some(handle) = self.handle() else {
                    return Vec::new();
                };
                info!("Connected to {}, discovering services...", id);
                self.set_state(SessionState::ServiceDiscovery);
                self.phase_deadline = Some(now + self.operation_timeout);
                vec![Effect::Command(TransportCommand::DiscoverServices(handle))]
            }
            _ => {
                debug!("Duplicate connected event for {} ignored | state={:?}", id, self.state);
                Vec::new()
            }
        }
    }

    pub fn on_connect_failed(&mut self, id: &DeviceId, error: &str, now: Instant) -> Vec<Effect> {
        if !self.is_our_device(id) || self.state != SessionState::Connecting {
            debug!("Stray connect-failed event for {}: {}", id, error);
            return Vec::new();
        }
        self.connect_attempt_failed(Error::ConnectFailed(error.to_string()), now)
    }

    pub fn on_disconnected(&mut self, id: &DeviceId, error: Option<&str>, now: Instant) -> Vec<Effect> {
        if !self.is_our_device(id) {
            debug!("Stray disconnected event for {}", id);
            return Vec::new();
        }
        match self.state {
            SessionState::Disconnecting => {
                let device = self.device.clone();
                if let Some(intent) = self.intent.take() {
                    intent.fail(Error::Cancelled);
                }
                self.reset();
                info!("Disconnected from {}", id);
                vec![Effect::Notify(CentralEvent::SessionClosed { device, reason: None })]
            }
            SessionState::Reconnecting { .. } | SessionState::Idle | SessionState::ScanningForConnect => {
                debug!("Disconnected event for {} ignored | state={:?}", id, self.state);
                Vec::new()
            }
            SessionState::Connecting
            | SessionState::ServiceDiscovery
            | SessionState::CharacteristicDiscovery
            | SessionState::Ready => {
                let reason = error.unwrap_or("link dropped");
                self.fail_intent(Error::UnexpectedDisconnect);
                self.outstanding.clear();
                self.cache.clear();
                let mut effects = Vec::new();
                if let Some(target) = self.subscribed.take() {
                    effects.push(Effect::Notify(CentralEvent::SubscriptionChanged {
                        characteristic: target,
                        subscribed: false,
                    }));
                }
                effects.extend(self.schedule_reconnect(now, reason));
                effects
            }
        }
    }

    pub fn on_services_discovered(&mut self, id: &DeviceId, services: &[Uuid], now: Instant) -> Vec<Effect> {
        if !self.is_our_device(id) || self.state != SessionState::ServiceDiscovery {
            debug!("Services event for {} ignored | state={:?}", id, self.state);
            return Vec::new();
        }
        let Some(handle) = self.handle() else {
            return Vec::new();
        };
        info!("Discovered {} services on {}", services.len(), id);
        self.cache.clear();
        self.outstanding.clear();
        let mut effects = Vec::new();
        for service in services {
            if self.outstanding.insert(*service) {
                effects.push(Effect::Command(TransportCommand::DiscoverCharacteristics {
                    device: handle,
                    service: *service,
                }));
            }
        }
        if self.outstanding.is_empty() {
            return self.become_ready();
        }
        self.set_state(SessionState::CharacteristicDiscovery);
        self.phase_deadline = Some(now + self.operation_timeout);
        effects
    }

    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    ) -> Vec<Effect> {
        if self.state != SessionState::CharacteristicDiscovery || !self.outstanding.remove(&service) {
            debug!("Characteristics event for service {} ignored | state={:?}", service, self.state);
            return Vec::new();
        }
        debug!(
            "Service {} has {} characteristics | outstanding={}",
            service,
            characteristics.len(),
            self.outstanding.len()
        );
        self.cache.insert_service(service, characteristics);
        if self.outstanding.is_empty() {
            return self.become_ready();
        }
        Vec::new()
    }

    pub fn on_value_updated(&mut self, target: CharacteristicRef, value: Vec<u8>) -> Vec<Effect> {
        let resolves_intent = matches!(
            self.intent.as_ref().map(|i| &i.operation),
            Some(Operation::Read { target: t, .. }) if *t == target
        ) || matches!(
            self.intent.as_ref().map(|i| &i.operation),
            Some(Operation::Write { target: t, confirming: true, .. }) if *t == target
        );
        if resolves_intent {
            self.cache.set_value(target, value.clone());
            if let Some(intent) = self.intent.take() {
                match intent.operation {
                    Operation::Read { reply, .. } => {
                        let _ = reply.send(Ok(value));
                    }
                    Operation::Write { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    other => warn!("Unexpected intent resolved by value update: {:?}", other),
                }
            }
            return Vec::new();
        }
        if self.subscribed == Some(target) {
            self.cache.set_value(target, value.clone());
            return vec![Effect::Notify(CentralEvent::NotificationReceived {
                characteristic: target,
                value,
            })];
        }
        debug!("Stray value for {} dropped ({} bytes)", target, value.len());
        Vec::new()
    }

    pub fn on_value_written(&mut self, target: CharacteristicRef) -> Vec<Effect> {
        let matches = matches!(
            self.intent.as_ref().map(|i| &i.operation),
            Some(Operation::Write { target: t, mode: WriteMode::WithResponse, .. }) if *t == target
        );
        if !matches {
            debug!("Stray write confirmation for {}", target);
            return Vec::new();
        }
        if let Some(PendingIntent {
            operation: Operation::Write { value, reply, .. },
            ..
        }) = self.intent.take()
        {
            self.cache.set_value(target, value);
            let _ = reply.send(Ok(()));
        }
        Vec::new()
    }

    pub fn on_notify_state(&mut self, target: CharacteristicRef, notifying: bool, now: Instant) -> Vec<Effect> {
        let kind = self.pending();
        match kind {
            Some(IntentKind::Subscribe(t)) if t == target => {
                let Some(PendingIntent {
                    operation: Operation::Subscribe { reply, .. },
                    ..
                }) = self.intent.take()
                else {
                    return Vec::new();
                };
                if notifying {
                    info!("Subscribed to {}", target);
                    self.subscribed = Some(target);
                    self.cache.set_notifying(target, true);
                    let _ = reply.send(Ok(()));
                    vec![Effect::Notify(CentralEvent::SubscriptionChanged {
                        characteristic: target,
                        subscribed: true,
                    })]
                } else {
                    warn!("Peripheral rejected notifications on {}", target);
                    let _ = reply.send(Err(Error::NotifyRejected));
                    Vec::new()
                }
            }
            Some(IntentKind::Unsubscribe(t)) if t == target => {
                let Some(PendingIntent {
                    operation: Operation::Unsubscribe { reply, .. },
                    ..
                }) = self.intent.take()
                else {
                    return Vec::new();
                };
                if notifying {
                    let _ = reply.send(Err(Error::Transport(
                        "peripheral kept notifications enabled".to_string(),
                    )));
                    return Vec::new();
                }
                info!("Unsubscribed from {}", target);
                self.subscribed = None;
                self.cache.set_notifying(target, false);
                let _ = reply.send(Ok(()));
                let mut effects = vec![Effect::Notify(CentralEvent::SubscriptionChanged {
                    characteristic: target,
                    subscribed: false,
                })];
                if self.disconnect_on_unsubscribe {
                    info!("Tearing down the connection after unsubscribe");
                    effects.extend(self.begin_disconnect(None, now));
                }
                effects
            }
            _ if !notifying && self.subscribed == Some(target) => {
                info!("Peripheral ended the subscription on {}", target);
                self.subscribed = None;
                self.cache.set_notifying(target, false);
                vec![Effect::Notify(CentralEvent::SubscriptionChanged {
                    characteristic: target,
                    subscribed: false,
                })]
            }
            _ => {
                debug!("Stray notify-state event for {} | notifying={}", target, notifying);
                Vec::new()
            }
        }
    }

    // ---- transport call results and timers ------------------------------

    /// Feeds back the result of a transport call issued for an
    /// [`Effect::Command`].
    pub fn command_completed(
        &mut self,
        command: &TransportCommand,
        result: TransportResult,
        now: Instant,
    ) -> Vec<Effect> {
        match result {
            Ok(()) => self.command_succeeded(command),
            Err(err) => {
                warn!("Transport call {} failed | err={}", command.name(), err);
                self.command_failed(command, Error::from(err), now)
            }
        }
    }

    fn command_succeeded(&mut self, command: &TransportCommand) -> Vec<Effect> {
        let TransportCommand::WriteValue {
            device,
            characteristic,
            mode: WriteMode::WithoutResponse,
            ..
        } = command
        else {
            return Vec::new();
        };
        let awaiting = matches!(
            self.intent.as_ref().map(|i| &i.operation),
            Some(Operation::Write { target, confirming: false, .. }) if target == characteristic
        );
        if !awaiting {
            return Vec::new();
        }
        let readable = self.cache.lookup(*characteristic).is_ok_and(|c| c.properties.read);
        if self.confirm_unacknowledged_writes && readable {
            if let Some(PendingIntent {
                operation: Operation::Write { confirming, .. },
                ..
            }) = self.intent.as_mut()
            {
                *confirming = true;
            }
            return vec![Effect::Command(TransportCommand::ReadValue {
                device: *device,
                characteristic: *characteristic,
            })];
        }
        if let Some(PendingIntent {
            operation: Operation::Write { value, reply, .. },
            ..
        }) = self.intent.take()
        {
            self.cache.set_value(*characteristic, value);
            let _ = reply.send(Ok(()));
        }
        Vec::new()
    }

    fn command_failed(&mut self, command: &TransportCommand, err: Error, now: Instant) -> Vec<Effect> {
        match command {
            TransportCommand::StartScan(_) if self.state == SessionState::ScanningForConnect => {
                self.abort_connect(err)
            }
            TransportCommand::Connect(_) if self.state == SessionState::Connecting => {
                self.connect_attempt_failed(err, now)
            }
            TransportCommand::DiscoverServices(_) if self.state == SessionState::ServiceDiscovery => {
                self.connect_attempt_failed(err, now)
            }
            TransportCommand::DiscoverCharacteristics { .. }
                if self.state == SessionState::CharacteristicDiscovery =>
            {
                self.connect_attempt_failed(err, now)
            }
            TransportCommand::CancelConnection(_) if self.state == SessionState::Disconnecting => {
                // the link is unusable either way
                let device = self.device.clone();
                if let Some(intent) = self.intent.take() {
                    intent.fail(err.clone());
                }
                self.reset();
                vec![Effect::Notify(CentralEvent::SessionClosed {
                    device,
                    reason: Some(err.to_string()),
                })]
            }
            TransportCommand::ReadValue { characteristic, .. }
            | TransportCommand::WriteValue { characteristic, .. }
            | TransportCommand::SetNotify { characteristic, .. } => {
                if self.intent.as_ref().and_then(PendingIntent::target) == Some(*characteristic) {
                    self.fail_intent(err);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Handles every deadline that has passed by `now`.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.intent.as_ref().is_some_and(|i| i.deadline <= now) {
            if let Some(intent) = self.intent.take() {
                match intent.operation {
                    Operation::Disconnect { .. } => {
                        warn!("Disconnect was never confirmed, closing the session anyway");
                        intent.fail(Error::Cancelled);
                        let device = self.device.clone();
                        self.reset();
                        effects.push(Effect::Notify(CentralEvent::SessionClosed {
                            device,
                            reason: Some(Error::Timeout("disconnect").to_string()),
                        }));
                    }
                    _ => {
                        let name = intent.name();
                        warn!("Timed out waiting for {}", name);
                        intent.fail(Error::Timeout(name));
                    }
                }
            }
        }

        if self.phase_deadline.is_some_and(|deadline| deadline <= now) {
            self.phase_deadline = None;
            match self.state.clone() {
                SessionState::ScanningForConnect => {
                    let target = self
                        .target
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    effects.push(Effect::StopScan);
                    effects.extend(self.abort_connect(Error::DeviceNotFound(target)));
                }
                SessionState::Connecting => {
                    if let Some(handle) = self.handle() {
                        effects.push(Effect::Command(TransportCommand::CancelConnection(handle)));
                    }
                    effects.extend(self.connect_attempt_failed(Error::Timeout("connect"), now));
                }
                SessionState::ServiceDiscovery | SessionState::CharacteristicDiscovery => {
                    effects.extend(self.connect_attempt_failed(Error::Timeout("discovery"), now));
                }
                SessionState::Reconnecting { attempt } => {
                    if let Some(handle) = self.handle() {
                        info!("Reconnect attempt {}", attempt);
                        self.set_state(SessionState::Connecting);
                        self.phase_deadline = Some(now + self.operation_timeout);
                        effects.push(Effect::Command(TransportCommand::Connect(handle)));
                    }
                }
                SessionState::Idle | SessionState::Ready | SessionState::Disconnecting => {}
            }
        }

        effects
    }
}
