//! Per-device session.
//!
//! A [`DeviceSession`] owns one device's connection state machine, discovery
//! bookkeeping and telemetry. It performs no I/O: each input returns a
//! [`SessionUpdate`] carrying the radio commands the manager must issue and
//! the changes observers should hear about.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::advertising::{
    Advertisement, AdvertisementInfo, AdvertisementState, ButtonState, ModelId, MIN_PAYLOAD_LEN,
};
use crate::ble::connection::ConnectionState;
use crate::ble::events::{PlatformError, RadioOperation};
use crate::ble::transport::RadioCommand;
use crate::data::history::{TelemetryHistory, TemperatureReading};
use crate::data::position::Position;
use crate::data::record::{DeviceRecord, TransientFailure};
use crate::error::{Error, Result};
use crate::protocol::settings::MAX_JINGLE;
use crate::protocol::{
    CharacteristicRole, DeviceCommand, DeviceQuery, DeviceSettings, ProtocolHandler, QueryRequest,
    QueryResponse,
};
use crate::registry::{DeviceClassRegistry, DeviceKind, VariantDescriptor};

/// Change to a device, delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    /// The record was created.
    Created,
    /// An advertisement was recorded.
    Advertised {
        /// Raw RSSI.
        rssi: Option<i16>,
        /// Smoothed RSSI.
        smoothed_rssi: Option<f64>,
    },
    /// The device became reachable.
    BecameReachable,
    /// The device went out of range.
    BecameUnreachable,
    /// Connection state moved.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// Characteristic discovery failed for one service.
    ServiceDegraded {
        /// Affected service.
        service: Uuid,
    },
    /// A radio operation failed.
    TransientFailure(TransientFailure),
    /// A characteristic payload could not be decoded and was dropped.
    DecodeFailed {
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Decoder message.
        reason: String,
    },
    /// New battery level.
    BatteryUpdated(f64),
    /// New temperature sample.
    TemperatureUpdated(TemperatureReading),
    /// Broadcast rate changed.
    AdvertisementStateChanged(AdvertisementState),
    /// The advertisement reported a button gesture.
    ButtonPressed(ButtonState),
    /// The hardware variant was identified.
    VariantResolved(DeviceKind),
    /// The device advertised a model identifier different from the resolved one.
    VariantConflict {
        /// Model the variant was resolved from.
        resolved: ModelId,
        /// Model seen in the latest advertisement.
        advertised: ModelId,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// The device acknowledged a command.
    CommandAcknowledged(DeviceCommand),
    /// The device answered an information query.
    QueryAnswered(QueryResponse),
    /// A wake was requested.
    WakeRequested,
    /// The wake write was acknowledged.
    WakeCompleted,
    /// Telemetry and packet count were reset.
    HistoryCleared,
    /// The temperature calibration offset changed.
    CalibrationChanged(i32),
    /// The user-assigned name changed.
    NameChanged(Option<String>),
    /// A host position was attributed to the device.
    LocationUpdated(Position),
    /// The device was removed from the manager.
    Removed,
}

/// Commands and changes produced by one session input.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionUpdate {
    /// Radio commands to issue, in order.
    pub commands: Vec<RadioCommand>,
    /// Changes to publish, in order.
    pub changes: Vec<DeviceChange>,
}

impl SessionUpdate {
    /// Check if the update carries nothing.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.changes.is_empty()
    }

    fn push(&mut self, change: DeviceChange) {
        self.changes.push(change);
    }

    fn command(&mut self, command: RadioCommand) {
        self.commands.push(command);
    }
}

/// Pre-registration data for a device that has not been seen yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSeed {
    /// User-assigned name.
    pub name: Option<String>,
    /// Known model identifier.
    pub model: Option<ModelId>,
    /// Temperature calibration offset.
    pub temp_calibration_offset: i32,
}

/// Per-session tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Samples kept per telemetry series.
    pub history_capacity: usize,
    /// Weight of the newest RSSI sample.
    pub rssi_smoothing: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_capacity: crate::data::history::DEFAULT_HISTORY_CAPACITY,
            rssi_smoothing: crate::data::history::DEFAULT_RSSI_SMOOTHING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeIntent {
    Idle,
    /// Waiting for the session to reach `Ready`.
    Pending { disconnect_after: bool },
    /// Wake write issued, waiting for the acknowledgement.
    Writing { disconnect_after: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingQuery {
    query: DeviceQuery,
    request: QueryRequest,
    /// The prompt write was acknowledged and the answer read issued.
    reading: bool,
}

#[derive(Debug, Default)]
struct DiscoveryProgress {
    outstanding: HashSet<Uuid>,
    degraded: BTreeSet<Uuid>,
    /// Characteristic -> owning service.
    characteristics: HashMap<Uuid, Uuid>,
}

struct SessionState {
    name: Option<String>,
    local_name: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    last_location: Option<Position>,
    in_range: bool,
    raw_advertisement: Option<Bytes>,
    packet_count: u64,
    connection_state: ConnectionState,
    variant: Arc<VariantDescriptor>,
    handler: Arc<dyn ProtocolHandler>,
    resolved_model: Option<ModelId>,
    advertisement: AdvertisementInfo,
    telemetry: TelemetryHistory,
    temp_calibration_offset: i32,
    discovery: DiscoveryProgress,
    last_error: Option<TransientFailure>,
    wake: WakeIntent,
    settings: DeviceSettings,
    /// Command-channel writes awaiting acknowledgement, oldest first.
    pending_writes: VecDeque<(Uuid, Option<DeviceCommand>)>,
    query: Option<PendingQuery>,
}

/// One known device.
pub struct DeviceSession {
    address: DeviceAddress,
    state: RwLock<SessionState>,
}

impl DeviceSession {
    /// Create a session for a device that has not been identified yet.
    pub fn new(
        address: DeviceAddress,
        registry: &DeviceClassRegistry,
        settings: &SessionSettings,
    ) -> Self {
        let variant = registry.fallback();
        let handler = registry.handler_for(&variant);

        Self {
            address,
            state: RwLock::new(SessionState {
                name: None,
                local_name: None,
                last_seen: None,
                last_location: None,
                in_range: false,
                raw_advertisement: None,
                packet_count: 0,
                connection_state: ConnectionState::Disconnected,
                variant,
                handler,
                resolved_model: None,
                advertisement: AdvertisementInfo::default(),
                telemetry: TelemetryHistory::new(settings.history_capacity, settings.rssi_smoothing),
                temp_calibration_offset: 0,
                discovery: DiscoveryProgress::default(),
                last_error: None,
                wake: WakeIntent::Idle,
                settings: DeviceSettings::default(),
                pending_writes: VecDeque::new(),
                query: None,
            }),
        }
    }

    /// Create a pre-registered session.
    pub fn seeded(
        address: DeviceAddress,
        seed: &DeviceSeed,
        registry: &DeviceClassRegistry,
        settings: &SessionSettings,
    ) -> Self {
        let session = Self::new(address, registry, settings);
        {
            let mut state = session.state.write();
            state.name = seed.name.clone();
            state.temp_calibration_offset = seed.temp_calibration_offset;
            if let Some(model) = seed.model {
                state.resolve(model, registry);
            }
        }
        session
    }

    // === Accessors ===

    /// Hardware address.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Packets attributed since the last history clear.
    pub fn packet_count(&self) -> u64 {
        self.state.read().packet_count
    }

    /// Time of the last advertisement.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_seen
    }

    /// Whether the device is considered reachable.
    pub fn in_range(&self) -> bool {
        self.state.read().in_range
    }

    /// Resolved variant.
    pub fn variant(&self) -> Arc<VariantDescriptor> {
        self.state.read().variant.clone()
    }

    /// Hardware product.
    pub fn kind(&self) -> DeviceKind {
        self.state.read().variant.kind
    }

    /// User-assigned name.
    pub fn name(&self) -> Option<String> {
        self.state.read().name.clone()
    }

    /// Temperature calibration offset.
    pub fn temp_calibration_offset(&self) -> i32 {
        self.state.read().temp_calibration_offset
    }

    /// Copy of the telemetry history.
    pub fn telemetry(&self) -> TelemetryHistory {
        self.state.read().telemetry.clone()
    }

    /// Latest decoded advertisement fields.
    pub fn advertisement(&self) -> AdvertisementInfo {
        self.state.read().advertisement
    }

    /// Snapshot of the whole session.
    pub fn snapshot(&self) -> DeviceRecord {
        let state = self.state.read();
        DeviceRecord {
            address: self.address,
            name: state.name.clone(),
            local_name: state.local_name.clone(),
            last_seen: state.last_seen,
            last_location: state.last_location,
            in_range: state.in_range,
            raw_advertisement: state.raw_advertisement.clone(),
            packet_count: state.packet_count,
            connection_state: state.connection_state,
            kind: state.variant.kind,
            model: state.resolved_model,
            capabilities: state.variant.capabilities.clone(),
            advertisement: state.advertisement,
            telemetry: state.telemetry.clone(),
            temp_calibration_offset: state.temp_calibration_offset,
            degraded_services: state.discovery.degraded.iter().copied().collect(),
            last_error: state.last_error.clone(),
            settings: state.settings.clone(),
        }
    }

    /// Last known settings and device information.
    pub fn settings(&self) -> DeviceSettings {
        self.state.read().settings.clone()
    }

    // === Radio observations ===

    /// Record an advertisement.
    pub(crate) fn record_advertisement(
        &self,
        advertisement: &Advertisement,
        rssi: Option<i16>,
        timestamp: DateTime<Utc>,
        position: Option<Position>,
        registry: &DeviceClassRegistry,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        state.packet_count = state.packet_count.saturating_add(1);
        state.last_seen = Some(timestamp);
        state.raw_advertisement = Some(advertisement.manufacturer_data.clone());
        if advertisement.local_name.is_some() {
            state.local_name = advertisement.local_name.clone();
        }
        if position.is_some() {
            state.last_location = position;
        }

        if let Some(advertised) = advertisement.model_id() {
            let resolved_model = state.resolved_model;
            match resolved_model {
                None => {
                    let kind = state.resolve(advertised, registry);
                    info!(address = %self.address, model = %advertised, %kind, "Resolved device variant");
                    update.push(DeviceChange::VariantResolved(kind));
                }
                Some(resolved) if resolved != advertised => {
                    warn!(
                        address = %self.address,
                        %resolved,
                        %advertised,
                        "Conflicting model identifier, keeping resolved variant"
                    );
                    update.push(DeviceChange::VariantConflict {
                        resolved,
                        advertised,
                    });
                }
                Some(_) => {}
            }
        }

        let smoothed = rssi.map(|value| state.telemetry.record_rssi(value, timestamp));

        if advertisement.manufacturer_data.len() > MIN_PAYLOAD_LEN {
            let info = state
                .handler
                .parse_advertisement(&advertisement.manufacturer_data);
            state.apply_advertisement_info(info, timestamp, &mut update);
        }

        update.push(DeviceChange::Advertised {
            rssi,
            smoothed_rssi: smoothed,
        });

        if !state.in_range {
            state.in_range = true;
            update.push(DeviceChange::BecameReachable);
        }

        trace!(address = %self.address, packets = state.packet_count, ?rssi, "Advertisement recorded");
        update
    }

    /// Attribute a host position to this device if it is connected or was
    /// seen within `window` of `now`.
    pub(crate) fn record_position(
        &self,
        position: Position,
        now: DateTime<Utc>,
        window: Duration,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        let recently_seen = state
            .last_seen
            .and_then(|seen| now.signed_duration_since(seen).to_std().ok())
            .map(|age| age <= window)
            .unwrap_or(false);

        if state.connection_state.is_connected() || (state.in_range && recently_seen) {
            state.last_location = Some(position);
            state.telemetry.record_location(position);
            update.push(DeviceChange::LocationUpdated(position));
        }
        update
    }

    /// Mark the device out of range if its advertisements went stale, unless
    /// the host is still within `radius_m` of where the device was last seen.
    pub(crate) fn expire(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
        host: Option<&Position>,
        radius_m: f64,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if !state.in_range || state.connection_state != ConnectionState::Disconnected {
            return update;
        }

        let stale = state
            .last_seen
            .and_then(|seen| now.signed_duration_since(seen).to_std().ok())
            .map(|age| age > timeout)
            .unwrap_or(false);
        if !stale {
            return update;
        }

        if let (Some(host), Some(last)) = (host, state.last_location.as_ref()) {
            let distance = host.distance_to(last);
            if distance <= radius_m {
                debug!(address = %self.address, distance, "Stale but host is nearby, keeping in range");
                return update;
            }
        }

        info!(address = %self.address, "Device out of range");
        state.in_range = false;
        update.push(DeviceChange::BecameUnreachable);
        update
    }

    // === Connection lifecycle ===

    /// Request a connection.
    pub(crate) fn request_connect(&self) -> Result<SessionUpdate> {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        match state.connection_state {
            ConnectionState::Disconnected => {
                state.transition(&self.address, ConnectionState::Connecting, &mut update);
                update.command(RadioCommand::Connect(self.address));
                Ok(update)
            }
            ConnectionState::Disconnecting => Err(Error::ConnectionFailed {
                reason: "disconnect in progress".to_string(),
            }),
            current => {
                debug!(address = %self.address, state = %current, "Already connecting or connected");
                Ok(update)
            }
        }
    }

    /// Request teardown.
    pub(crate) fn request_disconnect(&self) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        self.state.write().teardown(&self.address, &mut update);
        update
    }

    /// The radio reported the link is up.
    pub(crate) fn handle_connected(&self) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        match state.connection_state {
            ConnectionState::Disconnected => {
                debug!(address = %self.address, "Unsolicited connect");
                state.transition(&self.address, ConnectionState::Connecting, &mut update);
            }
            ConnectionState::Connecting => {}
            current => {
                debug!(address = %self.address, state = %current, "Ignoring duplicate connect");
                return update;
            }
        }

        state.transition(&self.address, ConnectionState::Connected, &mut update);
        if !state.in_range {
            state.in_range = true;
            update.push(DeviceChange::BecameReachable);
        }

        state.discovery = DiscoveryProgress::default();
        state.transition(&self.address, ConnectionState::DiscoveringServices, &mut update);
        update.command(RadioCommand::DiscoverServices {
            address: self.address,
            services: state.variant.capabilities.services.iter().copied().collect(),
        });
        update
    }

    /// The radio could not open the link.
    pub(crate) fn handle_connect_failed(&self, error: PlatformError) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if state.connection_state != ConnectionState::Connecting {
            debug!(address = %self.address, state = %state.connection_state, "Ignoring stray connect failure");
            return update;
        }

        state.transition(&self.address, ConnectionState::Disconnected, &mut update);
        state.clear_requests();
        state.fail(&self.address, RadioOperation::Connect, error, &mut update);
        update
    }

    /// The radio reported the link is down.
    pub(crate) fn handle_disconnected(&self, error: Option<PlatformError>) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if state.connection_state == ConnectionState::Disconnected {
            debug!(address = %self.address, "Ignoring duplicate disconnect");
            return update;
        }

        if state.connection_state != ConnectionState::Disconnecting {
            state.transition(&self.address, ConnectionState::Disconnecting, &mut update);
        }
        state.transition(&self.address, ConnectionState::Disconnected, &mut update);
        state.discovery = DiscoveryProgress::default();
        state.clear_requests();

        if let Some(error) = error {
            state.fail(&self.address, RadioOperation::Disconnect, error, &mut update);
        }
        info!(address = %self.address, "Disconnected");
        update
    }

    /// Service discovery completed.
    pub(crate) fn handle_services_discovered(
        &self,
        services: &[Uuid],
        error: Option<PlatformError>,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if state.connection_state != ConnectionState::DiscoveringServices {
            debug!(address = %self.address, state = %state.connection_state, "Ignoring out-of-order service list");
            return update;
        }

        if let Some(error) = error {
            state.fail(&self.address, RadioOperation::DiscoverServices, error, &mut update);
            state.teardown(&self.address, &mut update);
            return update;
        }

        for service in services {
            let Some(characteristics) = state.handler.characteristics_for_service(service) else {
                trace!(address = %self.address, %service, "Skipping service");
                continue;
            };
            if state.discovery.outstanding.insert(*service) {
                update.command(RadioCommand::DiscoverCharacteristics {
                    address: self.address,
                    service: *service,
                    characteristics,
                });
            }
        }

        debug!(
            address = %self.address,
            outstanding = state.discovery.outstanding.len(),
            "Services discovered"
        );
        state.transition(&self.address, ConnectionState::DiscoveringCharacteristics, &mut update);
        if state.discovery.outstanding.is_empty() {
            state.enter_ready(&self.address, &mut update);
        }
        update
    }

    /// Characteristic discovery for one service completed.
    pub(crate) fn handle_characteristics_discovered(
        &self,
        service: &Uuid,
        characteristics: &[Uuid],
        error: Option<PlatformError>,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if state.connection_state != ConnectionState::DiscoveringCharacteristics {
            debug!(address = %self.address, %service, "Ignoring out-of-order characteristic list");
            return update;
        }
        if !state.discovery.outstanding.remove(service) {
            debug!(address = %self.address, %service, "Ignoring duplicate characteristic list");
            return update;
        }

        match error {
            Some(error) => {
                state.discovery.degraded.insert(*service);
                state.fail(
                    &self.address,
                    RadioOperation::DiscoverCharacteristics,
                    error,
                    &mut update,
                );
                update.push(DeviceChange::ServiceDegraded { service: *service });
            }
            None => {
                for characteristic in characteristics {
                    state
                        .discovery
                        .characteristics
                        .insert(*characteristic, *service);
                }
            }
        }

        if state.discovery.outstanding.is_empty() {
            state.enter_ready(&self.address, &mut update);
        }
        update
    }

    /// A characteristic value arrived.
    pub(crate) fn handle_value_updated(
        &self,
        characteristic: &Uuid,
        value: &[u8],
        error: Option<PlatformError>,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        // Values that race a disconnect or arrive before discovery settles are dropped.
        if !state.connection_state.is_ready() {
            debug!(address = %self.address, %characteristic, state = %state.connection_state, "Ignoring value outside Ready");
            return update;
        }

        let answers_query = state
            .query
            .as_ref()
            .is_some_and(|q| q.reading && q.request.characteristic == *characteristic);
        if answers_query {
            if let Some(pending) = state.query.take() {
                state.answer_query(&self.address, pending, value, error, &mut update);
            }
            return update;
        }

        if let Some(error) = error {
            state.fail(&self.address, RadioOperation::Read, error, &mut update);
            return update;
        }

        let now = Utc::now();
        match state.handler.role_of(characteristic) {
            CharacteristicRole::Battery => match state.handler.decode_battery(value) {
                Ok(percent) => {
                    state.telemetry.record_battery(percent, now);
                    update.push(DeviceChange::BatteryUpdated(percent));
                }
                Err(e) => state.decode_failed(&self.address, characteristic, e, &mut update),
            },
            CharacteristicRole::Temperature => match state.handler.decode_temperature(value) {
                Ok(raw) => {
                    let offset = state.temp_calibration_offset;
                    let reading = state.telemetry.record_temperature(raw, offset, now);
                    update.push(DeviceChange::TemperatureUpdated(reading));
                }
                Err(e) => state.decode_failed(&self.address, characteristic, e, &mut update),
            },
            role => {
                trace!(address = %self.address, %characteristic, ?role, "Value not interpreted");
            }
        }
        update
    }

    /// A write completed.
    pub(crate) fn handle_written(
        &self,
        characteristic: &Uuid,
        error: Option<PlatformError>,
    ) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();
        let is_wake = state.handler.role_of(characteristic) == CharacteristicRole::Wake;
        let index = state
            .pending_writes
            .iter()
            .position(|(target, _)| target == characteristic);
        let command = index
            .and_then(|i| state.pending_writes.remove(i))
            .and_then(|(_, command)| command);
        let prompts_query = state.query.as_ref().is_some_and(|q| {
            !q.reading
                && q.request.prompt.as_ref().map(|p| p.characteristic) == Some(*characteristic)
        });

        if let Some(error) = error {
            state.fail(&self.address, RadioOperation::Write, error, &mut update);
            if is_wake {
                state.wake = WakeIntent::Idle;
            }
            if prompts_query {
                state.query = None;
            }
            return update;
        }

        update.push(DeviceChange::CharacteristicWritten {
            characteristic: *characteristic,
        });

        if let Some(command) = command {
            info!(address = %self.address, command = command.name(), "Command acknowledged");
            state.settings.apply_command(&command);
            update.push(DeviceChange::CommandAcknowledged(command));
        }

        if prompts_query {
            if let Some(pending) = state.query.as_mut() {
                pending.reading = true;
                update.command(RadioCommand::Read {
                    address: self.address,
                    service: pending.request.service,
                    characteristic: pending.request.characteristic,
                });
            }
        }

        if let (true, WakeIntent::Writing { disconnect_after }) = (is_wake, state.wake) {
            state.wake = WakeIntent::Idle;
            info!(address = %self.address, "Wake acknowledged");
            update.push(DeviceChange::WakeCompleted);
            if disconnect_after {
                state.teardown(&self.address, &mut update);
            }
        }
        update
    }

    /// Feed a command the transport refused back in as its failure event.
    pub(crate) fn command_failed(&self, command: &RadioCommand, error: &Error) -> SessionUpdate {
        let platform = PlatformError::from(error);
        match command {
            RadioCommand::Connect(_) => self.handle_connect_failed(platform),
            RadioCommand::Disconnect(_) => self.handle_disconnected(Some(platform)),
            RadioCommand::DiscoverServices { .. } => {
                self.handle_services_discovered(&[], Some(platform))
            }
            RadioCommand::DiscoverCharacteristics { service, .. } => {
                self.handle_characteristics_discovered(service, &[], Some(platform))
            }
            RadioCommand::Write { request, .. } => {
                self.handle_written(&request.characteristic, Some(platform))
            }
            RadioCommand::Read { characteristic, .. } => {
                self.handle_value_updated(characteristic, &[], Some(platform))
            }
            RadioCommand::Subscribe { .. } => {
                let mut update = SessionUpdate::default();
                self.state
                    .write()
                    .fail(&self.address, RadioOperation::Subscribe, platform, &mut update);
                update
            }
        }
    }

    // === Caller operations ===

    /// Switch a slow-broadcasting device back to active broadcast.
    pub(crate) fn wake_up(&self) -> Result<SessionUpdate> {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        let Some(request) = state.handler.wake_request() else {
            return Err(state.unsupported("wake"));
        };
        if !state.variant.capabilities.supports_wake {
            return Err(state.unsupported("wake"));
        }

        if state.advertisement.state == AdvertisementState::High {
            debug!(address = %self.address, "Already broadcasting actively, wake skipped");
            return Ok(update);
        }
        if state.wake != WakeIntent::Idle {
            debug!(address = %self.address, "Wake already in progress");
            return Ok(update);
        }

        match state.connection_state {
            ConnectionState::Ready => {
                state.wake = WakeIntent::Writing {
                    disconnect_after: false,
                };
                update.command(RadioCommand::Write {
                    address: self.address,
                    request,
                });
            }
            ConnectionState::Disconnected => {
                state.wake = WakeIntent::Pending {
                    disconnect_after: true,
                };
                state.transition(&self.address, ConnectionState::Connecting, &mut update);
                update.command(RadioCommand::Connect(self.address));
            }
            ConnectionState::Disconnecting => return Err(Error::NotConnected),
            _ => {
                state.wake = WakeIntent::Pending {
                    disconnect_after: false,
                };
            }
        }

        info!(address = %self.address, "Wake requested");
        update.push(DeviceChange::WakeRequested);
        Ok(update)
    }

    /// Start or stop the buzzer.
    pub(crate) fn buzz(&self, ring: bool) -> Result<SessionUpdate> {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if !state.variant.capabilities.supports_buzz {
            return Err(state.unsupported("buzz"));
        }
        if !state.connection_state.is_ready() {
            return Err(Error::NotReady {
                state: state.connection_state,
            });
        }

        let request = if ring {
            state.handler.buzz_request()
        } else {
            state.handler.stop_buzz_request()
        };
        let request = request.ok_or_else(|| state.unsupported("buzz"))?;

        if request.with_response {
            state.pending_writes.push_back((request.characteristic, None));
        }
        update.command(RadioCommand::Write {
            address: self.address,
            request,
        });
        Ok(update)
    }

    /// Write a maintenance or settings command. Requires `Ready`.
    pub(crate) fn send_command(&self, command: DeviceCommand) -> Result<SessionUpdate> {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        if let DeviceCommand::SetJingle(jingle) = command {
            if !(1..=MAX_JINGLE).contains(&jingle) {
                return Err(Error::InvalidParameter {
                    name: "jingle".to_string(),
                    value: jingle.to_string(),
                });
            }
        }
        let request = state
            .handler
            .command_request(&command)
            .ok_or_else(|| state.unsupported(command.name()))?;
        if !state.connection_state.is_ready() {
            return Err(Error::NotReady {
                state: state.connection_state,
            });
        }

        debug!(address = %self.address, command = command.name(), "Sending command");
        state
            .pending_writes
            .push_back((request.characteristic, Some(command)));
        update.command(RadioCommand::Write {
            address: self.address,
            request,
        });
        Ok(update)
    }

    /// Ask the device for information. The answer arrives as
    /// [`DeviceChange::QueryAnswered`]. One query runs at a time.
    pub(crate) fn query(&self, query: DeviceQuery) -> Result<SessionUpdate> {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();

        let request = state
            .handler
            .query_request(query)
            .ok_or_else(|| state.unsupported(&query.to_string()))?;
        if !state.connection_state.is_ready() {
            return Err(Error::NotReady {
                state: state.connection_state,
            });
        }
        if let Some(pending) = &state.query {
            return Err(Error::Busy {
                operation: pending.query.to_string(),
            });
        }

        debug!(address = %self.address, %query, "Querying device");
        let reading = match &request.prompt {
            Some(prompt) => {
                update.command(RadioCommand::Write {
                    address: self.address,
                    request: prompt.clone(),
                });
                false
            }
            None => {
                update.command(RadioCommand::Read {
                    address: self.address,
                    service: request.service,
                    characteristic: request.characteristic,
                });
                true
            }
        };
        state.query = Some(PendingQuery {
            query,
            request,
            reading,
        });
        Ok(update)
    }

    /// Reset every telemetry series and the packet count.
    pub(crate) fn clear_history(&self) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let mut state = self.state.write();
        state.telemetry.clear();
        state.packet_count = 0;
        update.push(DeviceChange::HistoryCleared);
        update
    }

    /// Set the temperature calibration offset.
    pub(crate) fn set_temp_calibration(&self, offset: i32) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        self.state.write().temp_calibration_offset = offset;
        update.push(DeviceChange::CalibrationChanged(offset));
        update
    }

    /// Derive the calibration offset from a reference temperature taken now.
    pub(crate) fn calibrate_temperature(&self, actual: i32) -> Result<SessionUpdate> {
        let raw = self
            .state
            .read()
            .telemetry
            .latest_temperature()
            .map(|r| r.raw)
            .ok_or_else(|| Error::InvalidData {
                context: "no temperature reading to calibrate against".to_string(),
            })?;
        Ok(self.set_temp_calibration(actual.saturating_sub(raw)))
    }

    /// Set the user-assigned name.
    pub(crate) fn set_name(&self, name: Option<String>) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        self.state.write().name = name.clone();
        update.push(DeviceChange::NameChanged(name));
        update
    }
}

impl SessionState {
    fn resolve(&mut self, model: ModelId, registry: &DeviceClassRegistry) -> DeviceKind {
        self.resolved_model = Some(model);
        self.variant = registry.resolve(Some(model));
        self.handler = registry.handler_for(&self.variant);
        self.variant.kind
    }

    fn transition(
        &mut self,
        address: &DeviceAddress,
        next: ConnectionState,
        update: &mut SessionUpdate,
    ) -> bool {
        let from = self.connection_state;
        if !from.can_transition_to(next) {
            debug!(%address, %from, to = %next, "Rejected state transition");
            return false;
        }
        debug!(%address, %from, to = %next, "State transition");
        self.connection_state = next;
        update.push(DeviceChange::StateChanged { from, to: next });
        true
    }

    fn teardown(&mut self, address: &DeviceAddress, update: &mut SessionUpdate) {
        if matches!(
            self.connection_state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return;
        }
        self.transition(address, ConnectionState::Disconnecting, update);
        self.discovery.outstanding.clear();
        self.clear_requests();
        update.command(RadioCommand::Disconnect(*address));
    }

    fn clear_requests(&mut self) {
        self.wake = WakeIntent::Idle;
        self.pending_writes.clear();
        self.query = None;
    }

    fn answer_query(
        &mut self,
        address: &DeviceAddress,
        pending: PendingQuery,
        value: &[u8],
        error: Option<PlatformError>,
        update: &mut SessionUpdate,
    ) {
        if let Some(error) = error {
            self.fail(address, RadioOperation::Read, error, update);
            return;
        }
        match self.handler.decode_query_response(pending.query, value) {
            Ok(response) => {
                info!(%address, query = %pending.query, ?response, "Query answered");
                self.settings.apply_response(&response);
                update.push(DeviceChange::QueryAnswered(response));
            }
            Err(e) => self.decode_failed(address, &pending.request.characteristic, e, update),
        }
    }

    fn enter_ready(&mut self, address: &DeviceAddress, update: &mut SessionUpdate) {
        if !self.transition(address, ConnectionState::Ready, update) {
            return;
        }
        info!(
            %address,
            kind = %self.variant.kind,
            degraded = self.discovery.degraded.len(),
            "Session ready"
        );

        let mut subscriptions: Vec<(Uuid, Uuid)> = self
            .discovery
            .characteristics
            .iter()
            .filter(|(characteristic, _)| {
                matches!(
                    self.handler.role_of(characteristic),
                    CharacteristicRole::Battery | CharacteristicRole::Temperature
                )
            })
            .map(|(characteristic, service)| (*service, *characteristic))
            .collect();
        subscriptions.sort();
        for (service, characteristic) in subscriptions {
            update.command(RadioCommand::Subscribe {
                address: *address,
                service,
                characteristic,
            });
        }

        if let WakeIntent::Pending { disconnect_after } = self.wake {
            if let Some(request) = self.handler.wake_request() {
                self.wake = WakeIntent::Writing { disconnect_after };
                update.command(RadioCommand::Write {
                    address: *address,
                    request,
                });
            } else {
                self.wake = WakeIntent::Idle;
            }
        }
    }

    fn apply_advertisement_info(
        &mut self,
        info: AdvertisementInfo,
        timestamp: DateTime<Utc>,
        update: &mut SessionUpdate,
    ) {
        if info.state != self.advertisement.state && info.state != AdvertisementState::Unknown {
            update.push(DeviceChange::AdvertisementStateChanged(info.state));
        }
        if let Some(button) = info.button {
            if button != ButtonState::None && self.advertisement.button != Some(button) {
                update.push(DeviceChange::ButtonPressed(button));
            }
        }
        if let Some(percent) = info.battery_percent {
            if self.telemetry.latest_battery() != Some(percent) {
                self.telemetry.record_battery(percent, timestamp);
                update.push(DeviceChange::BatteryUpdated(percent));
            }
        }
        self.advertisement = info;
    }

    fn fail(
        &mut self,
        address: &DeviceAddress,
        operation: RadioOperation,
        error: PlatformError,
        update: &mut SessionUpdate,
    ) {
        warn!(%address, %operation, %error, "Radio operation failed");
        let failure = TransientFailure {
            operation,
            error,
            timestamp: Utc::now(),
        };
        self.last_error = Some(failure.clone());
        update.push(DeviceChange::TransientFailure(failure));
    }

    fn decode_failed(
        &mut self,
        address: &DeviceAddress,
        characteristic: &Uuid,
        error: Error,
        update: &mut SessionUpdate,
    ) {
        warn!(%address, %characteristic, %error, "Dropping undecodable value");
        update.push(DeviceChange::DecodeFailed {
            characteristic: *characteristic,
            reason: error.to_string(),
        });
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::NotSupported {
            operation: format!("{} on {}", operation, self.variant.kind),
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("kind", &state.variant.kind)
            .field("connection_state", &state.connection_state)
            .field("in_range", &state.in_range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::LEGACY_FINDER_ID;
    use crate::ble::uuids::{FINDER_DATA2_UUID, FINDER_SERVICE_UUID};
    use crate::protocol::HandlerKind;
    use crate::registry::{BaseProfile, CapabilityOverrides};
    use pretty_assertions::assert_eq;

    const DISCOVER_ALL_MODEL: ModelId = ModelId(0x77);

    /// Handler that wants every characteristic of every service.
    #[derive(Debug)]
    struct DiscoverEverything;

    impl ProtocolHandler for DiscoverEverything {
        fn kind(&self) -> HandlerKind {
            HandlerKind::Found
        }

        fn characteristics_for_service(&self, _service: &Uuid) -> Option<Vec<Uuid>> {
            Some(Vec::new())
        }
    }

    fn address() -> DeviceAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn discover_all_registry() -> DeviceClassRegistry {
        let mut registry = DeviceClassRegistry::empty();
        registry.register_handler(Arc::new(DiscoverEverything));
        registry.register_variant(
            DISCOVER_ALL_MODEL,
            DeviceKind::Found,
            BaseProfile::Minimal,
            &CapabilityOverrides::none(),
            HandlerKind::Found,
        );
        registry
    }

    fn discover_all_session(registry: &DeviceClassRegistry) -> DeviceSession {
        let seed = DeviceSeed {
            model: Some(DISCOVER_ALL_MODEL),
            ..Default::default()
        };
        DeviceSession::seeded(address(), &seed, registry, &SessionSettings::default())
    }

    fn services(n: u128) -> Vec<Uuid> {
        (1..=n).map(Uuid::from_u128).collect()
    }

    fn ready_count(updates: &[SessionUpdate]) -> usize {
        updates
            .iter()
            .flat_map(|u| &u.changes)
            .filter(|c| {
                matches!(
                    c,
                    DeviceChange::StateChanged {
                        to: ConnectionState::Ready,
                        ..
                    }
                )
            })
            .count()
    }

    fn finder_advertisement(status: u8) -> Advertisement {
        let mut data = vec![0x0E, 0x0E, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, status];
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&2600u16.to_le_bytes());
        data.push(0);
        Advertisement::new(data)
    }

    /// Seed a session with `model` and drive it to `Ready` over `gatt`.
    fn ready_session(
        registry: &DeviceClassRegistry,
        seed: DeviceSeed,
        gatt: &[(Uuid, Vec<Uuid>)],
    ) -> DeviceSession {
        let session = DeviceSession::seeded(address(), &seed, registry, &SessionSettings::default());
        session.request_connect().unwrap();
        session.handle_connected();
        let services: Vec<Uuid> = gatt.iter().map(|(service, _)| *service).collect();
        session.handle_services_discovered(&services, None);
        for (service, characteristics) in gatt {
            session.handle_characteristics_discovered(service, characteristics, None);
        }
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        session
    }

    fn honey_seed(temp_calibration_offset: i32) -> DeviceSeed {
        DeviceSeed {
            model: Some(ModelId(crate::ble::advertising::LEGACY_HONEY_ID)),
            temp_calibration_offset,
            ..Default::default()
        }
    }

    fn honey_gatt() -> Vec<(Uuid, Vec<Uuid>)> {
        use crate::ble::uuids::*;
        vec![
            (BATTERY_SERVICE_UUID, vec![BATTERY_LEVEL_UUID]),
            (
                PROPRIETARY_TEMPERATURE_SERVICE_UUID,
                vec![PROPRIETARY_TEMPERATURE_UUID],
            ),
        ]
    }

    fn model_seed(model: u16) -> DeviceSeed {
        DeviceSeed {
            model: Some(ModelId(model)),
            ..Default::default()
        }
    }

    fn drive_to_ready(
        session: &DeviceSession,
        services: &[Uuid],
    ) -> Vec<SessionUpdate> {
        let mut updates = vec![session.request_connect().unwrap(), session.handle_connected()];
        updates.push(session.handle_services_discovered(services, None));
        for service in services {
            updates.push(session.handle_characteristics_discovered(
                service,
                &[Uuid::from_u128(service.as_u128() + 1000)],
                None,
            ));
        }
        updates
    }

    #[test]
    fn test_reaches_ready_once_for_one_service() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        let updates = drive_to_ready(&session, &services(1));
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert_eq!(ready_count(&updates), 1);
    }

    #[test]
    fn test_reaches_ready_once_for_fifty_services() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        let svcs = services(50);
        let mut updates = drive_to_ready(&session, &svcs);

        // Late duplicates are ignored.
        updates.push(session.handle_characteristics_discovered(&svcs[0], &[], None));
        updates.push(session.handle_services_discovered(&svcs, None));

        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert_eq!(ready_count(&updates), 1);
        assert!(updates.last().unwrap().is_empty());
    }

    #[test]
    fn test_connect_issues_service_discovery() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session
            .record_advertisement(&finder_advertisement(0x04), Some(-60), Utc::now(), None, &registry);

        let update = session.request_connect().unwrap();
        assert_eq!(update.commands, vec![RadioCommand::Connect(address())]);

        let update = session.handle_connected();
        assert_eq!(
            update.commands,
            vec![RadioCommand::DiscoverServices {
                address: address(),
                services: vec![crate::ble::uuids::DEVICE_INFO_SERVICE_UUID, FINDER_SERVICE_UUID],
            }]
        );
        assert_eq!(session.connection_state(), ConnectionState::DiscoveringServices);
    }

    #[test]
    fn test_degraded_service_still_reaches_ready() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        let svcs = services(2);

        session.request_connect().unwrap();
        session.handle_connected();
        session.handle_services_discovered(&svcs, None);

        let first = session.handle_characteristics_discovered(
            &svcs[0],
            &[],
            Some(PlatformError::new("attribute not found")),
        );
        assert_eq!(session.connection_state(), ConnectionState::DiscoveringCharacteristics);
        assert!(first
            .changes
            .contains(&DeviceChange::ServiceDegraded { service: svcs[0] }));
        assert!(first.commands.is_empty());

        let second = session.handle_characteristics_discovered(&svcs[1], &[], None);
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert_eq!(ready_count(&[second]), 1);

        let record = session.snapshot();
        assert_eq!(record.degraded_services, vec![svcs[0]]);
        assert_eq!(
            record.last_error.map(|e| e.operation),
            Some(RadioOperation::DiscoverCharacteristics)
        );
    }

    #[test]
    fn test_service_discovery_error_tears_down() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        session.request_connect().unwrap();
        session.handle_connected();

        let update =
            session.handle_services_discovered(&[], Some(PlatformError::new("gatt failure")));
        assert_eq!(session.connection_state(), ConnectionState::Disconnecting);
        assert_eq!(update.commands, vec![RadioCommand::Disconnect(address())]);

        session.handle_disconnected(None);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_no_relevant_services_goes_straight_to_ready() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session.request_connect().unwrap();
        session.handle_connected();
        let update = session.handle_services_discovered(&services(3), None);
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert!(update.commands.is_empty());
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session.request_connect().unwrap();

        let update = session.handle_connect_failed(PlatformError::new("timeout"));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(update
            .changes
            .iter()
            .any(|c| matches!(c, DeviceChange::TransientFailure(f) if f.operation == RadioOperation::Connect)));

        // A second failure for the same attempt is ignored.
        assert!(session
            .handle_connect_failed(PlatformError::new("timeout"))
            .is_empty());
    }

    #[test]
    fn test_disconnect_preserves_telemetry() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        session.record_advertisement(&Advertisement::new(vec![0u8; 4]), Some(-70), Utc::now(), None, &registry);
        drive_to_ready(&session, &services(2));

        let update = session.request_disconnect();
        assert_eq!(update.commands, vec![RadioCommand::Disconnect(address())]);
        session.handle_disconnected(None);

        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.telemetry().rssi.len(), 1);
        assert_eq!(session.packet_count(), 1);
    }

    #[test]
    fn test_advertisement_updates_record() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);

        let first = session.record_advertisement(&finder_advertisement(0x04), Some(-60), t1, None, &registry);
        assert!(first.changes.contains(&DeviceChange::VariantResolved(DeviceKind::Finder)));
        assert!(first.changes.contains(&DeviceChange::BecameReachable));
        assert!(first
            .changes
            .contains(&DeviceChange::AdvertisementStateChanged(AdvertisementState::Low)));

        let second = session.record_advertisement(&finder_advertisement(0x04), Some(-70), t2, None, &registry);
        assert!(!second.changes.contains(&DeviceChange::BecameReachable));
        assert!(!second
            .changes
            .iter()
            .any(|c| matches!(c, DeviceChange::BatteryUpdated(_))));

        let record = session.snapshot();
        assert_eq!(record.packet_count, 2);
        assert_eq!(record.last_seen, Some(t2));
        assert!(record.in_range);
        assert_eq!(record.kind, DeviceKind::Finder);
        assert_eq!(record.model, Some(ModelId(LEGACY_FINDER_ID)));
        assert_eq!(record.telemetry.rssi.len(), 2);
        assert_eq!(record.telemetry.battery.len(), 1);
        assert_eq!(record.battery_percent(), Some(50.0));
        assert_eq!(record.rssi(), Some(-70));
    }

    #[test]
    fn test_first_resolved_variant_wins() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());

        let card = Advertisement::new(vec![0x0E, 0x05, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x00]);
        session.record_advertisement(&card, None, Utc::now(), None, &registry);
        assert_eq!(session.kind(), DeviceKind::Card);

        let update = session.record_advertisement(&finder_advertisement(0), None, Utc::now(), None, &registry);
        assert_eq!(session.kind(), DeviceKind::Card);
        assert!(update.changes.contains(&DeviceChange::VariantConflict {
            resolved: ModelId(0x0E05),
            advertised: ModelId(LEGACY_FINDER_ID),
        }));
    }

    #[test]
    fn test_unknown_model_resolves_to_fallback() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let mut data = vec![0x06, 0x00, 0x07];
        data.extend_from_slice(&[0u8; 10]);
        session.record_advertisement(&Advertisement::new(data), Some(-50), Utc::now(), None, &registry);

        let record = session.snapshot();
        assert_eq!(record.kind, DeviceKind::Unknown);
        assert_eq!(record.model, Some(ModelId(7)));
        assert!(record.capabilities.services.is_empty());
    }

    #[test]
    fn test_clear_history() {
        let registry = DeviceClassRegistry::new();
        let seed = DeviceSeed {
            name: Some("Keys".to_string()),
            ..Default::default()
        };
        let session = DeviceSession::seeded(address(), &seed, &registry, &SessionSettings::default());
        let seen = Utc::now();
        session.record_advertisement(&finder_advertisement(0), Some(-55), seen, None, &registry);

        let update = session.clear_history();
        assert_eq!(update.changes, vec![DeviceChange::HistoryCleared]);

        let record = session.snapshot();
        assert!(record.telemetry.is_empty());
        assert_eq!(record.packet_count, 0);
        assert_eq!(record.last_seen, Some(seen));
        assert_eq!(record.name.as_deref(), Some("Keys"));
        assert_eq!(record.address, address());
    }

    #[test]
    fn test_wake_noop_when_active() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session.record_advertisement(&finder_advertisement(0x00), None, Utc::now(), None, &registry);

        let before = session.snapshot();
        let update = session.wake_up().unwrap();
        assert!(update.is_empty());
        assert_eq!(session.snapshot(), before);
    }

    #[test]
    fn test_wake_from_disconnected() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session.record_advertisement(&finder_advertisement(0x04), None, Utc::now(), None, &registry);

        let update = session.wake_up().unwrap();
        assert_eq!(update.commands, vec![RadioCommand::Connect(address())]);
        assert!(update.changes.contains(&DeviceChange::WakeRequested));

        session.handle_connected();
        let update = session.handle_services_discovered(&[FINDER_SERVICE_UUID], None);
        assert_eq!(update.commands.len(), 1);

        let update = session.handle_characteristics_discovered(
            &FINDER_SERVICE_UUID,
            &[FINDER_DATA2_UUID],
            None,
        );
        let wake = registry
            .handler_for(&session.variant())
            .wake_request()
            .unwrap();
        assert_eq!(
            update.commands,
            vec![RadioCommand::Write {
                address: address(),
                request: wake,
            }]
        );

        let update = session.handle_written(&FINDER_DATA2_UUID, None);
        assert!(update.changes.contains(&DeviceChange::WakeCompleted));
        assert_eq!(update.commands, vec![RadioCommand::Disconnect(address())]);
        assert_eq!(session.connection_state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_wake_unsupported_on_fallback() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        assert!(matches!(session.wake_up(), Err(Error::NotSupported { .. })));
    }

    #[test]
    fn test_buzz_requires_ready() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        session.record_advertisement(&finder_advertisement(0), None, Utc::now(), None, &registry);

        assert!(matches!(
            session.buzz(true),
            Err(Error::NotReady {
                state: ConnectionState::Disconnected
            })
        ));

        session.request_connect().unwrap();
        session.handle_connected();
        session.handle_services_discovered(&[FINDER_SERVICE_UUID], None);
        session.handle_characteristics_discovered(&FINDER_SERVICE_UUID, &[], None);

        let update = session.buzz(true).unwrap();
        assert_eq!(update.commands.len(), 1);
    }

    #[test]
    fn test_decode_error_is_isolated() {
        let registry = DeviceClassRegistry::new();
        let session = ready_session(&registry, honey_seed(0), &honey_gatt());

        let battery = crate::ble::uuids::BATTERY_LEVEL_UUID;
        let update = session.handle_value_updated(&battery, &[250], None);
        assert!(matches!(update.changes[..], [DeviceChange::DecodeFailed { .. }]));
        assert!(session.telemetry().battery.is_empty());

        let update = session.handle_value_updated(&battery, &[42], None);
        assert_eq!(update.changes, vec![DeviceChange::BatteryUpdated(42.0)]);
    }

    #[test]
    fn test_temperature_calibration_applied() {
        let registry = DeviceClassRegistry::new();
        let session = ready_session(&registry, honey_seed(2), &honey_gatt());
        let temperature = crate::ble::uuids::PROPRIETARY_TEMPERATURE_UUID;

        session.handle_value_updated(&temperature, &[20], None);
        assert_eq!(
            session.telemetry().latest_temperature(),
            Some(TemperatureReading { raw: 20, calibrated: 22 })
        );

        session.calibrate_temperature(18).unwrap();
        assert_eq!(session.temp_calibration_offset(), -2);
        session.handle_value_updated(&temperature, &[21], None);
        assert_eq!(
            session.telemetry().latest_temperature(),
            Some(TemperatureReading { raw: 21, calibrated: 19 })
        );
    }

    #[test]
    fn test_calibrate_without_reading_fails() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        assert!(matches!(
            session.calibrate_temperature(20),
            Err(Error::InvalidData { .. })
        ));
    }

    #[test]
    fn test_expire_respects_presence_radius() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let seen = Utc::now();
        let here = Position::new(45.0, 7.0, seen);
        session.record_advertisement(&finder_advertisement(0), None, seen, Some(here), &registry);

        let timeout = Duration::from_secs(60);
        let later = seen + chrono::Duration::seconds(120);

        let nearby = Position::new(45.0005, 7.0, later);
        assert!(session.expire(later, timeout, Some(&nearby), 150.0).is_empty());
        assert!(session.in_range());

        let far = Position::new(45.01, 7.0, later);
        let update = session.expire(later, timeout, Some(&far), 150.0);
        assert_eq!(update.changes, vec![DeviceChange::BecameUnreachable]);
        assert!(!session.in_range());
    }

    #[test]
    fn test_expire_ignores_fresh_devices() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let seen = Utc::now();
        session.record_advertisement(&finder_advertisement(0), None, seen, None, &registry);
        assert!(session
            .expire(seen, Duration::from_secs(60), None, 150.0)
            .is_empty());
    }

    #[test]
    fn test_record_position_only_for_recent_devices() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let now = Utc::now();
        let window = Duration::from_secs(70);

        // Seeded/unseen devices are not attributed positions.
        assert!(session
            .record_position(Position::new(1.0, 1.0, now), now, window)
            .is_empty());

        session.record_advertisement(&finder_advertisement(0), None, now, None, &registry);
        let update = session.record_position(Position::new(1.0, 1.0, now), now, window);
        assert_eq!(update.changes.len(), 1);
        assert_eq!(session.telemetry().locations.len(), 1);

        let much_later = now + chrono::Duration::seconds(300);
        assert!(session
            .record_position(Position::new(1.0, 1.0, much_later), much_later, window)
            .is_empty());
    }

    #[test]
    fn test_command_failed_maps_to_failure_event() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::new(address(), &registry, &SessionSettings::default());
        let update = session.request_connect().unwrap();

        let failure = session.command_failed(&update.commands[0], &Error::BluetoothUnavailable);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(failure
            .changes
            .iter()
            .any(|c| matches!(c, DeviceChange::TransientFailure(_))));
    }
    #[test]
    fn test_calibration_saturates() {
        let registry = DeviceClassRegistry::new();
        let session = ready_session(&registry, honey_seed(0), &honey_gatt());
        let temperature = crate::ble::uuids::PROPRIETARY_TEMPERATURE_UUID;
        session.handle_value_updated(&temperature, &[0xF6], None);

        session.calibrate_temperature(i32::MAX).unwrap();
        assert_eq!(session.temp_calibration_offset(), i32::MAX);

        session.handle_value_updated(&temperature, &[20], None);
        session.calibrate_temperature(i32::MIN).unwrap();
        assert_eq!(session.temp_calibration_offset(), i32::MIN);
    }

    #[test]
    fn test_values_outside_ready_are_dropped() {
        let registry = DeviceClassRegistry::new();
        let session = DeviceSession::seeded(address(), &honey_seed(0), &registry, &SessionSettings::default());
        let battery = crate::ble::uuids::BATTERY_LEVEL_UUID;

        assert!(session.handle_value_updated(&battery, &[42], None).is_empty());
        assert!(session.telemetry().battery.is_empty());

        session.request_connect().unwrap();
        session.handle_connected();
        assert!(session.handle_value_updated(&battery, &[42], None).is_empty());
        assert!(session
            .handle_value_updated(&battery, &[], Some(PlatformError::new("stale")))
            .is_empty());
        assert_eq!(session.snapshot().last_error, None);
    }

    #[test]
    fn test_disconnect_mid_discovery_resets_bookkeeping() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        let svcs = services(3);

        session.request_connect().unwrap();
        session.handle_connected();
        session.handle_services_discovered(&svcs, None);
        session.handle_characteristics_discovered(
            &svcs[0],
            &[],
            Some(PlatformError::new("attribute not found")),
        );
        assert_eq!(session.connection_state(), ConnectionState::DiscoveringCharacteristics);
        assert_eq!(session.snapshot().degraded_services, vec![svcs[0]]);

        // Link drops with two services still outstanding.
        session.handle_disconnected(Some(PlatformError::new("link lost")));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.state.read().discovery.outstanding.is_empty());

        // Late lists from the dropped link are ignored.
        assert!(session
            .handle_characteristics_discovered(&svcs[1], &[], None)
            .is_empty());

        let updates = drive_to_ready(&session, &svcs[1..]);
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert_eq!(ready_count(&updates), 1);

        let record = session.snapshot();
        assert!(record.degraded_services.is_empty());
        assert!(session.state.read().discovery.outstanding.is_empty());
    }

    #[test]
    fn test_duplicate_list_mid_discovery_is_ignored() {
        let registry = discover_all_registry();
        let session = discover_all_session(&registry);
        let svcs = services(2);

        session.request_connect().unwrap();
        session.handle_connected();
        session.handle_services_discovered(&svcs, None);
        session.handle_characteristics_discovered(&svcs[0], &[Uuid::from_u128(500)], None);

        let duplicate =
            session.handle_characteristics_discovered(&svcs[0], &[Uuid::from_u128(501)], None);
        assert!(duplicate.is_empty());
        assert_eq!(session.connection_state(), ConnectionState::DiscoveringCharacteristics);
        assert!(!session
            .state
            .read()
            .discovery
            .characteristics
            .contains_key(&Uuid::from_u128(501)));

        let last = session.handle_characteristics_discovered(&svcs[1], &[], None);
        assert_eq!(ready_count(&[last]), 1);
    }

    #[test]
    fn test_finder_commands_require_ready() {
        use crate::protocol::DeviceVolume;

        let registry = DeviceClassRegistry::new();
        let offline = DeviceSession::seeded(
            address(),
            &model_seed(LEGACY_FINDER_ID),
            &registry,
            &SessionSettings::default(),
        );
        assert!(matches!(
            offline.send_command(DeviceCommand::Reboot),
            Err(Error::NotReady { .. })
        ));

        let session = ready_session(
            &registry,
            model_seed(LEGACY_FINDER_ID),
            &[(FINDER_SERVICE_UUID, vec![])],
        );
        let update = session
            .send_command(DeviceCommand::SetVolume(DeviceVolume::Low))
            .unwrap();
        let [RadioCommand::Write { request, .. }] = &update.commands[..] else {
            panic!("expected one write, got {:?}", update.commands);
        };
        assert_eq!(&request.data[..], &[0x02, 0x00, 0x00, 0x01]);

        let ack = session.handle_written(&request.characteristic, None);
        assert!(ack
            .changes
            .contains(&DeviceChange::CommandAcknowledged(DeviceCommand::SetVolume(
                DeviceVolume::Low
            ))));
        assert_eq!(session.settings().volume, Some(DeviceVolume::Low));

        assert!(matches!(
            session.send_command(DeviceCommand::SetJingle(9)),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            session.send_command(DeviceCommand::SetTrackingMode(crate::protocol::TrackingMode::Dynamic)),
            Err(Error::NotSupported { .. })
        ));
    }

    #[test]
    fn test_buzz_ack_does_not_consume_command() {
        let registry = DeviceClassRegistry::new();
        let session = ready_session(
            &registry,
            model_seed(LEGACY_FINDER_ID),
            &[(FINDER_SERVICE_UUID, vec![])],
        );
        session.buzz(true).unwrap();
        session.send_command(DeviceCommand::SetJingle(2)).unwrap();

        let first = session.handle_written(&crate::ble::uuids::FINDER_DATA1_UUID, None);
        assert!(!first
            .changes
            .iter()
            .any(|c| matches!(c, DeviceChange::CommandAcknowledged(_))));

        let second = session.handle_written(&crate::ble::uuids::FINDER_DATA1_UUID, None);
        assert!(second
            .changes
            .contains(&DeviceChange::CommandAcknowledged(DeviceCommand::SetJingle(2))));
        assert_eq!(session.settings().jingle, Some(2));
    }

    #[test]
    fn test_firmware_query_reads_directly() {
        use crate::ble::uuids::{DEVICE_INFO_SERVICE_UUID, SOFTWARE_REVISION_UUID};

        let registry = DeviceClassRegistry::new();
        let session = ready_session(
            &registry,
            model_seed(LEGACY_FINDER_ID),
            &[(DEVICE_INFO_SERVICE_UUID, vec![SOFTWARE_REVISION_UUID])],
        );

        let update = session.query(DeviceQuery::FirmwareVersion).unwrap();
        assert_eq!(
            update.commands,
            vec![RadioCommand::Read {
                address: address(),
                service: DEVICE_INFO_SERVICE_UUID,
                characteristic: SOFTWARE_REVISION_UUID,
            }]
        );
        assert!(matches!(
            session.query(DeviceQuery::FirmwareVersion),
            Err(Error::Busy { .. })
        ));

        let answer = session.handle_value_updated(&SOFTWARE_REVISION_UUID, b"1.9.4", None);
        assert_eq!(
            answer.changes,
            vec![DeviceChange::QueryAnswered(QueryResponse::FirmwareVersion(
                "1.9.4".to_string()
            ))]
        );
        assert_eq!(session.snapshot().settings.firmware_version.as_deref(), Some("1.9.4"));
        assert!(session.query(DeviceQuery::FirmwareVersion).is_ok());
    }

    #[test]
    fn test_found_query_prompts_then_reads() {
        use crate::ble::advertising::LEGACY_FOUND_ID;
        use crate::ble::uuids::FOUND_DATA3_UUID;
        use crate::protocol::ChargingStatus;

        let registry = DeviceClassRegistry::new();
        let session = ready_session(
            &registry,
            model_seed(LEGACY_FOUND_ID),
            &[(FINDER_SERVICE_UUID, vec![FOUND_DATA3_UUID])],
        );

        let update = session.query(DeviceQuery::ChargingStatus).unwrap();
        assert!(matches!(
            &update.commands[..],
            [RadioCommand::Write { request, .. }] if request.characteristic == FOUND_DATA3_UUID
        ));

        // The answer is only read once the prompt is acknowledged.
        assert!(session
            .handle_value_updated(&FOUND_DATA3_UUID, &[8, 3, 0, 1], None)
            .changes
            .is_empty());

        let ack = session.handle_written(&FOUND_DATA3_UUID, None);
        assert_eq!(
            ack.commands,
            vec![RadioCommand::Read {
                address: address(),
                service: FINDER_SERVICE_UUID,
                characteristic: FOUND_DATA3_UUID,
            }]
        );

        let answer = session.handle_value_updated(&FOUND_DATA3_UUID, &[8, 3, 0, 1], None);
        assert_eq!(
            answer.changes,
            vec![DeviceChange::QueryAnswered(QueryResponse::ChargingStatus(
                ChargingStatus::Charging
            ))]
        );
        assert_eq!(session.settings().charging, Some(ChargingStatus::Charging));
    }

    #[test]
    fn test_disconnect_drops_pending_query() {
        use crate::ble::uuids::{DEVICE_INFO_SERVICE_UUID, SOFTWARE_REVISION_UUID};

        let registry = DeviceClassRegistry::new();
        let session = ready_session(
            &registry,
            model_seed(LEGACY_FINDER_ID),
            &[(DEVICE_INFO_SERVICE_UUID, vec![SOFTWARE_REVISION_UUID])],
        );
        session.query(DeviceQuery::FirmwareVersion).unwrap();
        session.handle_disconnected(Some(PlatformError::new("link lost")));

        let updates = drive_to_ready(&session, &[]);
        assert_eq!(ready_count(&updates), 1);
        assert!(session.query(DeviceQuery::FirmwareVersion).is_ok());
    }
}
