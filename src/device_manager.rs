//! Device manager for discovering and managing finder devices.
//!
//! The manager owns every known [`DeviceSession`], routes radio and location
//! events to them, relays the radio commands they produce, and owns the scan,
//! region-monitoring and broadcast configuration.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::address::DeviceAddress;
use crate::ble::advertising::Advertisement;
use crate::ble::events::{LocationEvent, PlatformError, RadioEvent};
use crate::ble::scanner::BtleplugTransport;
use crate::ble::transport::RadioTransport;
use crate::config::ManagerConfig;
use crate::data::position::{Position, RegionState};
use crate::data::record::DeviceRecord;
use crate::error::{Error, Result};
use crate::protocol::{DeviceCommand, DeviceQuery, DeviceVolume, TrackingMode};
use crate::region::{BeaconAdvertisement, BeaconRegion, BroadcastEmitter, RegionMonitor};
use crate::registry::DeviceClassRegistry;
use crate::session::{DeviceChange, DeviceSeed, DeviceSession, SessionSettings, SessionUpdate};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Notification that a device changed.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    /// The session that changed.
    pub session: Arc<DeviceSession>,
    /// What changed.
    pub change: DeviceChange,
}

impl DeviceUpdate {
    /// Address of the device.
    pub fn address(&self) -> &DeviceAddress {
        self.session.address()
    }

    /// Snapshot of the device after the change.
    pub fn record(&self) -> DeviceRecord {
        self.session.snapshot()
    }
}

/// Manager-level notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Radio powered on or off.
    HardwareStateChanged {
        /// Whether the radio can be used.
        ready: bool,
    },
    /// New host position.
    PositionUpdated(Position),
    /// Host entered or left a monitored region.
    RegionStateChanged {
        /// Region identifier.
        region_id: String,
        /// New state.
        state: RegionState,
    },
    /// A region could not be monitored.
    RegionMonitoringFailed {
        /// Region identifier.
        region_id: String,
        /// Reported failure.
        error: PlatformError,
    },
}

#[derive(Debug, Default)]
struct ScanState {
    /// Caller intent.
    requested: bool,
    hardware_ready: bool,
    /// Whether the radio is currently scanning.
    active: bool,
}

#[derive(Debug, Default)]
struct RegionConfig {
    devices: BTreeSet<DeviceAddress>,
    active: BTreeSet<BeaconRegion>,
    retries: u32,
}

/// Central manager for discovering and managing devices.
pub struct DeviceManager {
    /// Radio transport.
    transport: Arc<dyn RadioTransport>,
    /// Variant table.
    registry: Arc<DeviceClassRegistry>,
    config: ManagerConfig,
    settings: SessionSettings,
    /// Known devices by address.
    devices: RwLock<HashMap<DeviceAddress, Arc<DeviceSession>>>,
    scan: Mutex<ScanState>,
    regions: Mutex<RegionConfig>,
    /// Latest host position.
    host_position: RwLock<Option<Position>>,
    region_monitor: Option<Arc<dyn RegionMonitor>>,
    broadcaster: Option<Arc<dyn BroadcastEmitter>>,
    /// Device update channel.
    update_tx: broadcast::Sender<DeviceUpdate>,
    /// Manager event channel.
    manager_tx: broadcast::Sender<ManagerEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Radio event pump task.
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a manager with the default registry and configuration.
    pub fn new(transport: Arc<dyn RadioTransport>) -> Self {
        let config = ManagerConfig::default();
        Self::build(transport, Arc::new(DeviceClassRegistry::new()), config)
    }

    /// Create a manager from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_parts(
        transport: Arc<dyn RadioTransport>,
        registry: Arc<DeviceClassRegistry>,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, registry, config))
    }

    /// Create a manager over the system Bluetooth adapter and start pumping
    /// its events.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration
    /// is invalid.
    pub async fn with_btleplug(config: ManagerConfig) -> Result<Arc<Self>> {
        let (transport, events) = BtleplugTransport::new().await?;
        let manager = Arc::new(Self::with_parts(
            Arc::new(transport),
            Arc::new(DeviceClassRegistry::new()),
            config,
        )?);

        let pump = manager.spawn_event_pump(events);
        *manager.event_pump.lock() = Some(pump);
        Ok(manager)
    }

    fn build(
        transport: Arc<dyn RadioTransport>,
        registry: Arc<DeviceClassRegistry>,
        config: ManagerConfig,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(config.notification_capacity);
        let (manager_tx, _) = broadcast::channel(config.notification_capacity);
        let settings = SessionSettings {
            history_capacity: config.history_capacity,
            rssi_smoothing: config.rssi_smoothing_factor,
        };

        Self {
            transport,
            registry,
            config,
            settings,
            devices: RwLock::new(HashMap::new()),
            scan: Mutex::new(ScanState::default()),
            regions: Mutex::new(RegionConfig::default()),
            host_position: RwLock::new(None),
            region_monitor: None,
            broadcaster: None,
            update_tx,
            manager_tx,
            callback_counter: AtomicU64::new(0),
            event_pump: Mutex::new(None),
        }
    }

    /// Attach the platform geofencing subsystem.
    pub fn with_region_monitor(mut self, monitor: Arc<dyn RegionMonitor>) -> Self {
        self.region_monitor = Some(monitor);
        self
    }

    /// Attach the platform beacon transmitter.
    pub fn with_broadcast_emitter(mut self, emitter: Arc<dyn BroadcastEmitter>) -> Self {
        self.broadcaster = Some(emitter);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Variant table.
    pub fn registry(&self) -> &Arc<DeviceClassRegistry> {
        &self.registry
    }

    /// Spawn a task feeding radio events into this manager. The task ends
    /// when the channel closes or the manager is dropped.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_event(event);
            }
            debug!("Radio event pump ended");
        })
    }

    // === Scanning ===

    /// Enable or disable scanning. While the radio is not powered on the
    /// request is kept and applied once it is.
    pub fn set_scanning_enabled(&self, enabled: bool) -> Result<()> {
        let mut scan = self.scan.lock();
        scan.requested = enabled;
        if enabled {
            self.regions.lock().retries = 0;
        }

        if !scan.hardware_ready {
            debug!(enabled, "Radio not ready, scan request queued");
            return Ok(());
        }
        self.apply_scan(&mut scan)
    }

    /// Stop and restart scanning. Device records are kept.
    pub fn reset_scan(&self) -> Result<()> {
        let mut scan = self.scan.lock();
        if !scan.hardware_ready || !scan.requested {
            debug!("Scan reset skipped, not scanning");
            return Ok(());
        }

        info!("Resetting scan");
        if scan.active {
            self.transport.stop_scan()?;
            scan.active = false;
        }
        self.apply_scan(&mut scan)
    }

    /// Check if the radio is currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.scan.lock().active
    }

    /// Check if the radio is powered on.
    pub fn is_hardware_ready(&self) -> bool {
        self.scan.lock().hardware_ready
    }

    fn apply_scan(&self, scan: &mut ScanState) -> Result<()> {
        match (scan.requested, scan.active) {
            (true, false) => {
                self.transport.start_scan(&self.config.scan_services)?;
                scan.active = true;
                info!(services = self.config.scan_services.len(), "Scanning started");
            }
            (false, true) => {
                self.transport.stop_scan()?;
                scan.active = false;
                info!("Scanning stopped");
            }
            _ => {}
        }
        Ok(())
    }

    // === Device set ===

    /// Register a device before it has been observed. An already known
    /// device is returned unchanged.
    pub fn add_device(&self, address: DeviceAddress, seed: Option<DeviceSeed>) -> Arc<DeviceSession> {
        let (session, created) = {
            let mut devices = self.devices.write();
            match devices.entry(address) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let session = match &seed {
                        Some(seed) => {
                            DeviceSession::seeded(address, seed, &self.registry, &self.settings)
                        }
                        None => DeviceSession::new(address, &self.registry, &self.settings),
                    };
                    (entry.insert(Arc::new(session)).clone(), true)
                }
            }
        };

        if created {
            info!(%address, seeded = seed.is_some(), "Device added");
            self.publish(&session, DeviceChange::Created);
        } else {
            debug!(%address, "Device already known");
        }
        session
    }

    /// Forget a device, closing its link if one is open.
    pub fn remove_device(&self, address: &DeviceAddress) -> Result<()> {
        let session = self
            .devices
            .write()
            .remove(address)
            .ok_or_else(|| Self::not_found(address))?;

        info!(%address, "Device removed");
        let update = session.request_disconnect();
        self.apply(&session, update);
        self.publish(&session, DeviceChange::Removed);
        Ok(())
    }

    /// Forget every device.
    pub fn remove_all_devices(&self) {
        let sessions: Vec<_> = self.devices.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            let update = session.request_disconnect();
            self.apply(&session, update);
            self.publish(&session, DeviceChange::Removed);
        }
    }

    /// Snapshot of every known device, ordered by address.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.sessions().iter().map(|s| s.snapshot()).collect();
        records.sort_by_key(|r| r.address);
        records
    }

    /// Snapshot of one device.
    pub fn device(&self, address: &DeviceAddress) -> Option<DeviceRecord> {
        self.session(address).map(|s| s.snapshot())
    }

    /// Every known session.
    pub fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.devices.read().values().cloned().collect()
    }

    /// Session for one device.
    pub fn session(&self, address: &DeviceAddress) -> Option<Arc<DeviceSession>> {
        self.devices.read().get(address).cloned()
    }

    /// In-range devices sorted by signal strength, strongest first.
    pub fn devices_by_signal(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.devices().into_iter().filter(|r| r.in_range).collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.rssi().unwrap_or(i16::MIN)));
        records
    }

    /// Get the number of known devices.
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    // === Per-device operations ===

    /// Open a link to a device.
    pub fn connect(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.request_connect()?;
        self.apply(&session, update);
        Ok(())
    }

    /// Close the link to a device.
    pub fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.request_disconnect();
        self.apply(&session, update);
        Ok(())
    }

    /// Bring a slow-broadcasting finder back to active broadcast. A device
    /// already broadcasting actively is left alone.
    pub fn wake_up_finder(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.wake_up()?;
        self.apply(&session, update);
        Ok(())
    }

    /// Start the device buzzer.
    pub fn buzz(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.buzz(true)?;
        self.apply(&session, update);
        Ok(())
    }

    /// Stop the device buzzer.
    pub fn stop_buzz(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.buzz(false)?;
        self.apply(&session, update);
        Ok(())
    }

    /// Put a finder into its long-term storage mode.
    pub fn set_dormant(&self, address: &DeviceAddress) -> Result<()> {
        self.send_command(address, DeviceCommand::Dormant)
    }

    /// Restart a device's firmware.
    pub fn reboot(&self, address: &DeviceAddress) -> Result<()> {
        self.send_command(address, DeviceCommand::Reboot)
    }

    /// Set the buzzer volume.
    pub fn set_volume(&self, address: &DeviceAddress, volume: DeviceVolume) -> Result<()> {
        self.send_command(address, DeviceCommand::SetVolume(volume))
    }

    /// Select the ring tone.
    pub fn set_jingle(&self, address: &DeviceAddress, jingle: u8) -> Result<()> {
        self.send_command(address, DeviceCommand::SetJingle(jingle))
    }

    /// Set a cellular device's reporting mode.
    pub fn set_tracking_mode(&self, address: &DeviceAddress, mode: TrackingMode) -> Result<()> {
        self.send_command(address, DeviceCommand::SetTrackingMode(mode))
    }

    /// Write a command to a `Ready` device. Completion is reported as
    /// [`DeviceChange::CommandAcknowledged`].
    pub fn send_command(&self, address: &DeviceAddress, command: DeviceCommand) -> Result<()> {
        let session = self.require(address)?;
        let update = session.send_command(command)?;
        self.apply(&session, update);
        Ok(())
    }

    /// Read the firmware version.
    pub fn request_firmware_version(&self, address: &DeviceAddress) -> Result<()> {
        self.query(address, DeviceQuery::FirmwareVersion)
    }

    /// Read a cellular device's tracking mode.
    pub fn request_tracking_mode(&self, address: &DeviceAddress) -> Result<()> {
        self.query(address, DeviceQuery::TrackingMode)
    }

    /// Read a cellular device's charger state.
    pub fn request_charging_status(&self, address: &DeviceAddress) -> Result<()> {
        self.query(address, DeviceQuery::ChargingStatus)
    }

    /// Ask a `Ready` device for information. The answer is reported as
    /// [`DeviceChange::QueryAnswered`].
    pub fn query(&self, address: &DeviceAddress, query: DeviceQuery) -> Result<()> {
        let session = self.require(address)?;
        let update = session.query(query)?;
        self.apply(&session, update);
        Ok(())
    }

    /// Reset a device's telemetry and packet count.
    pub fn clear_history(&self, address: &DeviceAddress) -> Result<()> {
        let session = self.require(address)?;
        let update = session.clear_history();
        self.apply(&session, update);
        Ok(())
    }

    /// Set a device's temperature calibration offset.
    pub fn set_temp_calibration(&self, address: &DeviceAddress, offset: i32) -> Result<()> {
        let session = self.require(address)?;
        let update = session.set_temp_calibration(offset);
        self.apply(&session, update);
        Ok(())
    }

    /// Calibrate a device against a reference temperature.
    pub fn calibrate_temperature(&self, address: &DeviceAddress, actual: i32) -> Result<()> {
        let session = self.require(address)?;
        let update = session.calibrate_temperature(actual)?;
        self.apply(&session, update);
        Ok(())
    }

    /// Set a device's user-assigned name.
    pub fn set_name(&self, address: &DeviceAddress, name: Option<String>) -> Result<()> {
        let session = self.require(address)?;
        let update = session.set_name(name);
        self.apply(&session, update);
        Ok(())
    }

    /// Mark devices whose advertisements went stale as out of range.
    /// Returns the affected devices.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<DeviceAddress> {
        let host = *self.host_position.read();
        let mut expired = Vec::new();

        for session in self.sessions() {
            let timeout = self
                .config
                .stale_timeout
                .unwrap_or_else(|| session.variant().capabilities.stale_timeout);
            let update = session.expire(now, timeout, host.as_ref(), self.config.presence_radius_m);
            if !update.is_empty() {
                expired.push(*session.address());
                self.apply(&session, update);
            }
        }

        expired.sort();
        expired
    }

    // === Region monitoring and broadcast ===

    /// Replace the set of devices with monitored regions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an unparsable identity or
    /// too many identities; the previous configuration stays active.
    pub fn configure_region_monitoring<I, S>(&self, identities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut devices = BTreeSet::new();
        for identity in identities {
            let identity = identity.as_ref();
            let address = identity
                .parse::<DeviceAddress>()
                .map_err(|_| Error::InvalidConfiguration {
                    reason: format!("invalid device identity: {:?}", identity),
                })?;
            devices.insert(address);
        }

        if devices.len() > self.config.max_monitored_regions {
            return Err(Error::InvalidConfiguration {
                reason: format!(
                    "{} regions requested, at most {} can be monitored",
                    devices.len(),
                    self.config.max_monitored_regions
                ),
            });
        }

        let mut regions = self.regions.lock();
        regions.devices = devices;
        regions.retries = 0;
        self.apply_regions(&mut regions);
        Ok(())
    }

    /// Regions currently monitored.
    pub fn monitored_regions(&self) -> Vec<BeaconRegion> {
        self.regions.lock().active.iter().cloned().collect()
    }

    /// Broadcast the proximity beacon addressed to one device.
    pub fn start_proximity_broadcast(&self, address: &DeviceAddress) -> Result<()> {
        let emitter = self.broadcaster.as_ref().ok_or_else(|| Error::NotSupported {
            operation: "proximity broadcast without an emitter".to_string(),
        })?;
        let beacon = BeaconAdvertisement::for_device(address);
        info!(%address, major = beacon.major, minor = beacon.minor, "Starting proximity broadcast");
        emitter.start_advertising(&beacon)
    }

    /// Stop the proximity beacon.
    pub fn stop_proximity_broadcast(&self) -> Result<()> {
        let emitter = self.broadcaster.as_ref().ok_or_else(|| Error::NotSupported {
            operation: "proximity broadcast without an emitter".to_string(),
        })?;
        info!("Stopping proximity broadcast");
        emitter.stop_advertising()
    }

    fn apply_regions(&self, regions: &mut RegionConfig) {
        let Some(monitor) = &self.region_monitor else {
            debug!(devices = regions.devices.len(), "No region monitor, configuration stored");
            return;
        };

        let target = BeaconRegion::plan(&regions.devices);
        let to_stop: Vec<_> = regions.active.difference(&target).cloned().collect();
        let to_start: Vec<_> = target.difference(&regions.active).cloned().collect();

        for region in to_stop {
            if let Err(e) = monitor.stop_monitoring(&region) {
                warn!(region = %region.identifier, error = %e, "Failed to stop region monitoring");
            }
            regions.active.remove(&region);
        }

        for region in to_start {
            match monitor.start_monitoring(&region) {
                Ok(()) => {
                    debug!(region = %region.identifier, "Region monitoring started");
                    regions.active.insert(region);
                }
                Err(e) => {
                    warn!(region = %region.identifier, error = %e, "Failed to start region monitoring");
                    let _ = self.manager_tx.send(ManagerEvent::RegionMonitoringFailed {
                        region_id: region.identifier.clone(),
                        error: PlatformError::from(&e),
                    });
                }
            }
        }
    }

    // === Event ingestion ===

    /// Route one radio event.
    pub fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered {
                address,
                advertisement,
                rssi,
                timestamp,
            } => self.on_discovered(address, &advertisement, rssi, timestamp),
            RadioEvent::Connected { address } => self.on_connected(address),
            RadioEvent::ConnectFailed { address, error } => self.on_connect_failed(address, error),
            RadioEvent::Disconnected { address, error } => self.on_disconnected(address, error),
            RadioEvent::ServicesDiscovered {
                address,
                services,
                error,
            } => self.on_services_discovered(address, &services, error),
            RadioEvent::CharacteristicsDiscovered {
                address,
                service,
                characteristics,
                error,
            } => self.on_characteristics_discovered(address, service, &characteristics, error),
            RadioEvent::CharacteristicValueUpdated {
                address,
                characteristic,
                value,
                error,
            } => self.on_characteristic_value_updated(address, characteristic, &value, error),
            RadioEvent::CharacteristicWritten {
                address,
                characteristic,
                error,
            } => self.on_characteristic_written(address, characteristic, error),
            RadioEvent::HardwareStateChanged { ready } => self.on_hardware_state_changed(ready),
        }
    }

    /// Route one location event.
    pub fn handle_location_event(&self, event: LocationEvent) {
        match event {
            LocationEvent::PositionUpdated(position) => self.on_position_updated(position),
            LocationEvent::RegionStateChanged { region_id, state } => {
                self.on_region_state_changed(region_id, state)
            }
            LocationEvent::RegionMonitoringFailed { region_id, error } => {
                self.on_region_monitoring_failed(region_id, error)
            }
        }
    }

    /// An advertisement was received.
    pub fn on_discovered(
        &self,
        address: DeviceAddress,
        advertisement: &Advertisement,
        rssi: Option<i16>,
        timestamp: DateTime<Utc>,
    ) {
        let session = self.add_device(address, None);
        let position = *self.host_position.read();
        let update =
            session.record_advertisement(advertisement, rssi, timestamp, position, &self.registry);
        self.apply(&session, update);
    }

    /// Connect request succeeded.
    pub fn on_connected(&self, address: DeviceAddress) {
        let session = self.add_device(address, None);
        let update = session.handle_connected();
        self.apply(&session, update);
    }

    /// Connect request failed.
    pub fn on_connect_failed(&self, address: DeviceAddress, error: PlatformError) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_connect_failed(error);
        self.apply(&session, update);
    }

    /// Link dropped.
    pub fn on_disconnected(&self, address: DeviceAddress, error: Option<PlatformError>) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_disconnected(error);
        self.apply(&session, update);
    }

    /// Service discovery completed.
    pub fn on_services_discovered(
        &self,
        address: DeviceAddress,
        services: &[uuid::Uuid],
        error: Option<PlatformError>,
    ) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_services_discovered(services, error);
        self.apply(&session, update);
    }

    /// Characteristic discovery for one service completed.
    pub fn on_characteristics_discovered(
        &self,
        address: DeviceAddress,
        service: uuid::Uuid,
        characteristics: &[uuid::Uuid],
        error: Option<PlatformError>,
    ) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_characteristics_discovered(&service, characteristics, error);
        self.apply(&session, update);
    }

    /// A characteristic value arrived.
    pub fn on_characteristic_value_updated(
        &self,
        address: DeviceAddress,
        characteristic: uuid::Uuid,
        value: &[u8],
        error: Option<PlatformError>,
    ) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_value_updated(&characteristic, value, error);
        self.apply(&session, update);
    }

    /// A write completed.
    pub fn on_characteristic_written(
        &self,
        address: DeviceAddress,
        characteristic: uuid::Uuid,
        error: Option<PlatformError>,
    ) {
        let Some(session) = self.known(&address) else {
            return;
        };
        let update = session.handle_written(&characteristic, error);
        self.apply(&session, update);
    }

    /// Radio powered on or off. Queued scan intent is replayed on power-on.
    pub fn on_hardware_state_changed(&self, ready: bool) {
        info!(ready, "Radio hardware state changed");
        {
            let mut scan = self.scan.lock();
            scan.hardware_ready = ready;
            if ready {
                if let Err(e) = self.apply_scan(&mut scan) {
                    warn!(error = %e, "Failed to apply queued scan request");
                }
            } else {
                scan.active = false;
            }
        }
        let _ = self.manager_tx.send(ManagerEvent::HardwareStateChanged { ready });
    }

    /// New host position.
    pub fn on_position_updated(&self, position: Position) {
        *self.host_position.write() = Some(position);

        for session in self.sessions() {
            let update = session.record_position(
                position,
                position.timestamp,
                self.config.recent_sighting_window,
            );
            self.apply(&session, update);
        }
        let _ = self.manager_tx.send(ManagerEvent::PositionUpdated(position));
    }

    /// Host entered or left a monitored region.
    pub fn on_region_state_changed(&self, region_id: String, state: RegionState) {
        debug!(region = %region_id, %state, "Region state changed");
        let _ = self
            .manager_tx
            .send(ManagerEvent::RegionStateChanged { region_id, state });
    }

    /// The platform could not monitor a region. The configuration is
    /// re-applied a bounded number of times.
    pub fn on_region_monitoring_failed(&self, region_id: String, error: PlatformError) {
        warn!(region = %region_id, %error, "Region monitoring failed");
        {
            let mut regions = self.regions.lock();
            regions.active.retain(|r| r.identifier != region_id);
            if regions.retries < self.config.region_retry_limit {
                regions.retries += 1;
                info!(attempt = regions.retries, "Re-applying region configuration");
                self.apply_regions(&mut regions);
            } else {
                warn!("Region retry limit reached");
            }
        }
        let _ = self
            .manager_tx
            .send(ManagerEvent::RegionMonitoringFailed { region_id, error });
    }

    // === Notifications ===

    /// Subscribe to device updates.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.update_tx.subscribe()
    }

    /// Subscribe to manager events.
    pub fn subscribe_manager_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.manager_tx.subscribe()
    }

    /// Register a callback for device updates.
    pub fn on_device_updated<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DeviceUpdate) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(update),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(callback_id, skipped, "Device update callback lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for manager events.
    pub fn on_manager_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ManagerEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.manager_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(callback_id, skipped, "Manager event callback lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop scanning and close every open link.
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");
        self.set_scanning_enabled(false)?;

        for session in self.sessions() {
            let update = session.request_disconnect();
            self.apply(&session, update);
        }
        Ok(())
    }

    // === Internals ===

    /// Session for a completion event. Events for forgotten devices are dropped.
    fn known(&self, address: &DeviceAddress) -> Option<Arc<DeviceSession>> {
        let session = self.session(address);
        if session.is_none() {
            debug!(%address, "Ignoring radio event for unknown device");
        }
        session
    }

    fn require(&self, address: &DeviceAddress) -> Result<Arc<DeviceSession>> {
        self.session(address).ok_or_else(|| Self::not_found(address))
    }

    fn not_found(address: &DeviceAddress) -> Error {
        Error::DeviceNotFound {
            identifier: address.to_string(),
        }
    }

    /// Publish changes and issue commands. Commands the transport refuses
    /// are fed back into the session.
    fn apply(&self, session: &Arc<DeviceSession>, update: SessionUpdate) {
        let mut pending = VecDeque::from([update]);

        while let Some(update) = pending.pop_front() {
            for change in update.changes {
                self.publish(session, change);
            }
            for command in update.commands {
                if let Err(e) = command.send(self.transport.as_ref()) {
                    warn!(
                        address = %session.address(),
                        operation = %command.operation(),
                        error = %e,
                        "Radio command rejected"
                    );
                    pending.push_back(session.command_failed(&command, &e));
                }
            }
        }
    }

    fn publish(&self, session: &Arc<DeviceSession>, change: DeviceChange) {
        let _ = self.update_tx.send(DeviceUpdate {
            session: session.clone(),
            change,
        });
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.device_count())
            .field("scan", &*self.scan.lock())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.event_pump.lock().take() {
            handle.abort();
        }
    }
}
