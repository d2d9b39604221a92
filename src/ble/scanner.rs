//! Radio transport over btleplug.
//!
//! One listener task turns adapter events into [`RadioEvent`]s. Every
//! command runs as its own task and reports completion on the same channel.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::advertising::{Advertisement, ModelId};
use crate::ble::events::{PlatformError, RadioEvent};
use crate::ble::transport::RadioTransport;
use crate::ble::uuids::is_finder_family_service;
use crate::error::{Error, Result};
use crate::protocol::WriteRequest;

type EventSender = mpsc::UnboundedSender<RadioEvent>;

#[derive(Default)]
struct KnownPeripherals {
    by_address: HashMap<DeviceAddress, Peripheral>,
    by_id: HashMap<PeripheralId, DeviceAddress>,
}

/// [`RadioTransport`] backed by the system Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    events: EventSender,
    known: Arc<RwLock<KnownPeripherals>>,
    /// Notification stream task per device.
    notification_tasks: Arc<Mutex<HashMap<DeviceAddress, JoinHandle<()>>>>,
    listener: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter event stream cannot be opened or no
    /// tokio runtime is running.
    pub async fn with_adapter(
        adapter: Adapter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let runtime = Handle::try_current().map_err(|e| Error::Internal(e.to_string()))?;
        let (events, rx) = mpsc::unbounded_channel();
        let known = Arc::new(RwLock::new(KnownPeripherals::default()));

        let mut stream = adapter.events().await.map_err(Error::Bluetooth)?;

        // An adapter that hands out an event stream is usable.
        let _ = events.send(RadioEvent::HardwareStateChanged { ready: true });

        let listener = {
            let adapter = adapter.clone();
            let known = known.clone();
            let events = events.clone();
            runtime.spawn(async move {
                while let Some(event) = stream.next().await {
                    Self::handle_event(event, &adapter, &known, &events).await;
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok((
            Self {
                adapter,
                runtime,
                events,
                known,
                notification_tasks: Arc::new(Mutex::new(HashMap::new())),
                listener,
            },
            rx,
        ))
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        known: &Arc<RwLock<KnownPeripherals>>,
        events: &EventSender,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, known, events).await;
            }
            CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                Self::process_peripheral(adapter, id, known, events).await;
            }
            CentralEvent::DeviceConnected(id) => {
                // Connected is reported by the connect task.
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let address = known.read().by_id.get(&id).copied();
                if let Some(address) = address {
                    let _ = events.send(RadioEvent::Disconnected {
                        address,
                        error: None,
                    });
                }
            }
            CentralEvent::StateUpdate(state) => {
                let ready = matches!(state, CentralState::PoweredOn);
                let _ = events.send(RadioEvent::HardwareStateChanged { ready });
            }
            CentralEvent::ServiceDataAdvertisement { .. } => {}
            CentralEvent::ServicesAdvertisement { .. } => {}
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        known: &Arc<RwLock<KnownPeripherals>>,
        events: &EventSender,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let Some(advertisement) = Self::advertisement_from(&properties) else {
            return;
        };

        let address = DeviceAddress::from_advertisement(
            &advertisement.manufacturer_data,
            advertisement.local_name.as_deref(),
        )
        .unwrap_or_else(|| DeviceAddress::from(properties.address));

        {
            let mut known = known.write();
            known.by_id.insert(id, address);
            known.by_address.insert(address, peripheral);
        }

        let _ = events.send(RadioEvent::Discovered {
            address,
            advertisement,
            rssi: properties.rssi,
            timestamp: Utc::now(),
        });
    }

    /// Rebuild the manufacturer payload with its company identifier prefix.
    /// Devices that neither carry a model identifier nor advertise a finder
    /// service are not ours.
    fn advertisement_from(properties: &PeripheralProperties) -> Option<Advertisement> {
        let mut payloads: Vec<Vec<u8>> = properties
            .manufacturer_data
            .iter()
            .map(|(company, data)| {
                let mut payload = company.to_le_bytes().to_vec();
                payload.extend_from_slice(data);
                payload
            })
            .collect();
        payloads.sort_by_key(|p| ModelId::from_manufacturer_data(p).is_none());

        let payload = payloads.into_iter().next().unwrap_or_default();
        let ours = ModelId::from_manufacturer_data(&payload).is_some()
            || properties.services.iter().any(is_finder_family_service);
        if !ours {
            return None;
        }

        Some(Advertisement {
            manufacturer_data: Bytes::from(payload),
            local_name: properties.local_name.clone(),
            services: properties.services.clone(),
        })
    }

    fn peripheral(&self, address: &DeviceAddress) -> Result<Peripheral> {
        self.known
            .read()
            .by_address
            .get(address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: address.to_string(),
            })
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *characteristic && c.service_uuid == *service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }

    fn platform_error(err: btleplug::Error) -> PlatformError {
        PlatformError::new(err.to_string())
    }

    fn ensure_notification_stream(&self, address: DeviceAddress, peripheral: Peripheral) {
        let mut tasks = self.notification_tasks.lock();
        if tasks.get(&address).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let events = self.events.clone();
        let handle = self.runtime.spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%address, "Failed to open notification stream: {}", e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                let _ = events.send(RadioEvent::CharacteristicValueUpdated {
                    address,
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                    error: None,
                });
            }
            debug!(%address, "Notification stream ended");
        });
        tasks.insert(address, handle);
    }
}

impl RadioTransport for BtleplugTransport {
    fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        info!("Starting BLE scan");
        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, address: &DeviceAddress) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let address = *address;
        let events = self.events.clone();

        self.runtime.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => RadioEvent::Connected { address },
                Err(e) => RadioEvent::ConnectFailed {
                    address,
                    error: Self::platform_error(e),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        if let Some(task) = self.notification_tasks.lock().remove(address) {
            task.abort();
        }
        let address = *address;
        let events = self.events.clone();

        self.runtime.spawn(async move {
            let error = peripheral.disconnect().await.err().map(Self::platform_error);
            let _ = events.send(RadioEvent::Disconnected { address, error });
        });
        Ok(())
    }

    fn discover_services(&self, address: &DeviceAddress, _services: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let address = *address;
        let events = self.events.clone();

        // The full GATT table is discovered; filtering happens per service.
        self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => RadioEvent::ServicesDiscovered {
                    address,
                    services: peripheral.services().iter().map(|s| s.uuid).collect(),
                    error: None,
                },
                Err(e) => RadioEvent::ServicesDiscovered {
                    address,
                    services: Vec::new(),
                    error: Some(Self::platform_error(e)),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: &Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.peripheral(address)?;

        let event = match peripheral.services().into_iter().find(|s| s.uuid == *service) {
            Some(found) => RadioEvent::CharacteristicsDiscovered {
                address: *address,
                service: *service,
                characteristics: found
                    .characteristics
                    .iter()
                    .map(|c| c.uuid)
                    .filter(|uuid| characteristics.is_empty() || characteristics.contains(uuid))
                    .collect(),
                error: None,
            },
            None => RadioEvent::CharacteristicsDiscovered {
                address: *address,
                service: *service,
                characteristics: Vec::new(),
                error: Some(PlatformError::new(format!("service {} not found", service))),
            },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    fn write(&self, address: &DeviceAddress, request: &WriteRequest) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let characteristic =
            Self::characteristic(&peripheral, &request.service, &request.characteristic)?;
        let address = *address;
        let events = self.events.clone();
        let data = request.data.clone();
        let with_response = request.with_response;

        self.runtime.spawn(async move {
            let write_type = if with_response {
                WriteType::WithResponse
            } else {
                WriteType::WithoutResponse
            };
            let result = peripheral.write(&characteristic, &data, write_type).await;
            if with_response || result.is_err() {
                let _ = events.send(RadioEvent::CharacteristicWritten {
                    address,
                    characteristic: characteristic.uuid,
                    error: result.err().map(Self::platform_error),
                });
            }
        });
        Ok(())
    }

    fn read(&self, address: &DeviceAddress, service: &Uuid, characteristic: &Uuid) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        let address = *address;
        let events = self.events.clone();

        self.runtime.spawn(async move {
            let (value, error) = match peripheral.read(&characteristic).await {
                Ok(value) => (Bytes::from(value), None),
                Err(e) => (Bytes::new(), Some(Self::platform_error(e))),
            };
            let _ = events.send(RadioEvent::CharacteristicValueUpdated {
                address,
                characteristic: characteristic.uuid,
                value,
                error,
            });
        });
        Ok(())
    }

    fn subscribe(
        &self,
        address: &DeviceAddress,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Result<()> {
        let peripheral = self.peripheral(address)?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        self.ensure_notification_stream(*address, peripheral.clone());

        let address = *address;
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.subscribe(&characteristic).await {
                let _ = events.send(RadioEvent::CharacteristicValueUpdated {
                    address,
                    characteristic: characteristic.uuid,
                    value: Bytes::new(),
                    error: Some(Self::platform_error(e)),
                });
            }
        });
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.listener.abort();
        for (_, task) in self.notification_tasks.lock().drain() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("known", &self.known.read().by_address.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::BDAddr;

    fn properties(manufacturer_data: HashMap<u16, Vec<u8>>, services: Vec<Uuid>) -> PeripheralProperties {
        PeripheralProperties {
            address: BDAddr::from([1, 2, 3, 4, 5, 6]),
            manufacturer_data,
            services,
            ..Default::default()
        }
    }

    #[test]
    fn test_company_id_is_prefixed() {
        let mut data = HashMap::new();
        // Legacy finder: bytes 0E 0E arrive as company id 0x0E0E.
        data.insert(0x0E0E, vec![0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x04]);

        let advertisement = BtleplugTransport::advertisement_from(&properties(data, vec![])).unwrap();
        assert_eq!(
            &advertisement.manufacturer_data[..],
            &[0x0E, 0x0E, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x04]
        );
        assert_eq!(advertisement.model_id(), Some(ModelId(0x0E0E)));
    }

    #[test]
    fn test_foreign_devices_are_skipped() {
        let mut data = HashMap::new();
        data.insert(0x004C, vec![0x02, 0x15]);
        assert!(BtleplugTransport::advertisement_from(&properties(data, vec![])).is_none());
    }

    #[test]
    fn test_finder_service_without_payload_is_kept() {
        let advertisement = BtleplugTransport::advertisement_from(&properties(
            HashMap::new(),
            vec![crate::ble::uuids::FINDER_SERVICE_UUID],
        ))
        .unwrap();
        assert!(advertisement.manufacturer_data.is_empty());
    }
}
