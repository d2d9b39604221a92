//! Narrow interface to the platform radio.
//!
//! Every call is fire-and-forget: it returns once the request has been handed
//! to the radio, and completion arrives later as a [`RadioEvent`]. An `Err`
//! means the request could not even be issued.
//!
//! [`RadioEvent`]: crate::ble::events::RadioEvent

use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::events::RadioOperation;
use crate::error::Result;
use crate::protocol::WriteRequest;

/// Platform radio transport.
pub trait RadioTransport: Send + Sync {
    /// Start scanning for devices advertising any of `services`.
    fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Stop scanning.
    fn stop_scan(&self) -> Result<()>;

    /// Open a link to a device.
    fn connect(&self, address: &DeviceAddress) -> Result<()>;

    /// Close the link to a device.
    fn disconnect(&self, address: &DeviceAddress) -> Result<()>;

    /// Discover services; an empty filter asks for all of them.
    fn discover_services(&self, address: &DeviceAddress, services: &[Uuid]) -> Result<()>;

    /// Discover characteristics of one service; an empty filter asks for all.
    fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: &Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    /// Write a characteristic.
    fn write(&self, address: &DeviceAddress, request: &WriteRequest) -> Result<()>;

    /// Read a characteristic; the value arrives as a value update.
    fn read(&self, address: &DeviceAddress, service: &Uuid, characteristic: &Uuid) -> Result<()>;

    /// Enable notifications for a characteristic.
    fn subscribe(&self, address: &DeviceAddress, service: &Uuid, characteristic: &Uuid)
        -> Result<()>;
}

/// A per-device request produced by a session for the manager to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    /// Open a link.
    Connect(DeviceAddress),
    /// Close a link.
    Disconnect(DeviceAddress),
    /// Discover services.
    DiscoverServices {
        /// Device address.
        address: DeviceAddress,
        /// Service filter.
        services: Vec<Uuid>,
    },
    /// Discover characteristics of a service.
    DiscoverCharacteristics {
        /// Device address.
        address: DeviceAddress,
        /// Service UUID.
        service: Uuid,
        /// Characteristic filter.
        characteristics: Vec<Uuid>,
    },
    /// Write a characteristic.
    Write {
        /// Device address.
        address: DeviceAddress,
        /// The write.
        request: WriteRequest,
    },
    /// Read a characteristic.
    Read {
        /// Device address.
        address: DeviceAddress,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Enable notifications.
    Subscribe {
        /// Device address.
        address: DeviceAddress,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
}

impl RadioCommand {
    /// Target device.
    pub fn address(&self) -> &DeviceAddress {
        match self {
            Self::Connect(address) | Self::Disconnect(address) => address,
            Self::DiscoverServices { address, .. }
            | Self::DiscoverCharacteristics { address, .. }
            | Self::Write { address, .. }
            | Self::Read { address, .. }
            | Self::Subscribe { address, .. } => address,
        }
    }

    /// Operation kind.
    pub fn operation(&self) -> RadioOperation {
        match self {
            Self::Connect(_) => RadioOperation::Connect,
            Self::Disconnect(_) => RadioOperation::Disconnect,
            Self::DiscoverServices { .. } => RadioOperation::DiscoverServices,
            Self::DiscoverCharacteristics { .. } => RadioOperation::DiscoverCharacteristics,
            Self::Write { .. } => RadioOperation::Write,
            Self::Read { .. } => RadioOperation::Read,
            Self::Subscribe { .. } => RadioOperation::Subscribe,
        }
    }

    /// Hand the command to a transport.
    pub fn send(&self, transport: &dyn RadioTransport) -> Result<()> {
        match self {
            Self::Connect(address) => transport.connect(address),
            Self::Disconnect(address) => transport.disconnect(address),
            Self::DiscoverServices { address, services } => {
                transport.discover_services(address, services)
            }
            Self::DiscoverCharacteristics {
                address,
                service,
                characteristics,
            } => transport.discover_characteristics(address, service, characteristics),
            Self::Write { address, request } => transport.write(address, request),
            Self::Read {
                address,
                service,
                characteristic,
            } => transport.read(address, service, characteristic),
            Self::Subscribe {
                address,
                service,
                characteristic,
            } => transport.subscribe(address, service, characteristic),
        }
    }
}
