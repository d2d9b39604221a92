//! Events delivered by the radio and location collaborators.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::advertising::Advertisement;
use crate::data::position::{Position, RegionState};

/// An error reported by an external collaborator inside an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("{message}")]
pub struct PlatformError {
    /// Platform-provided description.
    pub message: String,
}

impl PlatformError {
    /// Create a platform error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&crate::error::Error> for PlatformError {
    fn from(err: &crate::error::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Event from the radio transport.
///
/// Events for one device must arrive in the order the radio produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// An advertisement was received.
    Discovered {
        /// Device address.
        address: DeviceAddress,
        /// Advertisement contents.
        advertisement: Advertisement,
        /// Signal strength in dBm, if reported.
        rssi: Option<i16>,
        /// Reception time.
        timestamp: DateTime<Utc>,
    },
    /// Connect request succeeded.
    Connected {
        /// Device address.
        address: DeviceAddress,
    },
    /// Connect request failed.
    ConnectFailed {
        /// Device address.
        address: DeviceAddress,
        /// Reported failure.
        error: PlatformError,
    },
    /// Link dropped, expectedly or not.
    Disconnected {
        /// Device address.
        address: DeviceAddress,
        /// Failure that caused the drop, if any.
        error: Option<PlatformError>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// Device address.
        address: DeviceAddress,
        /// Discovered service UUIDs.
        services: Vec<Uuid>,
        /// Discovery failure.
        error: Option<PlatformError>,
    },
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        /// Device address.
        address: DeviceAddress,
        /// Service the characteristics belong to.
        service: Uuid,
        /// Discovered characteristic UUIDs.
        characteristics: Vec<Uuid>,
        /// Discovery failure.
        error: Option<PlatformError>,
    },
    /// A characteristic value was read or notified.
    CharacteristicValueUpdated {
        /// Device address.
        address: DeviceAddress,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Raw value.
        value: Bytes,
        /// Read failure.
        error: Option<PlatformError>,
    },
    /// A write with response completed.
    CharacteristicWritten {
        /// Device address.
        address: DeviceAddress,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Write failure.
        error: Option<PlatformError>,
    },
    /// Radio powered on or off.
    HardwareStateChanged {
        /// Whether the radio can be used.
        ready: bool,
    },
}

impl RadioEvent {
    /// Address the event is about, if it is device-scoped.
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            Self::Discovered { address, .. }
            | Self::Connected { address }
            | Self::ConnectFailed { address, .. }
            | Self::Disconnected { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicsDiscovered { address, .. }
            | Self::CharacteristicValueUpdated { address, .. }
            | Self::CharacteristicWritten { address, .. } => Some(address),
            Self::HardwareStateChanged { .. } => None,
        }
    }
}

/// Event from the location collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    /// New host position.
    PositionUpdated(Position),
    /// Host entered or left a monitored region.
    RegionStateChanged {
        /// Region identifier.
        region_id: String,
        /// New state.
        state: RegionState,
    },
    /// The platform could not monitor a region.
    RegionMonitoringFailed {
        /// Region identifier.
        region_id: String,
        /// Reported failure.
        error: PlatformError,
    },
}

/// Radio operation a transient failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioOperation {
    /// Connect.
    Connect,
    /// Disconnect.
    Disconnect,
    /// Service discovery.
    DiscoverServices,
    /// Characteristic discovery.
    DiscoverCharacteristics,
    /// Characteristic read or notification.
    Read,
    /// Characteristic write.
    Write,
    /// Notification subscription.
    Subscribe,
}

impl fmt::Display for RadioOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::DiscoverCharacteristics => write!(f, "characteristic discovery"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}
