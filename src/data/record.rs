//! Immutable snapshot of a known device.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::history::TelemetryHistory;
use super::position::Position;
use crate::ble::address::DeviceAddress;
use crate::ble::advertising::{AdvertisementInfo, ModelId};
use crate::ble::connection::ConnectionState;
use crate::ble::events::{PlatformError, RadioOperation};
use crate::protocol::DeviceSettings;
use crate::registry::{CapabilitySet, DeviceKind};

/// A radio failure recorded against a device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransientFailure {
    /// Operation that failed.
    pub operation: RadioOperation,
    /// Reported failure.
    pub error: PlatformError,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time copy of a device session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceRecord {
    /// Hardware address.
    pub address: DeviceAddress,
    /// User-assigned name.
    pub name: Option<String>,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Time of the most recent advertisement.
    pub last_seen: Option<DateTime<Utc>>,
    /// Host position at the most recent attributed observation.
    pub last_location: Option<Position>,
    /// Whether the device is currently considered reachable.
    pub in_range: bool,
    /// Last manufacturer-data payload.
    pub raw_advertisement: Option<Bytes>,
    /// Radio packets attributed to this device since the last history clear.
    pub packet_count: u64,
    /// Connection state.
    pub connection_state: ConnectionState,
    /// Hardware product.
    pub kind: DeviceKind,
    /// Model identifier the variant was resolved from.
    pub model: Option<ModelId>,
    /// Effective capabilities.
    pub capabilities: CapabilitySet,
    /// Latest decoded advertisement fields.
    pub advertisement: AdvertisementInfo,
    /// Telemetry history.
    pub telemetry: TelemetryHistory,
    /// Offset added to raw temperature readings.
    pub temp_calibration_offset: i32,
    /// Services whose characteristics could not be discovered.
    pub degraded_services: Vec<Uuid>,
    /// Most recent radio failure.
    pub last_error: Option<TransientFailure>,
    /// Last known settings and device information.
    pub settings: DeviceSettings,
}

impl DeviceRecord {
    /// Display name: the user-assigned name, else the advertised one, else
    /// the product name.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.local_name.clone())
            .unwrap_or_else(|| self.kind.display_name().to_string())
    }

    /// Latest raw RSSI.
    pub fn rssi(&self) -> Option<i16> {
        self.telemetry.latest_rssi()
    }

    /// Latest battery level.
    pub fn battery_percent(&self) -> Option<f64> {
        self.telemetry.latest_battery()
    }

    /// Check if `last_seen` is older than `timeout` at `now`. Devices never
    /// seen over the air are not stale.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_seen {
            Some(seen) => now
                .signed_duration_since(seen)
                .to_std()
                .map(|age| age > timeout)
                .unwrap_or(false),
            None => false,
        }
    }
}
