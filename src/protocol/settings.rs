//! Device settings, maintenance commands and information queries.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::WriteRequest;
use crate::error::Error;

/// Highest selectable jingle index.
pub const MAX_JINGLE: u8 = 8;

/// Buzzer volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceVolume {
    /// Silent.
    Mute = 0,
    /// Low.
    Low = 1,
    /// Medium.
    Medium = 2,
    /// High.
    High = 3,
}

impl DeviceVolume {
    /// Wire value.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// How often a cellular device reports its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrackingMode {
    /// Firmware-chosen reporting rate.
    Dynamic,
    /// Frequent reporting.
    Emergency,
    /// Infrequent reporting.
    LowPower,
    /// Cellular radio off.
    BluetoothOnly,
    /// Adaptive tracking.
    Area,
    /// Finding mode.
    Finding,
    /// Standby.
    Standby,
    /// Report only after motion.
    Motion,
    /// Continuous reporting.
    LiveTracking,
}

impl TrackingMode {
    /// Every mode, in display order.
    pub const ALL: [TrackingMode; 9] = [
        Self::Dynamic,
        Self::LowPower,
        Self::Emergency,
        Self::Finding,
        Self::Area,
        Self::Motion,
        Self::Standby,
        Self::BluetoothOnly,
        Self::LiveTracking,
    ];

    /// Wire value.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Dynamic => 0,
            Self::Emergency => 1,
            Self::LowPower => 2,
            Self::BluetoothOnly => 3,
            Self::Area => 10,
            Self::Finding => 11,
            Self::Standby => 12,
            Self::Motion => 14,
            Self::LiveTracking => 15,
        }
    }

    /// Decode a wire value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_byte() == byte)
    }

    /// Stable text identifier used by backends.
    pub fn identifier(self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Emergency => "emergency",
            Self::LowPower => "low_power",
            Self::BluetoothOnly => "ble_only",
            Self::Area => "area_tracking",
            Self::Finding => "finding_mode",
            Self::Standby => "standby",
            Self::Motion => "motion_triggered",
            Self::LiveTracking => "live_tracking",
        }
    }
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for TrackingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.identifier() == s)
            .ok_or_else(|| Error::InvalidParameter {
                name: "tracking_mode".to_string(),
                value: s.to_string(),
            })
    }
}

/// Whether the device is on its charger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChargingStatus {
    /// Charging.
    Charging,
    /// Not charging.
    NotCharging,
}

/// One-shot command written to a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceCommand {
    /// Put the device into its long-term storage mode.
    Dormant,
    /// Restart the firmware.
    Reboot,
    /// Set the buzzer volume.
    SetVolume(DeviceVolume),
    /// Select the ring tone, `1..=MAX_JINGLE`.
    SetJingle(u8),
    /// Set the cellular reporting mode.
    SetTrackingMode(TrackingMode),
}

impl DeviceCommand {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dormant => "dormant",
            Self::Reboot => "reboot",
            Self::SetVolume(_) => "volume",
            Self::SetJingle(_) => "jingle",
            Self::SetTrackingMode(_) => "tracking mode",
        }
    }
}

/// Information read back from a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceQuery {
    /// Firmware version string.
    FirmwareVersion,
    /// Current tracking mode.
    TrackingMode,
    /// Charger state.
    ChargingStatus,
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirmwareVersion => write!(f, "firmware version"),
            Self::TrackingMode => write!(f, "tracking mode"),
            Self::ChargingStatus => write!(f, "charging status"),
        }
    }
}

/// How to obtain a [`DeviceQuery`] answer.
///
/// When `prompt` is set it is written first, and the answer is read from
/// `service`/`characteristic` once the write is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Write that asks the firmware to prepare the answer.
    pub prompt: Option<WriteRequest>,
    /// Service holding the answer.
    pub service: Uuid,
    /// Characteristic holding the answer.
    pub characteristic: Uuid,
}

/// Decoded answer to a [`DeviceQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueryResponse {
    /// Firmware version string.
    FirmwareVersion(String),
    /// Current tracking mode.
    TrackingMode(TrackingMode),
    /// Charger state.
    ChargingStatus(ChargingStatus),
}

/// Last known device settings and information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSettings {
    /// Firmware version.
    pub firmware_version: Option<String>,
    /// Buzzer volume.
    pub volume: Option<DeviceVolume>,
    /// Selected jingle.
    pub jingle: Option<u8>,
    /// Tracking mode.
    pub tracking_mode: Option<TrackingMode>,
    /// Charger state.
    pub charging: Option<ChargingStatus>,
}

impl DeviceSettings {
    /// Record an acknowledged command.
    pub fn apply_command(&mut self, command: &DeviceCommand) {
        match *command {
            DeviceCommand::SetVolume(volume) => self.volume = Some(volume),
            DeviceCommand::SetJingle(jingle) => self.jingle = Some(jingle),
            DeviceCommand::SetTrackingMode(mode) => self.tracking_mode = Some(mode),
            DeviceCommand::Dormant | DeviceCommand::Reboot => {}
        }
    }

    /// Record a query answer.
    pub fn apply_response(&mut self, response: &QueryResponse) {
        match response {
            QueryResponse::FirmwareVersion(version) => {
                self.firmware_version = Some(version.clone())
            }
            QueryResponse::TrackingMode(mode) => self.tracking_mode = Some(*mode),
            QueryResponse::ChargingStatus(status) => self.charging = Some(*status),
        }
    }
}

/// Decode a UTF-8 device information string, dropping NUL padding.
pub(crate) fn decode_info_string(value: &[u8]) -> crate::error::Result<String> {
    let text = std::str::from_utf8(value).map_err(|e| Error::InvalidData {
        context: format!("information string is not UTF-8: {}", e),
    })?;
    let text = text.trim_end_matches('\0').trim();
    if text.is_empty() {
        return Err(Error::InvalidData {
            context: "empty information string".to_string(),
        });
    }
    Ok(text.to_string())
}
