//! Per-variant protocol handlers.
//!
//! A handler knows which services and characteristics its hardware exposes,
//! how to read its advertisement and characteristic payloads, and which
//! writes wake or ring the device. Sessions only talk to hardware through
//! this trait.

pub mod finder;
pub mod found;
pub mod honey;
pub mod mfi;
pub mod settings;

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

use crate::ble::advertising::AdvertisementInfo;
use crate::error::{Error, Result};

pub use finder::FinderHandler;
pub use found::FoundHandler;
pub use honey::HoneyHandler;
pub use mfi::MfiHandler;
pub use settings::{
    ChargingStatus, DeviceCommand, DeviceQuery, DeviceSettings, DeviceVolume, QueryRequest,
    QueryResponse, TrackingMode,
};

/// Key into the registry's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HandlerKind {
    /// No protocol decoding.
    Unknown,
    /// Finder, Finder 2 and Card.
    Finder,
    /// Honey.
    Honey,
    /// Found (cellular).
    Found,
    /// First-generation MFi hardware.
    Mfi,
    /// V2 MFi hardware.
    MfiV2,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Finder => write!(f, "finder"),
            Self::Honey => write!(f, "honey"),
            Self::Found => write!(f, "found"),
            Self::Mfi => write!(f, "mfi"),
            Self::MfiV2 => write!(f, "mfi-v2"),
        }
    }
}

/// What a characteristic is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Battery level.
    Battery,
    /// Temperature.
    Temperature,
    /// Command channel (buzz, configuration).
    Command,
    /// Wake channel.
    Wake,
    /// Alert level.
    Alert,
    /// Device information string.
    DeviceInfo,
    /// Not interpreted.
    Other,
}

/// A characteristic write produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Service owning the characteristic.
    pub service: Uuid,
    /// Target characteristic.
    pub characteristic: Uuid,
    /// Bytes to write.
    pub data: Bytes,
    /// Whether the radio should wait for a write response.
    pub with_response: bool,
}

impl WriteRequest {
    /// Create a write request.
    pub fn new(service: Uuid, characteristic: Uuid, data: &'static [u8], with_response: bool) -> Self {
        Self {
            service,
            characteristic,
            data: Bytes::from_static(data),
            with_response,
        }
    }

    /// Create a write request with computed bytes.
    pub fn owned(service: Uuid, characteristic: Uuid, data: Vec<u8>, with_response: bool) -> Self {
        Self {
            service,
            characteristic,
            data: Bytes::from(data),
            with_response,
        }
    }
}

/// Variant-specific protocol logic.
///
/// Every method has a default that does nothing useful, which is exactly the
/// behavior of unidentified hardware.
pub trait ProtocolHandler: Send + Sync + fmt::Debug {
    /// Table key for this handler.
    fn kind(&self) -> HandlerKind;

    /// Characteristics to discover for `service`.
    ///
    /// `None` skips the service. An empty list asks for every characteristic.
    fn characteristics_for_service(&self, _service: &Uuid) -> Option<Vec<Uuid>> {
        None
    }

    /// Decode an advertisement payload.
    fn parse_advertisement(&self, _data: &[u8]) -> AdvertisementInfo {
        AdvertisementInfo::default()
    }

    /// Role of a characteristic.
    fn role_of(&self, _characteristic: &Uuid) -> CharacteristicRole {
        CharacteristicRole::Other
    }

    /// Decode a battery characteristic value to a percentage.
    fn decode_battery(&self, _value: &[u8]) -> Result<f64> {
        Err(Error::NotSupported {
            operation: "battery decoding".to_string(),
        })
    }

    /// Decode a temperature characteristic value to whole degrees Celsius.
    fn decode_temperature(&self, _value: &[u8]) -> Result<i32> {
        Err(Error::NotSupported {
            operation: "temperature decoding".to_string(),
        })
    }

    /// Write that switches the device back to fast broadcast.
    fn wake_request(&self) -> Option<WriteRequest> {
        None
    }

    /// Write that starts the buzzer.
    fn buzz_request(&self) -> Option<WriteRequest> {
        None
    }

    /// Write that silences the buzzer.
    fn stop_buzz_request(&self) -> Option<WriteRequest> {
        None
    }

    /// Write carrying a maintenance or settings command.
    fn command_request(&self, _command: &DeviceCommand) -> Option<WriteRequest> {
        None
    }

    /// How to read an information query.
    fn query_request(&self, _query: DeviceQuery) -> Option<QueryRequest> {
        None
    }

    /// Decode the answer to an information query.
    fn decode_query_response(&self, query: DeviceQuery, _value: &[u8]) -> Result<QueryResponse> {
        Err(Error::NotSupported {
            operation: format!("{} query", query),
        })
    }
}

/// Handler for hardware that could not be identified.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownHandler;

impl ProtocolHandler for UnknownHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Unknown
    }
}

/// Decode a standard battery level value (one byte, percent).
pub(crate) fn decode_battery_level(value: &[u8]) -> Result<f64> {
    match value.first() {
        Some(&level) if level <= 100 => Ok(f64::from(level)),
        Some(&level) => Err(Error::InvalidData {
            context: format!("battery level {} out of range", level),
        }),
        None => Err(Error::InvalidData {
            context: "empty battery level".to_string(),
        }),
    }
}
