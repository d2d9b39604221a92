//! Found (cellular) protocol.

use uuid::Uuid;

use super::settings::{
    decode_info_string, ChargingStatus, DeviceCommand, DeviceQuery, QueryRequest, QueryResponse,
    TrackingMode,
};
use super::{decode_battery_level, CharacteristicRole, HandlerKind, ProtocolHandler, WriteRequest};
use crate::ble::advertising::{AdvertisementInfo, LegacyStatus};
use crate::ble::uuids::{
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID,
    ENVIRONMENTAL_SENSING_SERVICE_UUID, FINDER_DATA1_UUID, FINDER_DATA2_UUID, FINDER_SERVICE_UUID,
    FOUND_DATA3_UUID, FOUND_DEBUG_MODE_UUID, FOUND_SERVICE_UUID, SOFTWARE_REVISION_UUID,
    TEMPERATURE_UUID,
};
use crate::error::{Error, Result};

const BATTERY_OFFSET: usize = 12;
/// Offset of the value byte in a data3 answer frame.
const ANSWER_VALUE_OFFSET: usize = 3;

/// Handler for Found devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct FoundHandler;

impl FoundHandler {
    fn data3_query(prompt: &'static [u8]) -> QueryRequest {
        QueryRequest {
            prompt: Some(WriteRequest::new(
                FINDER_SERVICE_UUID,
                FOUND_DATA3_UUID,
                prompt,
                true,
            )),
            service: FINDER_SERVICE_UUID,
            characteristic: FOUND_DATA3_UUID,
        }
    }

    fn answer_byte(query: DeviceQuery, value: &[u8]) -> Result<u8> {
        value
            .get(ANSWER_VALUE_OFFSET)
            .copied()
            .ok_or_else(|| Error::InvalidData {
                context: format!("{} answer too short ({} bytes)", query, value.len()),
            })
    }
}

impl ProtocolHandler for FoundHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Found
    }

    fn characteristics_for_service(&self, service: &Uuid) -> Option<Vec<Uuid>> {
        match *service {
            FINDER_SERVICE_UUID => Some(vec![FINDER_DATA1_UUID, FINDER_DATA2_UUID, FOUND_DATA3_UUID]),
            FOUND_SERVICE_UUID => Some(vec![FOUND_DEBUG_MODE_UUID]),
            BATTERY_SERVICE_UUID => Some(vec![BATTERY_LEVEL_UUID]),
            DEVICE_INFO_SERVICE_UUID => Some(vec![SOFTWARE_REVISION_UUID]),
            ENVIRONMENTAL_SENSING_SERVICE_UUID => Some(vec![TEMPERATURE_UUID]),
            _ => None,
        }
    }

    fn parse_advertisement(&self, data: &[u8]) -> AdvertisementInfo {
        let mut info = AdvertisementInfo::default();
        if let Some(status) = LegacyStatus::parse(data) {
            info.state = status.state;
            info.button = Some(status.button);
            info.buzz = Some(status.buzz);
        }
        if let Some(level) = data.get(BATTERY_OFFSET) {
            info.battery_percent = Some(f64::from((*level).min(100)));
        }
        info
    }

    fn role_of(&self, characteristic: &Uuid) -> CharacteristicRole {
        match *characteristic {
            FINDER_DATA1_UUID | FOUND_DATA3_UUID => CharacteristicRole::Command,
            FINDER_DATA2_UUID => CharacteristicRole::Wake,
            BATTERY_LEVEL_UUID => CharacteristicRole::Battery,
            TEMPERATURE_UUID => CharacteristicRole::Temperature,
            SOFTWARE_REVISION_UUID => CharacteristicRole::DeviceInfo,
            _ => CharacteristicRole::Other,
        }
    }

    fn decode_battery(&self, value: &[u8]) -> Result<f64> {
        decode_battery_level(value)
    }

    /// Temperature is a little-endian `sint16` in hundredths of a degree.
    fn decode_temperature(&self, value: &[u8]) -> Result<i32> {
        match value {
            [lo, hi, ..] => {
                let centi = i16::from_le_bytes([*lo, *hi]);
                Ok((f64::from(centi) / 100.0).round() as i32)
            }
            _ => Err(Error::InvalidData {
                context: format!("temperature needs 2 bytes, got {}", value.len()),
            }),
        }
    }

    fn wake_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            FINDER_SERVICE_UUID,
            FINDER_DATA2_UUID,
            &[0x01],
            true,
        ))
    }

    fn buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            FINDER_SERVICE_UUID,
            FINDER_DATA1_UUID,
            &[0x80, 0x01],
            true,
        ))
    }

    fn command_request(&self, command: &DeviceCommand) -> Option<WriteRequest> {
        let data = match *command {
            DeviceCommand::Reboot => vec![0x07],
            DeviceCommand::SetVolume(volume) => vec![0x03, volume.as_byte()],
            DeviceCommand::SetTrackingMode(mode) => vec![0x08, mode.as_byte()],
            DeviceCommand::Dormant | DeviceCommand::SetJingle(_) => return None,
        };
        Some(WriteRequest::owned(
            FINDER_SERVICE_UUID,
            FINDER_DATA1_UUID,
            data,
            true,
        ))
    }

    fn query_request(&self, query: DeviceQuery) -> Option<QueryRequest> {
        Some(match query {
            DeviceQuery::FirmwareVersion => QueryRequest {
                prompt: None,
                service: DEVICE_INFO_SERVICE_UUID,
                characteristic: SOFTWARE_REVISION_UUID,
            },
            DeviceQuery::TrackingMode => Self::data3_query(&[0x08, 0x05, 0x00]),
            DeviceQuery::ChargingStatus => Self::data3_query(&[0x08, 0x03, 0x00]),
        })
    }

    fn decode_query_response(&self, query: DeviceQuery, value: &[u8]) -> Result<QueryResponse> {
        match query {
            DeviceQuery::FirmwareVersion => {
                decode_info_string(value).map(QueryResponse::FirmwareVersion)
            }
            DeviceQuery::TrackingMode => {
                let byte = Self::answer_byte(query, value)?;
                TrackingMode::from_byte(byte)
                    .map(QueryResponse::TrackingMode)
                    .ok_or_else(|| Error::InvalidData {
                        context: format!("unknown tracking mode {}", byte),
                    })
            }
            DeviceQuery::ChargingStatus => {
                let status = match Self::answer_byte(query, value)? {
                    0 => ChargingStatus::NotCharging,
                    _ => ChargingStatus::Charging,
                };
                Ok(QueryResponse::ChargingStatus(status))
            }
        }
    }
}
