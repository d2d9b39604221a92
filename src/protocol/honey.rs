//! Honey protocol: standard alert and battery services plus a proprietary
//! temperature sensor.

use uuid::Uuid;

use super::{decode_battery_level, CharacteristicRole, HandlerKind, ProtocolHandler, WriteRequest};
use crate::ble::uuids::{
    ALERT_LEVEL_UUID, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, IMMEDIATE_ALERT_SERVICE_UUID,
    LINK_LOSS_SERVICE_UUID, PROPRIETARY_TEMPERATURE_SERVICE_UUID, PROPRIETARY_TEMPERATURE_UUID,
};
use crate::error::{Error, Result};

/// Handler for Honey devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct HoneyHandler;

impl ProtocolHandler for HoneyHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Honey
    }

    fn characteristics_for_service(&self, service: &Uuid) -> Option<Vec<Uuid>> {
        match *service {
            IMMEDIATE_ALERT_SERVICE_UUID | LINK_LOSS_SERVICE_UUID => Some(vec![ALERT_LEVEL_UUID]),
            BATTERY_SERVICE_UUID => Some(vec![BATTERY_LEVEL_UUID]),
            PROPRIETARY_TEMPERATURE_SERVICE_UUID => Some(vec![PROPRIETARY_TEMPERATURE_UUID]),
            _ => None,
        }
    }

    fn role_of(&self, characteristic: &Uuid) -> CharacteristicRole {
        match *characteristic {
            BATTERY_LEVEL_UUID => CharacteristicRole::Battery,
            PROPRIETARY_TEMPERATURE_UUID => CharacteristicRole::Temperature,
            ALERT_LEVEL_UUID => CharacteristicRole::Alert,
            _ => CharacteristicRole::Other,
        }
    }

    fn decode_battery(&self, value: &[u8]) -> Result<f64> {
        decode_battery_level(value)
    }

    fn decode_temperature(&self, value: &[u8]) -> Result<i32> {
        value
            .first()
            .map(|b| i32::from(*b as i8))
            .ok_or_else(|| Error::InvalidData {
                context: "empty temperature value".to_string(),
            })
    }

    fn buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            IMMEDIATE_ALERT_SERVICE_UUID,
            ALERT_LEVEL_UUID,
            &[0x02],
            false,
        ))
    }

    fn stop_buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            IMMEDIATE_ALERT_SERVICE_UUID,
            ALERT_LEVEL_UUID,
            &[0x00],
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_temperature() {
        assert_eq!(HoneyHandler.decode_temperature(&[22]).unwrap(), 22);
        assert_eq!(HoneyHandler.decode_temperature(&[0xF6]).unwrap(), -10);
        assert!(HoneyHandler.decode_temperature(&[]).is_err());
    }

    #[test]
    fn test_roles() {
        assert_eq!(HoneyHandler.role_of(&BATTERY_LEVEL_UUID), CharacteristicRole::Battery);
        assert_eq!(
            HoneyHandler.role_of(&PROPRIETARY_TEMPERATURE_UUID),
            CharacteristicRole::Temperature
        );
        assert!(HoneyHandler.wake_request().is_none());
    }

    #[test]
    fn test_buzz_writes_alert_level() {
        let buzz = HoneyHandler.buzz_request().unwrap();
        assert_eq!(buzz.characteristic, ALERT_LEVEL_UUID);
        assert_eq!(&buzz.data[..], &[0x02]);
        assert!(!buzz.with_response);
    }
}
