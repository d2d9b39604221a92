//! Finder, Finder 2 and Card protocol.

use uuid::Uuid;

use super::settings::{decode_info_string, DeviceCommand, DeviceQuery, QueryRequest, QueryResponse};
use super::{CharacteristicRole, HandlerKind, ProtocolHandler, WriteRequest};
use crate::ble::advertising::{
    legacy_product_id, read_u16_le, AdvertisementInfo, LegacyStatus, LEGACY_CARD_ID,
};
use crate::ble::uuids::{
    DEVICE_INFO_SERVICE_UUID, FINDER_DATA1_UUID, FINDER_DATA2_UUID, FINDER_SERVICE_UUID,
    SOFTWARE_REVISION_UUID,
};
use crate::error::{Error, Result};
use crate::utils::millivolts_to_percent;

/// Finder battery voltage range, mV.
pub const FINDER_BATTERY_RANGE_MV: (u16, u16) = (2000, 3200);
/// Card battery voltage range, mV.
pub const CARD_BATTERY_RANGE_MV: (u16, u16) = (2750, 4200);

const BATTERY_OFFSET: usize = 12;

/// Handler for the legacy finder family.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinderHandler;

impl FinderHandler {
    fn battery_range(data: &[u8]) -> (u16, u16) {
        match legacy_product_id(data) {
            Some(LEGACY_CARD_ID) => CARD_BATTERY_RANGE_MV,
            _ => FINDER_BATTERY_RANGE_MV,
        }
    }
}

impl ProtocolHandler for FinderHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Finder
    }

    fn characteristics_for_service(&self, service: &Uuid) -> Option<Vec<Uuid>> {
        match *service {
            FINDER_SERVICE_UUID => Some(vec![FINDER_DATA1_UUID, FINDER_DATA2_UUID]),
            DEVICE_INFO_SERVICE_UUID => Some(vec![SOFTWARE_REVISION_UUID]),
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

        if data.len() > BATTERY_OFFSET + 2 {
            if let Some(mv) = read_u16_le(data, BATTERY_OFFSET) {
                let (min, max) = Self::battery_range(data);
                info.battery_percent = Some(millivolts_to_percent(mv, min, max));
            }
        }

        info
    }

    fn role_of(&self, characteristic: &Uuid) -> CharacteristicRole {
        match *characteristic {
            FINDER_DATA1_UUID => CharacteristicRole::Command,
            FINDER_DATA2_UUID => CharacteristicRole::Wake,
            SOFTWARE_REVISION_UUID => CharacteristicRole::DeviceInfo,
            _ => CharacteristicRole::Other,
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

    fn stop_buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            FINDER_SERVICE_UUID,
            FINDER_DATA1_UUID,
            &[0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
            true,
        ))
    }

    /// Every command goes to data1 as a fixed-length frame.
    fn command_request(&self, command: &DeviceCommand) -> Option<WriteRequest> {
        let data = match *command {
            DeviceCommand::Dormant => vec![0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
            DeviceCommand::Reboot => vec![0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02],
            DeviceCommand::SetVolume(volume) => vec![0x02, 0x00, 0x00, volume.as_byte()],
            DeviceCommand::SetJingle(jingle) => {
                vec![0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, jingle]
            }
            DeviceCommand::SetTrackingMode(_) => return None,
        };
        Some(WriteRequest::owned(
            FINDER_SERVICE_UUID,
            FINDER_DATA1_UUID,
            data,
            true,
        ))
    }

    fn query_request(&self, query: DeviceQuery) -> Option<QueryRequest> {
        (query == DeviceQuery::FirmwareVersion).then_some(QueryRequest {
            prompt: None,
            service: DEVICE_INFO_SERVICE_UUID,
            characteristic: SOFTWARE_REVISION_UUID,
        })
    }

    fn decode_query_response(&self, query: DeviceQuery, value: &[u8]) -> Result<QueryResponse> {
        match query {
            DeviceQuery::FirmwareVersion => {
                decode_info_string(value).map(QueryResponse::FirmwareVersion)
            }
            other => Err(Error::NotSupported {
                operation: format!("{} query", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::{AdvertisementState, ButtonState, BuzzState};
    use crate::protocol::settings::{DeviceVolume, TrackingMode};

    fn payload(product: [u8; 2], status: u8, mv: u16) -> Vec<u8> {
        let mut data = vec![product[0], product[1], 0x12, 0x34, 0x56, 0x78, 0x00, status];
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&mv.to_le_bytes());
        data.push(0);
        data
    }

    #[test]
    fn test_parse_finder_advertisement() {
        let info = FinderHandler.parse_advertisement(&payload([0x0E, 0x0E], 0b0000_0100, 2600));
        assert_eq!(info.state, AdvertisementState::Low);
        assert_eq!(info.button, Some(ButtonState::None));
        assert_eq!(info.buzz, Some(BuzzState::Idle));
        assert_eq!(info.battery_percent, Some(50.0));
    }

    #[test]
    fn test_card_battery_range() {
        let info = FinderHandler.parse_advertisement(&payload([0x0E, 0x05], 0, 4200));
        assert_eq!(info.battery_percent, Some(100.0));
        assert_eq!(info.state, AdvertisementState::High);
    }

    #[test]
    fn test_short_payload_has_no_battery() {
        let data = [0x0E, 0x0E, 0x12, 0x34, 0x56, 0x78, 0x00, 0x08];
        let info = FinderHandler.parse_advertisement(&data);
        assert_eq!(info.battery_percent, None);
        assert_eq!(info.buzz, Some(BuzzState::Buzzing));
    }

    #[test]
    fn test_roles_and_writes() {
        assert_eq!(FinderHandler.role_of(&FINDER_DATA2_UUID), CharacteristicRole::Wake);
        assert_eq!(FinderHandler.role_of(&FINDER_DATA1_UUID), CharacteristicRole::Command);

        let wake = FinderHandler.wake_request().unwrap();
        assert_eq!(wake.characteristic, FINDER_DATA2_UUID);
        assert_eq!(&wake.data[..], &[0x01]);
        assert!(wake.with_response);

        assert!(FinderHandler
            .characteristics_for_service(&FINDER_SERVICE_UUID)
            .is_some());
        assert!(FinderHandler
            .characteristics_for_service(&Uuid::nil())
            .is_none());
    }

    #[test]
    fn test_command_frames() {
        let dormant = FinderHandler.command_request(&DeviceCommand::Dormant).unwrap();
        assert_eq!(dormant.characteristic, FINDER_DATA1_UUID);
        assert_eq!(&dormant.data[..], &[0x04, 0, 0, 0, 0, 0, 0x01]);

        let reboot = FinderHandler.command_request(&DeviceCommand::Reboot).unwrap();
        assert_eq!(&reboot.data[..], &[0x04, 0, 0, 0, 0, 0, 0x02]);

        let volume = FinderHandler
            .command_request(&DeviceCommand::SetVolume(DeviceVolume::Medium))
            .unwrap();
        assert_eq!(&volume.data[..], &[0x02, 0, 0, 0x02]);

        let jingle = FinderHandler.command_request(&DeviceCommand::SetJingle(8)).unwrap();
        assert_eq!(&jingle.data[..], &[0x08, 0, 0, 0, 0, 0, 0, 0x08]);

        assert!(FinderHandler
            .command_request(&DeviceCommand::SetTrackingMode(TrackingMode::Dynamic))
            .is_none());
    }

    #[test]
    fn test_firmware_query() {
        let request = FinderHandler.query_request(DeviceQuery::FirmwareVersion).unwrap();
        assert_eq!(request.prompt, None);
        assert_eq!(request.characteristic, SOFTWARE_REVISION_UUID);
        assert!(FinderHandler.query_request(DeviceQuery::ChargingStatus).is_none());

        assert_eq!(
            FinderHandler
                .decode_query_response(DeviceQuery::FirmwareVersion, b"3.0.1")
                .unwrap(),
            QueryResponse::FirmwareVersion("3.0.1".to_string())
        );
    }
}
