//! MFi card, clip and tag protocol, first generation and V2.

use uuid::Uuid;

use super::{decode_battery_level, CharacteristicRole, HandlerKind, ProtocolHandler, WriteRequest};
use crate::ble::advertising::{AdvertisementInfo, BondingState, ButtonState, NetworkFlags};
use crate::ble::uuids::{
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, FINDER_DATA1_UUID, FINDER_DATA2_UUID,
    FINDER_SERVICE_UUID,
};
use crate::error::Result;

const BATTERY_OFFSET: usize = 3;
const BUTTON_OFFSET: usize = 4;
const STATUS_OFFSET: usize = 11;

/// Handler for MFi hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct MfiHandler {
    v2: bool,
}

impl MfiHandler {
    /// Handler for first-generation MFi hardware.
    pub fn v1() -> Self {
        Self { v2: false }
    }

    /// Handler for V2 hardware, which packs network flags into the status byte.
    pub fn v2() -> Self {
        Self { v2: true }
    }
}

impl ProtocolHandler for MfiHandler {
    fn kind(&self) -> HandlerKind {
        if self.v2 {
            HandlerKind::MfiV2
        } else {
            HandlerKind::Mfi
        }
    }

    fn characteristics_for_service(&self, service: &Uuid) -> Option<Vec<Uuid>> {
        match *service {
            FINDER_SERVICE_UUID => Some(vec![FINDER_DATA1_UUID, FINDER_DATA2_UUID]),
            BATTERY_SERVICE_UUID => Some(vec![BATTERY_LEVEL_UUID]),
            _ => None,
        }
    }

    fn parse_advertisement(&self, data: &[u8]) -> AdvertisementInfo {
        let mut info = AdvertisementInfo::default();

        if let Some(level) = data.get(BATTERY_OFFSET) {
            info.battery_percent = Some(f64::from((*level).min(100)));
        }
        info.button = data
            .get(BUTTON_OFFSET)
            .and_then(|code| ButtonState::from_mfi_code(*code));

        if let Some(status) = data.get(STATUS_OFFSET).copied() {
            if self.v2 {
                info.network = Some(NetworkFlags::from_status_byte(status));
                info.bonding = Some(if status & 0x01 == 0 {
                    BondingState::Bonded
                } else {
                    BondingState::Unbonded
                });
            } else {
                info.bonding = Some(BondingState::from_raw(status));
            }
        }

        info
    }

    fn role_of(&self, characteristic: &Uuid) -> CharacteristicRole {
        match *characteristic {
            FINDER_DATA1_UUID | FINDER_DATA2_UUID => CharacteristicRole::Command,
            BATTERY_LEVEL_UUID => CharacteristicRole::Battery,
            _ => CharacteristicRole::Other,
        }
    }

    fn decode_battery(&self, value: &[u8]) -> Result<f64> {
        decode_battery_level(value)
    }

    fn buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            FINDER_SERVICE_UUID,
            FINDER_DATA2_UUID,
            &[0x01],
            false,
        ))
    }

    fn stop_buzz_request(&self) -> Option<WriteRequest> {
        Some(WriteRequest::new(
            FINDER_SERVICE_UUID,
            FINDER_DATA2_UUID,
            &[0x02],
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(status: u8) -> Vec<u8> {
        vec![0x06, 0x00, 0x23, 77, 2, 1, 2, 3, 4, 5, 6, status]
    }

    #[test]
    fn test_parse_v1_advertisement() {
        let info = MfiHandler::v1().parse_advertisement(&payload(0x01));
        assert_eq!(info.battery_percent, Some(77.0));
        assert_eq!(info.button, Some(ButtonState::DoublePress));
        assert_eq!(info.bonding, Some(BondingState::Unbonded));
        assert_eq!(info.network, None);
    }

    #[test]
    fn test_parse_v2_advertisement() {
        let info = MfiHandler::v2().parse_advertisement(&payload(0b1100_0010));
        assert_eq!(info.bonding, Some(BondingState::Bonded));
        let flags = info.network.unwrap();
        assert!(flags.fmn_available);
        assert!(flags.fmd_available);
        assert!(flags.smp_unlocked);
        assert!(!flags.fmn_provisioned);
    }

    #[test]
    fn test_kind_and_writes() {
        assert_eq!(MfiHandler::v1().kind(), HandlerKind::Mfi);
        assert_eq!(MfiHandler::v2().kind(), HandlerKind::MfiV2);
        let stop = MfiHandler::v1().stop_buzz_request().unwrap();
        assert_eq!(&stop.data[..], &[0x02]);
        assert!(MfiHandler::v2().wake_request().is_none());
    }
}
