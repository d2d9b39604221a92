//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used to talk to finder, card, tag and clip
//! devices, plus the proximity UUIDs used for region monitoring and beacons.

use uuid::Uuid;

/// Expand a 16-bit assigned number into the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

// Standard services
/// Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid16(0x180A);
/// Software Revision String characteristic UUID (UTF-8 firmware version).
pub const SOFTWARE_REVISION_UUID: Uuid = uuid16(0x2A28);
/// Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid16(0x180F);
/// Battery Level characteristic UUID (one byte, percent).
pub const BATTERY_LEVEL_UUID: Uuid = uuid16(0x2A19);
/// Link Loss Service UUID.
pub const LINK_LOSS_SERVICE_UUID: Uuid = uuid16(0x1803);
/// Immediate Alert Service UUID.
pub const IMMEDIATE_ALERT_SERVICE_UUID: Uuid = uuid16(0x1802);
/// Alert Level characteristic UUID.
pub const ALERT_LEVEL_UUID: Uuid = uuid16(0x2A06);
/// Environmental Sensing Service UUID.
pub const ENVIRONMENTAL_SENSING_SERVICE_UUID: Uuid = uuid16(0x181A);
/// Temperature characteristic UUID (sint16, 0.01 degC).
pub const TEMPERATURE_UUID: Uuid = uuid16(0x2A6E);

// Finder family services
/// Finder Service UUID.
pub const FINDER_SERVICE_UUID: Uuid = uuid16(0xFA25);
/// Finder data characteristic 1 (commands).
pub const FINDER_DATA1_UUID: Uuid = uuid16(0x2C01);
/// Finder data characteristic 2 (wake / disconnect, MFi commands).
pub const FINDER_DATA2_UUID: Uuid = uuid16(0x2C02);
/// Found (cellular) Service UUID.
pub const FOUND_SERVICE_UUID: Uuid = uuid16(0xFA26);
/// Found data characteristic 3.
pub const FOUND_DATA3_UUID: Uuid = uuid16(0x2C06);
/// Found debug mode characteristic.
pub const FOUND_DEBUG_MODE_UUID: Uuid = uuid16(0x3C01);
/// Location beacon Service UUID.
pub const LOCATION_BEACON_SERVICE_UUID: Uuid = uuid16(0xFB25);
/// R4K tag Service UUID.
pub const R4K_TAG_SERVICE_UUID: Uuid = uuid16(0xFCC7);
/// Stone Service UUID.
pub const STONE_SERVICE_UUID: Uuid = uuid16(0x8888);

/// Secure management protocol Service UUID (V2 hardware).
pub const SMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8d53dc1d_1db7_4cd3_868b_8a527460aa84);

// Proprietary temperature service on Honey devices
/// Proprietary temperature Service UUID.
pub const PROPRIETARY_TEMPERATURE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000ab04_d105_11e1_9b23_00025b00a5a5);
/// Proprietary temperature characteristic UUID (signed byte, degC).
pub const PROPRIETARY_TEMPERATURE_UUID: Uuid =
    Uuid::from_u128(0x0000ab07_d108_11e1_9b23_00025b00a5a5);

// Region monitoring proximity UUIDs
/// Stone region proximity UUID.
pub const STONE_REGION_UUID: Uuid = Uuid::from_u128(0xd149cb95_f212_4a20_8a17_e3a2f508c1ff);
/// Finder tracking region proximity UUID.
pub const FINDER_REGION_UUID: Uuid = Uuid::from_u128(0xd149cb95_f212_4a20_8a17_e3a2f508c1aa);
/// Per-device motion region proximity UUID.
pub const MOTION_REGION_UUID: Uuid = Uuid::from_u128(0xd149cb95_f212_4a20_8a17_e3a2f508c1ee);
/// Button / input event region proximity UUID.
pub const INPUT_REGION_UUID: Uuid = Uuid::from_u128(0xd149cb95_f212_4a20_8a17_e3a2f508c1cc);

/// Proximity UUID emitted by the host when acting as a beacon.
pub const PROXIMITY_BEACON_UUID: Uuid = Uuid::from_u128(0xbeefbeef_cafe_cafe_dead_deadbeefcafe);

/// Services worth scanning for. Devices outside this list are not tracked.
pub fn default_scan_services() -> Vec<Uuid> {
    vec![
        FINDER_SERVICE_UUID,
        R4K_TAG_SERVICE_UUID,
        SMP_SERVICE_UUID,
        STONE_SERVICE_UUID,
        PROPRIETARY_TEMPERATURE_SERVICE_UUID,
        LINK_LOSS_SERVICE_UUID,
        IMMEDIATE_ALERT_SERVICE_UUID,
        LOCATION_BEACON_SERVICE_UUID,
    ]
}

/// Check if a service UUID belongs to the finder family.
pub fn is_finder_family_service(uuid: &Uuid) -> bool {
    *uuid == FINDER_SERVICE_UUID
        || *uuid == FOUND_SERVICE_UUID
        || *uuid == R4K_TAG_SERVICE_UUID
        || *uuid == LOCATION_BEACON_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid16_expansion() {
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FINDER_DATA2_UUID.to_string(),
            "00002c02-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            MOTION_REGION_UUID.to_string(),
            "d149cb95-f212-4a20-8a17-e3a2f508c1ee"
        );
        assert_eq!(
            SMP_SERVICE_UUID.to_string(),
            "8d53dc1d-1db7-4cd3-868b-8a527460aa84"
        );
    }

    #[test]
    fn test_finder_family() {
        assert!(is_finder_family_service(&FINDER_SERVICE_UUID));
        assert!(is_finder_family_service(&FOUND_SERVICE_UUID));
        assert!(!is_finder_family_service(&BATTERY_SERVICE_UUID));
        assert!(default_scan_services().contains(&FINDER_SERVICE_UUID));
    }
}
