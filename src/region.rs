//! Region monitoring and beacon emission collaborators.
//!
//! Both are thin pass-throughs to platform subsystems. The manager decides
//! which regions should be active and relays only the differences.

use std::collections::BTreeSet;
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::uuids::{FINDER_REGION_UUID, INPUT_REGION_UUID, MOTION_REGION_UUID, PROXIMITY_BEACON_UUID};
use crate::error::Result;

/// Identifier of the always-on finder tracking region.
pub const FINDER_TRACKING_REGION_ID: &str = "finder-tracking";
/// Identifier of the always-on input event region.
pub const INPUT_EVENT_REGION_ID: &str = "input-events";

/// A beacon region handed to the platform geofencing subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BeaconRegion {
    /// Identifier reported back in region events.
    pub identifier: String,
    /// Proximity UUID.
    pub proximity_uuid: Uuid,
    /// Major value; `None` matches any.
    pub major: Option<u16>,
    /// Minor value; `None` matches any.
    pub minor: Option<u16>,
}

impl BeaconRegion {
    /// Motion region for one device, keyed by its address.
    pub fn for_device(address: &DeviceAddress) -> Self {
        let (major, minor) = address.beacon_major_minor();
        Self {
            identifier: address.to_string(),
            proximity_uuid: MOTION_REGION_UUID,
            major: Some(major),
            minor: Some(minor),
        }
    }

    /// Region matching any finder.
    pub fn finder_tracking() -> Self {
        Self {
            identifier: FINDER_TRACKING_REGION_ID.to_string(),
            proximity_uuid: FINDER_REGION_UUID,
            major: None,
            minor: None,
        }
    }

    /// Region matching button events from any device.
    pub fn input_events() -> Self {
        Self {
            identifier: INPUT_EVENT_REGION_ID.to_string(),
            proximity_uuid: INPUT_REGION_UUID,
            major: None,
            minor: None,
        }
    }

    /// Full region set for a list of device identities.
    pub fn plan(devices: &BTreeSet<DeviceAddress>) -> BTreeSet<Self> {
        let mut regions: BTreeSet<Self> = devices.iter().map(Self::for_device).collect();
        regions.insert(Self::finder_tracking());
        regions.insert(Self::input_events());
        regions
    }
}

/// Platform geofencing subsystem.
#[cfg_attr(test, mockall::automock)]
pub trait RegionMonitor: Send + Sync {
    /// Begin monitoring a region.
    fn start_monitoring(&self, region: &BeaconRegion) -> Result<()>;

    /// Stop monitoring a region.
    fn stop_monitoring(&self, region: &BeaconRegion) -> Result<()>;
}

/// Beacon the host broadcasts so nearby devices can detect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BeaconAdvertisement {
    /// Proximity UUID.
    pub proximity_uuid: Uuid,
    /// Major value.
    pub major: u16,
    /// Minor value.
    pub minor: u16,
}

impl BeaconAdvertisement {
    /// Proximity beacon addressed to one device.
    pub fn for_device(address: &DeviceAddress) -> Self {
        let (major, minor) = address.beacon_major_minor();
        Self {
            proximity_uuid: PROXIMITY_BEACON_UUID,
            major,
            minor,
        }
    }
}

/// Platform beacon transmitter.
#[cfg_attr(test, mockall::automock)]
pub trait BroadcastEmitter: Send + Sync {
    /// Start (or replace) the host beacon.
    fn start_advertising(&self, beacon: &BeaconAdvertisement) -> Result<()>;

    /// Stop the host beacon.
    fn stop_advertising(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_region_for_device() {
        let address: DeviceAddress = "0E0E12345678".parse().unwrap();
        let region = BeaconRegion::for_device(&address);
        assert_eq!(region.major, Some(0x1234));
        assert_eq!(region.minor, Some(0x5678));
        assert_eq!(region.proximity_uuid, MOTION_REGION_UUID);
        assert_eq!(region.identifier, "0E:0E:12:34:56:78");
    }

    #[test]
    fn test_plan_includes_fixed_regions() {
        let mut devices = BTreeSet::new();
        devices.insert("0E0E12345678".parse::<DeviceAddress>().unwrap());
        devices.insert("0E0E12345679".parse::<DeviceAddress>().unwrap());

        let regions = BeaconRegion::plan(&devices);
        assert_eq!(regions.len(), 4);
        assert!(regions.contains(&BeaconRegion::finder_tracking()));
        assert!(regions.contains(&BeaconRegion::input_events()));

        assert_eq!(BeaconRegion::plan(&BTreeSet::new()).len(), 2);
    }

    #[test]
    fn test_beacon_for_device() {
        let address: DeviceAddress = "AABB00010002".parse().unwrap();
        let beacon = BeaconAdvertisement::for_device(&address);
        assert_eq!((beacon.major, beacon.minor), (1, 2));
        assert_eq!(beacon.proximity_uuid, PROXIMITY_BEACON_UUID);
    }
}
