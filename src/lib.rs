// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # finder-ble
//!
//! A Rust library for discovering and managing Bluetooth Low Energy
//! trackers: finders, cards, tags and clips.
//!
//! The core turns radio events into one typed [`DeviceSession`] per device,
//! resolves each device's hardware variant through a [`DeviceClassRegistry`],
//! and keeps rolling telemetry (RSSI, smoothed RSSI, battery, temperature,
//! location) for every known device.
//!
//! ## Features
//!
//! - **Discovery**: Scan for every supported product family
//! - **Connection lifecycle**: Connect, discover services and characteristics, reach `Ready`
//! - **Variant classification**: Capability sets composed from base profiles plus overrides
//! - **Device settings**: Volume, jingle, dormant, reboot and tracking mode commands plus firmware and charger queries
//! - **Telemetry**: Fixed-capacity history with exponential RSSI smoothing
//! - **Presence**: Caller-driven staleness checks with a presence radius
//! - **Regions and beacons**: Region monitoring and proximity broadcast via pluggable collaborators
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use finder_ble::{DeviceManager, ManagerConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create the manager over the system adapter and start scanning
//!     let manager = DeviceManager::with_btleplug(ManagerConfig::default()).await?;
//!     manager.set_scanning_enabled(true)?;
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     for device in manager.devices_by_signal() {
//!         println!(
//!             "Found {} ({}) rssi {:?}",
//!             device.display_name(),
//!             device.address,
//!             device.rssi()
//!         );
//!     }
//!
//!     manager.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without a radio
//!
//! [`MockTransport`] records every command. Feed [`RadioEvent`]s into
//! [`DeviceManager::handle_event`] to drive sessions by hand.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod region;
pub mod registry;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device_manager::{CallbackHandle, DeviceManager, DeviceUpdate, ManagerEvent};
pub use error::{Error, Result};
pub use registry::{
    BaseProfile, CapabilityOverrides, CapabilitySet, DeviceClassRegistry, DeviceKind,
    VariantDescriptor,
};
pub use session::{DeviceChange, DeviceSeed, DeviceSession, SessionUpdate};
pub use utils::{haversine_distance_m, millivolts_to_percent};

// Re-export commonly used types from submodules
pub use ble::{
    Advertisement, AdvertisementInfo, AdvertisementState, BtleplugTransport, ButtonState,
    ConnectionState, DeviceAddress, LocationEvent, MockTransport, ModelId, PlatformError,
    RadioCommand, RadioEvent, RadioOperation, RadioTransport,
};
pub use data::{DeviceRecord, Position, RegionState, TelemetryHistory, TransientFailure};
pub use protocol::{
    ChargingStatus, DeviceCommand, DeviceQuery, DeviceSettings, DeviceVolume, HandlerKind,
    ProtocolHandler, QueryResponse, TrackingMode, WriteRequest,
};
pub use region::{BeaconAdvertisement, BeaconRegion, BroadcastEmitter, RegionMonitor};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<DeviceSession>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<DeviceRecord>();
        let _ = std::any::TypeId::of::<TelemetryHistory>();
        let _ = std::any::TypeId::of::<DeviceClassRegistry>();
        let _ = std::any::TypeId::of::<ManagerConfig>();
        let _ = std::any::TypeId::of::<DeviceCommand>();
        let _ = std::any::TypeId::of::<DeviceSettings>();
    }

    #[test]
    fn test_battery_conversion() {
        assert!((millivolts_to_percent(3200, 2000, 3200) - 100.0).abs() < 0.001);
        assert!(millivolts_to_percent(1500, 2000, 3200).abs() < 0.001);
    }
}
