//! Manager configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::default_scan_services;
use crate::data::history::{DEFAULT_HISTORY_CAPACITY, DEFAULT_RSSI_SMOOTHING};
use crate::error::{Error, Result};

/// Radius within which a device whose advertisements stopped is still
/// assumed to be with the host.
pub const DEFAULT_PRESENCE_RADIUS_M: f64 = 150.0;

/// How recently a device must have been seen for a host position to be
/// attributed to it.
pub const DEFAULT_RECENT_SIGHTING_WINDOW: Duration = Duration::from_secs(70);

/// Platform limit on concurrently monitored regions.
pub const DEFAULT_MAX_MONITORED_REGIONS: usize = 20;

/// Tunables for [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Samples kept per telemetry series.
    pub history_capacity: usize,
    /// Weight of the newest RSSI sample in the smoothed series, in `(0, 1]`.
    pub rssi_smoothing_factor: f64,
    /// Stale timeout applied to every device; `None` uses each variant's own.
    pub stale_timeout: Option<Duration>,
    /// Presence radius in meters.
    pub presence_radius_m: f64,
    /// Window for attributing host positions to in-range devices.
    pub recent_sighting_window: Duration,
    /// Maximum number of per-device regions.
    pub max_monitored_regions: usize,
    /// Capacity of each notification channel.
    pub notification_capacity: usize,
    /// Re-applications of the region configuration after a monitoring failure.
    pub region_retry_limit: u32,
    /// Services passed to the radio as the scan filter.
    pub scan_services: Vec<Uuid>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            rssi_smoothing_factor: DEFAULT_RSSI_SMOOTHING,
            stale_timeout: None,
            presence_radius_m: DEFAULT_PRESENCE_RADIUS_M,
            recent_sighting_window: DEFAULT_RECENT_SIGHTING_WINDOW,
            max_monitored_regions: DEFAULT_MAX_MONITORED_REGIONS,
            notification_capacity: 64,
            region_retry_limit: 2,
            scan_services: default_scan_services(),
        }
    }
}

impl ManagerConfig {
    /// Set the history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the RSSI smoothing factor.
    pub fn with_rssi_smoothing(mut self, factor: f64) -> Self {
        self.rssi_smoothing_factor = factor;
        self
    }

    /// Use one stale timeout for every device.
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    /// Set the presence radius.
    pub fn with_presence_radius(mut self, meters: f64) -> Self {
        self.presence_radius_m = meters;
        self
    }

    /// Set the region limit.
    pub fn with_max_monitored_regions(mut self, max: usize) -> Self {
        self.max_monitored_regions = max;
        self
    }

    /// Set the scan filter.
    pub fn with_scan_services(mut self, services: Vec<Uuid>) -> Self {
        self.scan_services = services;
        self
    }

    /// Check the configuration for values the manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "history_capacity".to_string(),
                value: self.history_capacity.to_string(),
            });
        }
        if !(self.rssi_smoothing_factor > 0.0 && self.rssi_smoothing_factor <= 1.0) {
            return Err(Error::InvalidParameter {
                name: "rssi_smoothing_factor".to_string(),
                value: self.rssi_smoothing_factor.to_string(),
            });
        }
        if self.presence_radius_m.is_nan() || self.presence_radius_m < 0.0 {
            return Err(Error::InvalidParameter {
                name: "presence_radius_m".to_string(),
                value: self.presence_radius_m.to_string(),
            });
        }
        if self.notification_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "notification_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.presence_radius_m, 150.0);
        assert_eq!(config.recent_sighting_window, Duration::from_secs(70));
    }

    #[test]
    fn test_rejects_bad_smoothing() {
        assert!(ManagerConfig::default().with_rssi_smoothing(0.0).validate().is_err());
        assert!(ManagerConfig::default().with_rssi_smoothing(1.5).validate().is_err());
        assert!(ManagerConfig::default()
            .with_rssi_smoothing(f64::NAN)
            .validate()
            .is_err());
        assert!(ManagerConfig::default().with_rssi_smoothing(1.0).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = ManagerConfig::default()
            .with_history_capacity(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }
}
