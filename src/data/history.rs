//! Rolling telemetry history.
//!
//! Each series is a fixed-capacity ring: once full, the oldest sample is
//! evicted for every new one.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::position::Position;

/// Number of samples kept per series by default.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Default weight given to the newest RSSI sample.
pub const DEFAULT_RSSI_SMOOTHING: f64 = 0.3;

/// A timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading<T> {
    /// Sample value.
    pub value: T,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// A temperature sample, stored both raw and with the calibration offset applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemperatureReading {
    /// Value as decoded from the device, degC.
    pub raw: i32,
    /// Raw value plus the calibration offset in effect at the time.
    pub calibrated: i32,
}

/// Fixed-capacity ordered series, oldest first.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RollingSeries<T> {
    capacity: usize,
    samples: VecDeque<Reading<T>>,
}

impl<T> RollingSeries<T> {
    /// Create an empty series. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, value: T, timestamp: DateTime<Utc>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Reading { value, timestamp });
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&Reading<T>> {
        self.samples.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Reading<T>> {
        self.samples.iter()
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the series is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl<T: Clone> RollingSeries<T> {
    /// Copy the samples out, oldest first.
    pub fn to_vec(&self) -> Vec<Reading<T>> {
        self.samples.iter().cloned().collect()
    }
}

/// Per-device telemetry history.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryHistory {
    /// Raw RSSI in dBm.
    pub rssi: RollingSeries<i16>,
    /// Weighted moving average of the RSSI.
    pub smoothed_rssi: RollingSeries<f64>,
    /// Battery level percent.
    pub battery: RollingSeries<f64>,
    /// Temperature samples.
    pub temperature: RollingSeries<TemperatureReading>,
    /// Host positions associated with observations.
    pub locations: RollingSeries<Position>,
    smoothing: f64,
}

impl TelemetryHistory {
    /// Create an empty history.
    ///
    /// `smoothing` is the weight of the newest RSSI sample, in `(0, 1]`;
    /// values outside that range are clamped.
    pub fn new(capacity: usize, smoothing: f64) -> Self {
        Self {
            rssi: RollingSeries::new(capacity),
            smoothed_rssi: RollingSeries::new(capacity),
            battery: RollingSeries::new(capacity),
            temperature: RollingSeries::new(capacity),
            locations: RollingSeries::new(capacity),
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Record a raw RSSI sample and its smoothed value. Returns the smoothed value.
    pub fn record_rssi(&mut self, rssi: i16, timestamp: DateTime<Utc>) -> f64 {
        let sample = f64::from(rssi);
        let smoothed = match self.smoothed_rssi.latest() {
            Some(prev) => self.smoothing * sample + (1.0 - self.smoothing) * prev.value,
            None => sample,
        };
        self.rssi.push(rssi, timestamp);
        self.smoothed_rssi.push(smoothed, timestamp);
        smoothed
    }

    /// Record a battery level.
    pub fn record_battery(&mut self, percent: f64, timestamp: DateTime<Utc>) {
        self.battery.push(percent, timestamp);
    }

    /// Record a raw temperature with the given calibration offset applied.
    pub fn record_temperature(
        &mut self,
        raw: i32,
        offset: i32,
        timestamp: DateTime<Utc>,
    ) -> TemperatureReading {
        let reading = TemperatureReading {
            raw,
            calibrated: raw.saturating_add(offset),
        };
        self.temperature.push(reading, timestamp);
        reading
    }

    /// Record a host position.
    pub fn record_location(&mut self, position: Position) {
        self.locations.push(position, position.timestamp);
    }

    /// Latest raw RSSI.
    pub fn latest_rssi(&self) -> Option<i16> {
        self.rssi.latest().map(|r| r.value)
    }

    /// Latest smoothed RSSI.
    pub fn latest_smoothed_rssi(&self) -> Option<f64> {
        self.smoothed_rssi.latest().map(|r| r.value)
    }

    /// Latest battery level.
    pub fn latest_battery(&self) -> Option<f64> {
        self.battery.latest().map(|r| r.value)
    }

    /// Latest temperature sample.
    pub fn latest_temperature(&self) -> Option<TemperatureReading> {
        self.temperature.latest().map(|r| r.value)
    }

    /// Empty every series.
    pub fn clear(&mut self) {
        self.rssi.clear();
        self.smoothed_rssi.clear();
        self.battery.clear();
        self.temperature.clear();
        self.locations.clear();
    }

    /// Check if every series is empty.
    pub fn is_empty(&self) -> bool {
        self.rssi.is_empty()
            && self.smoothed_rssi.is_empty()
            && self.battery.is_empty()
            && self.temperature.is_empty()
            && self.locations.is_empty()
    }
}

impl Default for TelemetryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_RSSI_SMOOTHING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rolling_eviction() {
        let now = Utc::now();
        let mut series = RollingSeries::new(3);
        for i in 0..5 {
            series.push(i, now);
        }
        let values: Vec<i32> = series.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert_eq!(series.len(), 3);
        assert_eq!(series.latest().map(|r| r.value), Some(4));
    }

    #[test]
    fn test_zero_capacity() {
        let mut series = RollingSeries::new(0);
        series.push(1u8, Utc::now());
        series.push(2u8, Utc::now());
        assert_eq!(series.capacity(), 1);
        assert_eq!(series.to_vec().len(), 1);
    }

    #[test]
    fn test_rssi_smoothing() {
        let now = Utc::now();
        let mut history = TelemetryHistory::new(10, 0.5);
        assert_eq!(history.record_rssi(-60, now), -60.0);
        assert_eq!(history.record_rssi(-80, now), -70.0);
        assert_eq!(history.record_rssi(-80, now), -75.0);
        assert_eq!(history.latest_rssi(), Some(-80));
        assert_eq!(history.smoothed_rssi.len(), 3);
    }

    #[test]
    fn test_smoothing_factor_one_tracks_raw() {
        let now = Utc::now();
        let mut history = TelemetryHistory::new(10, 1.0);
        history.record_rssi(-60, now);
        assert_eq!(history.record_rssi(-90, now), -90.0);
    }

    #[test]
    fn test_temperature_calibration() {
        let mut history = TelemetryHistory::default();
        let reading = history.record_temperature(21, -2, Utc::now());
        assert_eq!(reading, TemperatureReading { raw: 21, calibrated: 19 });
        assert_eq!(history.latest_temperature(), Some(reading));
    }

    #[test]
    fn test_clear() {
        let now = Utc::now();
        let mut history = TelemetryHistory::default();
        history.record_rssi(-50, now);
        history.record_battery(80.0, now);
        history.record_temperature(20, 0, now);
        history.record_location(Position::new(1.0, 2.0, now));
        assert!(!history.is_empty());

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.latest_smoothed_rssi(), None);
        assert_eq!(history.latest_battery(), None);
    }
}
