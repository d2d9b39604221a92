//! Data structures for device state.
//!
//! This module contains the telemetry history, host positions and the
//! device snapshot handed to observers.

pub mod history;
pub mod position;
pub mod record;

pub use history::{Reading, RollingSeries, TelemetryHistory, TemperatureReading};
pub use position::{Position, RegionState};
pub use record::{DeviceRecord, TransientFailure};
