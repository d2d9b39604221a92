//! Host positions and region state.

use chrono::{DateTime, Utc};

use crate::utils::haversine_distance_m;

/// A host position fix delivered by the location collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, if known.
    pub horizontal_accuracy_m: Option<f64>,
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
}

impl Position {
    /// Create a position fix.
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            horizontal_accuracy_m: None,
            timestamp,
        }
    }

    /// Attach an accuracy radius.
    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.horizontal_accuracy_m = Some(meters);
        self
    }

    /// Distance in meters to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        haversine_distance_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Host state relative to a monitored region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegionState {
    /// State not determined yet.
    #[default]
    Unknown,
    /// Host is inside the region.
    Inside,
    /// Host is outside the region.
    Outside,
}

impl std::fmt::Display for RegionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Inside => write!(f, "Inside"),
            Self::Outside => write!(f, "Outside"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to() {
        let now = Utc::now();
        let a = Position::new(45.0, 7.0, now);
        let b = Position::new(45.001, 7.0, now).with_accuracy(10.0);
        assert!((a.distance_to(&b) - 111.2).abs() < 1.0);
        assert_eq!(b.horizontal_accuracy_m, Some(10.0));
    }
}
