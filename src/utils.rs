//! Utility functions for the finder-ble crate.

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Convert a battery voltage to a percentage of the usable range.
///
/// # Arguments
///
/// * `millivolts` - Measured battery voltage
/// * `min_mv` - Voltage treated as empty
/// * `max_mv` - Voltage treated as full
///
/// # Example
///
/// ```
/// use finder_ble::millivolts_to_percent;
///
/// assert_eq!(millivolts_to_percent(2600, 2000, 3200), 50.0);
/// assert_eq!(millivolts_to_percent(3500, 2000, 3200), 100.0);
/// ```
pub fn millivolts_to_percent(millivolts: u16, min_mv: u16, max_mv: u16) -> f64 {
    if max_mv <= min_mv {
        return 0.0;
    }
    let span = f64::from(max_mv - min_mv);
    let level = (f64::from(millivolts) - f64::from(min_mv)) / span * 100.0;
    level.clamp(0.0, 100.0)
}

/// Great-circle distance in meters between two coordinates in degrees.
///
/// # Example
///
/// ```
/// use finder_ble::haversine_distance_m;
///
/// let d = haversine_distance_m(51.5007, -0.1246, 40.6892, -74.0445);
/// assert!((d - 5_574_840.0).abs() < 5_000.0);
/// ```
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}
