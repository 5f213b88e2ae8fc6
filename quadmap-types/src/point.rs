use serde::{Deserialize, Serialize};

/// Scale factor between degrees and the fixed-point representation.
///
/// One unit of the fixed-point value is 1e-7 degrees, roughly 1.1 cm of
/// latitude at the equator.
pub const DEGREE_SCALE: f64 = 10_000_000.0;

/// A geographic location in signed 32-bit fixed-point representation.
///
/// Latitude and longitude are stored as `i32` values scaled by 1e7, so the
/// full ±90/±180 degree range fits with 7 decimal digits of precision. The
/// pair packs losslessly into a single `u64` with latitude in the high
/// word, which is the form the database stores and hashes.
///
/// # Examples
///
/// ```
/// use quadmap_types::LatLon;
///
/// let p = LatLon::from_degrees(10.0, 20.0).unwrap();
/// assert_eq!(p.lat, 100_000_000);
/// assert_eq!(p.lon, 200_000_000);
/// assert_eq!(LatLon::from_packed(p.packed()), p);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LatLon {
    /// Latitude in 1e-7 degree units.
    pub lat: i32,
    /// Longitude in 1e-7 degree units.
    pub lon: i32,
}

impl LatLon {
    /// Create a location from raw fixed-point components.
    pub fn from_fixed(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Convert from degrees, rounding to the nearest fixed-point unit.
    ///
    /// Returns `None` when either component is not finite or the scaled
    /// value does not fit a signed 32-bit integer.
    pub fn from_degrees(lat: f64, lon: f64) -> Option<Self> {
        let lat = (lat * DEGREE_SCALE).round();
        let lon = (lon * DEGREE_SCALE).round();
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if lat < i32::MIN as f64
            || lat > i32::MAX as f64
            || lon < i32::MIN as f64
            || lon > i32::MAX as f64
        {
            return None;
        }
        Some(Self {
            lat: lat as i32,
            lon: lon as i32,
        })
    }

    /// Unpack a location from its 64-bit packed form.
    pub fn from_packed(packed: u64) -> Self {
        Self {
            lat: (packed >> 32) as u32 as i32,
            lon: packed as u32 as i32,
        }
    }

    /// Pack into a single `u64`: high 32 bits latitude, low 32 longitude.
    ///
    /// Both halves are bit-reinterpreted, so packing is total and lossless.
    pub fn packed(&self) -> u64 {
        ((self.lat as u32 as u64) << 32) | (self.lon as u32 as u64)
    }

    /// Latitude in degrees.
    pub fn lat_degrees(&self) -> f64 {
        self.lat as f64 / DEGREE_SCALE
    }

    /// Longitude in degrees.
    pub fn lon_degrees(&self) -> f64 {
        self.lon as f64 / DEGREE_SCALE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrees_roundtrip() {
        let cases = [
            (0.0, 0.0),
            (10.0, 20.0),
            (10.001, 20.001),
            (-5.0, 100.0),
            (90.0, 180.0),
            (-90.0, -180.0),
            (52.5200066, 13.4049540),
        ];
        for (lat, lon) in cases {
            let p = LatLon::from_degrees(lat, lon).unwrap();
            assert!((p.lat_degrees() - lat).abs() < 5e-8, "lat {lat}");
            assert!((p.lon_degrees() - lon).abs() < 5e-8, "lon {lon}");
        }
    }

    #[test]
    fn test_degrees_rounds_to_nearest() {
        // 1e-7 degrees is one fixed-point unit; half of that rounds up.
        let p = LatLon::from_degrees(0.000_000_05, -0.000_000_05).unwrap();
        assert_eq!(p.lat, 1);
        assert_eq!(p.lon, -1);
    }

    #[test]
    fn test_degrees_out_of_range() {
        assert!(LatLon::from_degrees(215.0, 0.0).is_none());
        assert!(LatLon::from_degrees(0.0, -215.0).is_none());
        assert!(LatLon::from_degrees(f64::NAN, 0.0).is_none());
        assert!(LatLon::from_degrees(0.0, f64::INFINITY).is_none());
        // The largest representable magnitude is i32::MAX units.
        assert!(LatLon::from_degrees(214.7483647, 0.0).is_some());
        assert!(LatLon::from_degrees(214.7483648, 0.0).is_none());
    }

    #[test]
    fn test_packed_roundtrip() {
        let cases = [
            LatLon::from_fixed(0, 0),
            LatLon::from_fixed(1, -1),
            LatLon::from_fixed(-1, 1),
            LatLon::from_fixed(i32::MAX, i32::MIN),
            LatLon::from_fixed(i32::MIN, i32::MAX),
            LatLon::from_fixed(900_000_000, -1_800_000_000),
        ];
        for p in cases {
            assert_eq!(LatLon::from_packed(p.packed()), p);
        }
    }

    #[test]
    fn test_packed_layout() {
        let p = LatLon::from_fixed(1, 2);
        assert_eq!(p.packed(), (1u64 << 32) | 2);
        let n = LatLon::from_fixed(-1, -1);
        assert_eq!(n.packed(), u64::MAX);
    }
}
