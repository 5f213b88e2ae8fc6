use crate::point::LatLon;
use serde::{Deserialize, Serialize};

/// An axis-aligned bounding rectangle over fixed-point coordinates.
///
/// The rectangle starts empty and is widened incrementally with
/// [`add_point`](LatLonRect::add_point) and
/// [`add_rect`](LatLonRect::add_rect). It also answers the two bit-level
/// questions the quadtree needs: whether a cell address overlaps the
/// rectangle, and how many leading bits the min and max of one axis share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatLonRect {
    pub lat_min: i32,
    pub lat_max: i32,
    pub lon_min: i32,
    pub lon_max: i32,
}

impl Default for LatLonRect {
    fn default() -> Self {
        Self::new()
    }
}

impl LatLonRect {
    /// Create an empty rectangle.
    pub fn new() -> Self {
        // lat_min above lat_max marks the empty state.
        Self {
            lat_min: i32::MAX,
            lat_max: i32::MIN,
            lon_min: i32::MAX,
            lon_max: i32::MIN,
        }
    }

    /// The rectangle spanning two corner points, in either order.
    pub fn from_points(a: LatLon, b: LatLon) -> Self {
        let mut rect = Self::new();
        rect.add_point(a);
        rect.add_point(b);
        rect
    }

    /// The rectangle covering the entire coordinate space.
    pub fn full() -> Self {
        Self {
            lat_min: i32::MIN,
            lat_max: i32::MAX,
            lon_min: i32::MIN,
            lon_max: i32::MAX,
        }
    }

    /// True until the first point is added.
    pub fn is_empty(&self) -> bool {
        self.lat_min > self.lat_max
    }

    /// Widen the rectangle to include `point`.
    pub fn add_point(&mut self, point: LatLon) {
        self.lat_min = self.lat_min.min(point.lat);
        self.lat_max = self.lat_max.max(point.lat);
        self.lon_min = self.lon_min.min(point.lon);
        self.lon_max = self.lon_max.max(point.lon);
    }

    /// Union with another rectangle by adding its two corner points.
    ///
    /// The corners are the extrema of `other`, so this is an exact union.
    /// An empty `other` leaves the rectangle unchanged.
    pub fn add_rect(&mut self, other: &LatLonRect) {
        if other.is_empty() {
            return;
        }
        self.add_point(LatLon::from_fixed(other.lat_min, other.lon_min));
        self.add_point(LatLon::from_fixed(other.lat_max, other.lon_max));
    }

    /// True when `point` lies inside the rectangle (borders included).
    pub fn contains(&self, point: LatLon) -> bool {
        point.lat >= self.lat_min
            && point.lat <= self.lat_max
            && point.lon >= self.lon_min
            && point.lon <= self.lon_max
    }

    /// Test whether the quadtree cell at `(cell_lat, cell_lon, mask)`
    /// intersects the rectangle.
    ///
    /// The cell covers `[cell_lat, cell_lat + !mask] x [cell_lon,
    /// cell_lon + !mask]`; the test is the usual four-way interval
    /// comparison.
    pub fn overlaps(&self, cell_lat: i32, cell_lon: i32, mask: i32) -> bool {
        if self.is_empty() {
            return false;
        }
        let lat_hi = cell_lat.wrapping_add(!mask);
        let lon_hi = cell_lon.wrapping_add(!mask);
        cell_lon <= self.lon_max
            && lon_hi >= self.lon_min
            && cell_lat <= self.lat_max
            && lat_hi >= self.lat_min
    }

    /// Longest common leading-bit run of `lat_min` and `lat_max`,
    /// returned as `(prefix bits, prefix mask)`.
    pub fn same_bits_lat(&self) -> (i32, i32) {
        same_bits(self.lat_min, self.lat_max)
    }

    /// Longest common leading-bit run of `lon_min` and `lon_max`.
    pub fn same_bits_lon(&self) -> (i32, i32) {
        same_bits(self.lon_min, self.lon_max)
    }
}

fn same_bits(min: i32, max: i32) -> (i32, i32) {
    if min == max {
        return (min, -1);
    }
    let mut mask = i32::MIN;
    // The arithmetic shift drags the sign bit down, extending the mask one
    // bit per step until min and max first disagree.
    while (min & mask) == (max & mask) {
        mask >>= 1;
    }
    mask <<= 1;
    (min & mask, mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty() {
        let rect = LatLonRect::new();
        assert!(rect.is_empty());
        assert!(!rect.contains(LatLon::from_fixed(0, 0)));
        assert!(!rect.overlaps(0, 0, 0));
    }

    #[test]
    fn test_add_point_widens() {
        let mut rect = LatLonRect::new();
        rect.add_point(LatLon::from_fixed(10, -20));
        assert_eq!((rect.lat_min, rect.lat_max), (10, 10));
        assert_eq!((rect.lon_min, rect.lon_max), (-20, -20));
        rect.add_point(LatLon::from_fixed(-30, 40));
        assert_eq!((rect.lat_min, rect.lat_max), (-30, 10));
        assert_eq!((rect.lon_min, rect.lon_max), (-20, 40));
    }

    #[test]
    fn test_add_rect_unions() {
        let a = LatLonRect::from_points(LatLon::from_fixed(0, 0), LatLon::from_fixed(10, 10));
        let mut b = LatLonRect::from_points(LatLon::from_fixed(20, -5), LatLon::from_fixed(30, 5));
        b.add_rect(&a);
        assert_eq!((b.lat_min, b.lat_max), (0, 30));
        assert_eq!((b.lon_min, b.lon_max), (-5, 10));

        // Unioning an empty rectangle is a no-op.
        let before = b;
        b.add_rect(&LatLonRect::new());
        assert_eq!(b, before);
    }

    #[test]
    fn test_overlaps_cell() {
        let rect =
            LatLonRect::from_points(LatLon::from_fixed(100, 100), LatLon::from_fixed(200, 200));
        // Depth-16 cell containing the rectangle: origin 0, extent 0xFFFF.
        let mask = ((!0u32) << 16) as i32;
        assert!(rect.overlaps(0, 0, mask));
        // Neighboring cell to the east starts past lon_max.
        assert!(!rect.overlaps(0, 0x10000, mask));
        // Cell strictly below in latitude.
        assert!(!rect.overlaps(-0x10000, 0, mask));
    }

    #[test]
    fn test_same_bits_degenerate_axis() {
        let mut rect = LatLonRect::new();
        rect.add_point(LatLon::from_fixed(12345, 7));
        let (bits, mask) = rect.same_bits_lat();
        assert_eq!(bits, 12345);
        assert_eq!(mask, -1);
    }

    #[test]
    fn test_same_bits_prefix() {
        // 0b1000 and 0b1011 share the top 30 bits.
        let rect = LatLonRect::from_points(LatLon::from_fixed(8, 0), LatLon::from_fixed(11, 0));
        let (bits, mask) = rect.same_bits_lat();
        assert_eq!(mask, !0b11);
        assert_eq!(bits, 8);
    }

    #[test]
    fn test_same_bits_sign_disagreement() {
        // Min and max differ in the sign bit: no shared prefix at all.
        let rect = LatLonRect::from_points(LatLon::from_fixed(-1, 0), LatLon::from_fixed(1, 0));
        let (bits, mask) = rect.same_bits_lat();
        assert_eq!(bits, 0);
        assert_eq!(mask, 0);
    }
}
