//! Positions, bounding boxes, and spherical distance math.
//!
//! A `Position` follows GeoJSON axis order internally: `x` is longitude,
//! `y` is latitude, `z` is an optional elevation (0 when absent). The wire
//! protocol is lat-first (`POINT lat lon`), so command parsing converts at
//! the boundary.

use crate::protocol::format_float;

/// Mean radius of the earth in meters, used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Coordinate tolerance in degrees for coincidence and on-segment tests.
const COORD_EPSILON: f64 = 1e-9;

/// A single coordinate. `x` = longitude, `y` = latitude.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Builds a position from latitude/longitude command arguments.
    pub fn from_latlon(lat: f64, lon: f64) -> Self {
        Self { x: lon, y: lat, z: 0.0 }
    }

    pub fn lat(&self) -> f64 {
        self.y
    }

    pub fn lon(&self) -> f64 {
        self.x
    }

    /// Great-circle distance to another position in meters (haversine).
    pub fn distance_to(&self, other: &Position) -> f64 {
        haversine(self.y, self.x, other.y, other.x)
    }

    /// True when two positions are effectively the same coordinate.
    /// The tolerance is far below any real GPS precision.
    pub fn approx_eq(&self, other: &Position) -> bool {
        (self.x - other.x).abs() <= COORD_EPSILON && (self.y - other.y).abs() <= COORD_EPSILON
    }

    /// JSON fragment in the external (lat/lon keyed) form:
    /// `{"lat":33.5,"lon":-112.1}` with `"z"` appended when nonzero.
    pub fn external_json(&self) -> String {
        let mut s = format!(
            r#"{{"lat":{},"lon":{}"#,
            format_float(self.y),
            format_float(self.x)
        );
        if self.z != 0.0 {
            s.push_str(&format!(r#","z":{}"#, format_float(self.z)));
        }
        s.push('}');
        s
    }
}

/// Great-circle distance in meters between two lat/lon pairs.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (rlat1, rlat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + rlat1.cos() * rlat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub min: Position,
    pub max: Position,
}

impl BBox {
    pub fn new(min: Position, max: Position) -> Self {
        Self { min, max }
    }

    /// A bbox covering a single position.
    pub fn from_position(p: Position) -> Self {
        Self { min: p, max: p }
    }

    /// Builds a bbox from lat/lon command arguments
    /// (`BOUNDS minLat minLon maxLat maxLon`).
    pub fn from_latlon_bounds(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min: Position::from_latlon(min_lat, min_lon),
            max: Position::from_latlon(max_lat, max_lon),
        }
    }

    /// The center of the box.
    pub fn center(&self) -> Position {
        Position::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        )
    }

    /// Grows the box to cover `p`.
    pub fn expand(&mut self, p: Position) {
        if p.x < self.min.x {
            self.min.x = p.x;
        }
        if p.y < self.min.y {
            self.min.y = p.y;
        }
        if p.z < self.min.z {
            self.min.z = p.z;
        }
        if p.x > self.max.x {
            self.max.x = p.x;
        }
        if p.y > self.max.y {
            self.max.y = p.y;
        }
        if p.z > self.max.z {
            self.max.z = p.z;
        }
    }

    /// Grows the box to cover another box.
    pub fn union(&mut self, other: &BBox) {
        self.expand(other.min);
        self.expand(other.max);
    }

    pub fn contains_position(&self, p: &Position) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// True when `other` lies entirely inside this box.
    pub fn contains_bbox(&self, other: &BBox) -> bool {
        self.contains_position(&other.min) && self.contains_position(&other.max)
    }

    /// True when the two boxes overlap at all.
    pub fn intersects_bbox(&self, other: &BBox) -> bool {
        !(other.min.x > self.max.x
            || other.max.x < self.min.x
            || other.min.y > self.max.y
            || other.max.y < self.min.y)
    }

    /// JSON fragment in the external (sw/ne keyed) form.
    pub fn external_json(&self) -> String {
        format!(
            r#"{{"sw":{},"ne":{}}}"#,
            self.min.external_json(),
            self.max.external_json()
        )
    }
}

/// Ray-casting point-in-ring test. The ring may be open or closed.
pub fn point_in_ring(p: &Position, ring: &[Position]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (pi, pj) = (&ring[i], &ring[j]);
        if (pi.y > p.y) != (pj.y > p.y)
            && p.x < (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Point-in-polygon: inside the outer ring, outside every hole.
pub fn point_in_polygon(p: &Position, rings: &[Vec<Position>]) -> bool {
    match rings.first() {
        Some(outer) if point_in_ring(p, outer) => {
            !rings[1..].iter().any(|hole| point_in_ring(p, hole))
        }
        _ => false,
    }
}

/// True when `p` lies on the segment `a`–`b` (endpoints included).
pub fn point_on_segment(p: &Position, a: &Position, b: &Position) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let scale = (b.x - a.x).abs().max((b.y - a.y).abs()).max(1.0);
    if cross.abs() > COORD_EPSILON * scale {
        return false;
    }
    p.x >= a.x.min(b.x) - COORD_EPSILON
        && p.x <= a.x.max(b.x) + COORD_EPSILON
        && p.y >= a.y.min(b.y) - COORD_EPSILON
        && p.y <= a.y.max(b.y) + COORD_EPSILON
}

/// True when segments `a1`–`a2` and `b1`–`b2` touch or cross, collinear
/// overlap included.
pub fn segments_intersect(a1: &Position, a2: &Position, b1: &Position, b2: &Position) -> bool {
    fn orient(a: &Position, b: &Position, c: &Position) -> f64 {
        (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
    }
    let d1 = orient(b1, b2, a1);
    let d2 = orient(b1, b2, a2);
    let d3 = orient(a1, a2, b1);
    let d4 = orient(a1, a2, b2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    // endpoint touches and collinear overlap
    point_on_segment(a1, b1, b2)
        || point_on_segment(a2, b1, b2)
        || point_on_segment(b1, a1, a2)
        || point_on_segment(b2, a1, a2)
}

/// Converts a slippy-map tile (`TILE x y z`) into a lat/lon bounding box.
pub fn tile_to_bbox(x: u32, y: u32, z: u32) -> BBox {
    let n = 2f64.powi(z as i32);
    let lon_min = x as f64 / n * 360.0 - 180.0;
    let lon_max = (x + 1) as f64 / n * 360.0 - 180.0;
    let lat_rad = |yy: f64| (std::f64::consts::PI * (1.0 - 2.0 * yy / n)).sinh().atan();
    let lat_max = lat_rad(y as f64).to_degrees();
    let lat_min = lat_rad((y + 1) as f64).to_degrees();
    BBox::from_latlon_bounds(lat_min, lon_min, lat_max, lon_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Phoenix to Tempe is roughly 15km
        let d = haversine(33.4484, -112.0740, 33.4255, -111.9400);
        assert!(d > 12_000.0 && d < 16_000.0, "distance was {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn test_bbox_contains() {
        let b = BBox::from_latlon_bounds(0.0, 0.0, 10.0, 10.0);
        assert!(b.contains_position(&Position::from_latlon(5.0, 5.0)));
        assert!(!b.contains_position(&Position::from_latlon(11.0, 5.0)));
    }

    #[test]
    fn test_bbox_intersects() {
        let a = BBox::from_latlon_bounds(0.0, 0.0, 10.0, 10.0);
        let b = BBox::from_latlon_bounds(5.0, 5.0, 15.0, 15.0);
        let c = BBox::from_latlon_bounds(20.0, 20.0, 30.0, 30.0);
        assert!(a.intersects_bbox(&b));
        assert!(b.intersects_bbox(&a));
        assert!(!a.intersects_bbox(&c));
    }

    #[test]
    fn test_bbox_expand() {
        let mut b = BBox::from_position(Position::from_latlon(5.0, 5.0));
        b.expand(Position::from_latlon(1.0, 9.0));
        assert_eq!(b.min.y, 1.0);
        assert_eq!(b.max.x, 9.0);
        assert_eq!(b.max.y, 5.0);
    }

    #[test]
    fn test_point_in_ring() {
        let ring = vec![
            Position::new(0.0, 0.0, 0.0),
            Position::new(10.0, 0.0, 0.0),
            Position::new(10.0, 10.0, 0.0),
            Position::new(0.0, 10.0, 0.0),
        ];
        assert!(point_in_ring(&Position::new(5.0, 5.0, 0.0), &ring));
        assert!(!point_in_ring(&Position::new(15.0, 5.0, 0.0), &ring));
    }

    #[test]
    fn test_point_in_polygon_with_hole() {
        let rings = vec![
            vec![
                Position::new(0.0, 0.0, 0.0),
                Position::new(10.0, 0.0, 0.0),
                Position::new(10.0, 10.0, 0.0),
                Position::new(0.0, 10.0, 0.0),
            ],
            vec![
                Position::new(4.0, 4.0, 0.0),
                Position::new(6.0, 4.0, 0.0),
                Position::new(6.0, 6.0, 0.0),
                Position::new(4.0, 6.0, 0.0),
            ],
        ];
        assert!(point_in_polygon(&Position::new(2.0, 2.0, 0.0), &rings));
        assert!(!point_in_polygon(&Position::new(5.0, 5.0, 0.0), &rings));
    }

    #[test]
    fn test_point_on_segment() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(10.0, 10.0, 0.0);
        assert!(point_on_segment(&Position::new(5.0, 5.0, 0.0), &a, &b));
        assert!(point_on_segment(&a, &a, &b));
        assert!(point_on_segment(&b, &a, &b));
        // collinear but past the end
        assert!(!point_on_segment(&Position::new(11.0, 11.0, 0.0), &a, &b));
        // inside the bbox but off the line
        assert!(!point_on_segment(&Position::new(5.0, 2.0, 0.0), &a, &b));
    }

    #[test]
    fn test_segments_intersect() {
        let p = |x: f64, y: f64| Position::new(x, y, 0.0);
        // plain crossing
        assert!(segments_intersect(&p(0.0, 0.0), &p(10.0, 10.0), &p(0.0, 10.0), &p(10.0, 0.0)));
        // endpoint touch
        assert!(segments_intersect(&p(0.0, 0.0), &p(5.0, 5.0), &p(5.0, 5.0), &p(9.0, 0.0)));
        // collinear overlap
        assert!(segments_intersect(&p(0.0, 0.0), &p(10.0, 0.0), &p(4.0, 0.0), &p(14.0, 0.0)));
        // parallel, never touching
        assert!(!segments_intersect(&p(0.0, 0.0), &p(10.0, 0.0), &p(0.0, 1.0), &p(10.0, 1.0)));
        // crossing lines, but the segments stop short
        assert!(!segments_intersect(&p(0.0, 0.0), &p(1.0, 1.0), &p(0.0, 10.0), &p(10.0, 0.0)));
    }

    #[test]
    fn test_approx_eq() {
        let a = Position::new(1.0, 2.0, 0.0);
        assert!(a.approx_eq(&Position::new(1.0, 2.0, 5.0)));
        assert!(!a.approx_eq(&Position::new(1.0001, 2.0, 0.0)));
    }

    #[test]
    fn test_tile_to_bbox() {
        // the whole world at zoom 0
        let b = tile_to_bbox(0, 0, 0);
        assert!((b.min.x - -180.0).abs() < 1e-9);
        assert!((b.max.x - 180.0).abs() < 1e-9);
        assert!(b.min.y < -85.0 && b.max.y > 85.0);
    }

    #[test]
    fn test_external_json() {
        let p = Position::from_latlon(33.5, -112.1);
        assert_eq!(p.external_json(), r#"{"lat":33.5,"lon":-112.1}"#);
    }
}
