//! The stored object model.
//!
//! Every item in a collection is one `Object`: a bare point set by
//! `SET … POINT`, a raw string set by `SET … STRING`, or a parsed GeoJSON
//! geometry set by `SET … OBJECT`. The controller treats objects as opaque
//! values with bounding boxes and spatial predicates; all geometry math
//! lives here.
//!
//! Axis order note: GeoJSON coordinates are `[lon, lat, z?]`, while the
//! command surface is lat-first. Conversion happens in the command parser;
//! everything in this module is GeoJSON order.

use crate::geojson::geohash::{self, GeohashError};
use crate::geojson::position::{
    point_in_polygon, point_on_segment, segments_intersect, BBox, Position,
};
use crate::protocol::format_float;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while parsing GeoJSON input.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoJsonError {
    #[error("invalid geojson: {0}")]
    Invalid(String),

    #[error("unknown geojson type: {0}")]
    UnknownType(String),

    #[error("missing geojson member: {0}")]
    MissingMember(&'static str),
}

/// A stored object: geometry, string, or simple point.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// A bare lat/lon point (`SET … POINT lat lon`). Cheaper than a full
    /// GeoJSON point and by far the most common object in a fleet workload.
    SimplePoint(Position),

    /// An uninterpreted string value (`SET … STRING value`). Strings have
    /// no geometry: every spatial predicate is false.
    Str(String),

    Point {
        pos: Position,
        bbox: Option<BBox>,
    },
    MultiPoint {
        points: Vec<Position>,
        bbox: Option<BBox>,
    },
    LineString {
        points: Vec<Position>,
        bbox: Option<BBox>,
    },
    MultiLineString {
        lines: Vec<Vec<Position>>,
        bbox: Option<BBox>,
    },
    Polygon {
        rings: Vec<Vec<Position>>,
        bbox: Option<BBox>,
    },
    MultiPolygon {
        polygons: Vec<Vec<Vec<Position>>>,
        bbox: Option<BBox>,
    },
    GeometryCollection {
        geometries: Vec<Object>,
        bbox: Option<BBox>,
    },
    Feature {
        geometry: Box<Object>,
        properties: Value,
        id: Option<Value>,
        bbox: Option<BBox>,
    },
    FeatureCollection {
        features: Vec<Object>,
        bbox: Option<BBox>,
    },
}

impl Object {
    /// Parses a GeoJSON document.
    pub fn parse_json(s: &str) -> Result<Object, GeoJsonError> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| GeoJsonError::Invalid(e.to_string()))?;
        Self::from_value(&value)
    }

    fn from_value(v: &Value) -> Result<Object, GeoJsonError> {
        let typ = v
            .get("type")
            .and_then(Value::as_str)
            .ok_or(GeoJsonError::MissingMember("type"))?;
        let bbox = parse_bbox_member(v)?;
        match typ {
            "Point" => Ok(Object::Point {
                pos: parse_position(coordinates(v)?)?,
                bbox,
            }),
            "MultiPoint" => Ok(Object::MultiPoint {
                points: parse_positions(coordinates(v)?)?,
                bbox,
            }),
            "LineString" => {
                let points = parse_positions(coordinates(v)?)?;
                if points.len() < 2 {
                    return Err(GeoJsonError::Invalid(
                        "linestring must have at least two positions".to_string(),
                    ));
                }
                Ok(Object::LineString { points, bbox })
            }
            "MultiLineString" => Ok(Object::MultiLineString {
                lines: parse_position_groups(coordinates(v)?)?,
                bbox,
            }),
            "Polygon" => {
                let rings = parse_position_groups(coordinates(v)?)?;
                if rings.is_empty() {
                    return Err(GeoJsonError::Invalid(
                        "polygon must have at least one ring".to_string(),
                    ));
                }
                Ok(Object::Polygon { rings, bbox })
            }
            "MultiPolygon" => {
                let arr = coordinates(v)?
                    .as_array()
                    .ok_or(GeoJsonError::Invalid("coordinates must be an array".to_string()))?;
                let polygons = arr
                    .iter()
                    .map(parse_position_groups)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Object::MultiPolygon { polygons, bbox })
            }
            "GeometryCollection" => {
                let arr = v
                    .get("geometries")
                    .and_then(Value::as_array)
                    .ok_or(GeoJsonError::MissingMember("geometries"))?;
                let geometries = arr
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Object::GeometryCollection { geometries, bbox })
            }
            "Feature" => {
                let geometry = v
                    .get("geometry")
                    .ok_or(GeoJsonError::MissingMember("geometry"))?;
                Ok(Object::Feature {
                    geometry: Box::new(Self::from_value(geometry)?),
                    properties: v.get("properties").cloned().unwrap_or(Value::Null),
                    id: v.get("id").cloned(),
                    bbox,
                })
            }
            "FeatureCollection" => {
                let arr = v
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or(GeoJsonError::MissingMember("features"))?;
                let features = arr
                    .iter()
                    .map(Self::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Object::FeatureCollection { features, bbox })
            }
            other => Err(GeoJsonError::UnknownType(other.to_string())),
        }
    }

    /// True for anything that participates in spatial search.
    pub fn is_geometry(&self) -> bool {
        !matches!(self, Object::Str(_))
    }

    /// Stable JSON serialization: GeoJSON for geometry, a JSON string for
    /// string objects.
    pub fn json(&self) -> String {
        match self {
            Object::Str(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()),
            Object::SimplePoint(p) => format!(
                r#"{{"type":"Point","coordinates":{}}}"#,
                position_json(p)
            ),
            Object::Point { pos, bbox } => format!(
                r#"{{"type":"Point","coordinates":{}{}}}"#,
                position_json(pos),
                bbox_json(bbox)
            ),
            Object::MultiPoint { points, bbox } => format!(
                r#"{{"type":"MultiPoint","coordinates":{}{}}}"#,
                positions_json(points),
                bbox_json(bbox)
            ),
            Object::LineString { points, bbox } => format!(
                r#"{{"type":"LineString","coordinates":{}{}}}"#,
                positions_json(points),
                bbox_json(bbox)
            ),
            Object::MultiLineString { lines, bbox } => format!(
                r#"{{"type":"MultiLineString","coordinates":{}{}}}"#,
                position_groups_json(lines),
                bbox_json(bbox)
            ),
            Object::Polygon { rings, bbox } => format!(
                r#"{{"type":"Polygon","coordinates":{}{}}}"#,
                position_groups_json(rings),
                bbox_json(bbox)
            ),
            Object::MultiPolygon { polygons, bbox } => {
                let body = polygons
                    .iter()
                    .map(|rings| position_groups_json(rings))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    r#"{{"type":"MultiPolygon","coordinates":[{}]{}}}"#,
                    body,
                    bbox_json(bbox)
                )
            }
            Object::GeometryCollection { geometries, bbox } => {
                let body = geometries
                    .iter()
                    .map(Object::json)
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    r#"{{"type":"GeometryCollection","geometries":[{}]{}}}"#,
                    body,
                    bbox_json(bbox)
                )
            }
            Object::Feature {
                geometry,
                properties,
                id,
                bbox,
            } => {
                let mut s = format!(
                    r#"{{"type":"Feature","geometry":{},"properties":{}"#,
                    geometry.json(),
                    properties
                );
                if let Some(id) = id {
                    s.push_str(&format!(r#","id":{}"#, id));
                }
                s.push_str(&bbox_json(bbox));
                s.push('}');
                s
            }
            Object::FeatureCollection { features, bbox } => {
                let body = features
                    .iter()
                    .map(Object::json)
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    r#"{{"type":"FeatureCollection","features":[{}]{}}}"#,
                    body,
                    bbox_json(bbox)
                )
            }
        }
    }

    /// Human/text form: raw value for strings, GeoJSON otherwise. This is
    /// what RESP responses and `MATCH` value comparisons use.
    pub fn text(&self) -> String {
        match self {
            Object::Str(s) => s.clone(),
            other => other.json(),
        }
    }

    /// Visits every position in the object.
    pub fn foreach_position(&self, f: &mut impl FnMut(&Position)) {
        match self {
            Object::Str(_) => {}
            Object::SimplePoint(p) | Object::Point { pos: p, .. } => f(p),
            Object::MultiPoint { points, .. } | Object::LineString { points, .. } => {
                points.iter().for_each(|p| f(p))
            }
            Object::MultiLineString { lines, .. } => {
                lines.iter().flatten().for_each(|p| f(p))
            }
            Object::Polygon { rings, .. } => rings.iter().flatten().for_each(|p| f(p)),
            Object::MultiPolygon { polygons, .. } => polygons
                .iter()
                .flatten()
                .flatten()
                .for_each(|p| f(p)),
            Object::GeometryCollection { geometries, .. } => geometries
                .iter()
                .for_each(|g| g.foreach_position(f)),
            Object::Feature { geometry, .. } => geometry.foreach_position(f),
            Object::FeatureCollection { features, .. } => {
                features.iter().for_each(|g| g.foreach_position(f))
            }
        }
    }

    /// Visits every line segment in the object: consecutive linestring
    /// points and polygon ring edges (closing edge included). Point types
    /// have none.
    pub fn foreach_segment(&self, f: &mut impl FnMut(&Position, &Position)) {
        match self {
            Object::LineString { points, .. } => {
                for pair in points.windows(2) {
                    f(&pair[0], &pair[1]);
                }
            }
            Object::MultiLineString { lines, .. } => {
                for line in lines {
                    for pair in line.windows(2) {
                        f(&pair[0], &pair[1]);
                    }
                }
            }
            Object::Polygon { rings, .. } => {
                for ring in rings {
                    ring_segments(ring, f);
                }
            }
            Object::MultiPolygon { polygons, .. } => {
                for rings in polygons {
                    for ring in rings {
                        ring_segments(ring, f);
                    }
                }
            }
            Object::GeometryCollection { geometries, .. } => {
                geometries.iter().for_each(|g| g.foreach_segment(f))
            }
            Object::Feature { geometry, .. } => geometry.foreach_segment(f),
            Object::FeatureCollection { features, .. } => {
                features.iter().for_each(|g| g.foreach_segment(f))
            }
            _ => {}
        }
    }

    /// The bounding box: the embedded `bbox` member when present, otherwise
    /// computed from the coordinates.
    pub fn calculated_bbox(&self) -> BBox {
        let stored = match self {
            Object::Point { bbox, .. }
            | Object::MultiPoint { bbox, .. }
            | Object::LineString { bbox, .. }
            | Object::MultiLineString { bbox, .. }
            | Object::Polygon { bbox, .. }
            | Object::MultiPolygon { bbox, .. }
            | Object::GeometryCollection { bbox, .. }
            | Object::Feature { bbox, .. }
            | Object::FeatureCollection { bbox, .. } => *bbox,
            _ => None,
        };
        if let Some(bbox) = stored {
            return bbox;
        }
        let mut bbox: Option<BBox> = None;
        self.foreach_position(&mut |p| match &mut bbox {
            Some(b) => b.expand(*p),
            none => *none = Some(BBox::from_position(*p)),
        });
        bbox.unwrap_or_default()
    }

    /// The representative point: the point itself for point types, the bbox
    /// center otherwise.
    pub fn calculated_point(&self) -> Position {
        match self {
            Object::SimplePoint(p) | Object::Point { pos: p, .. } => *p,
            _ => self.calculated_bbox().center(),
        }
    }

    /// Geohash of the representative point.
    pub fn geohash(&self, precision: usize) -> Result<String, GeohashError> {
        let p = self.calculated_point();
        geohash::encode(p.lat(), p.lon(), precision)
    }

    /// True when this object lies entirely within the bbox.
    pub fn within_bbox(&self, bbox: &BBox) -> bool {
        if !self.is_geometry() {
            return false;
        }
        bbox.contains_bbox(&self.calculated_bbox())
    }

    /// True when this object touches the bbox at all.
    pub fn intersects_bbox(&self, bbox: &BBox) -> bool {
        if !self.is_geometry() {
            return false;
        }
        if !bbox.intersects_bbox(&self.calculated_bbox()) {
            return false;
        }
        match self {
            Object::Polygon { rings, .. } => {
                // overlap of boxes is not enough for a concave outline:
                // require a vertex inside the box or a box corner inside
                // the polygon
                let mut hit = false;
                self.foreach_position(&mut |p| {
                    if bbox.contains_position(p) {
                        hit = true;
                    }
                });
                hit || corners(bbox).iter().any(|c| point_in_polygon(c, rings))
            }
            _ => true,
        }
    }

    /// True when every part of this object is within `meters` of the center.
    pub fn within_circle(&self, center: &Position, meters: f64) -> bool {
        if !self.is_geometry() {
            return false;
        }
        let mut any = false;
        let mut all = true;
        self.foreach_position(&mut |p| {
            any = true;
            if p.distance_to(center) > meters {
                all = false;
            }
        });
        any && all
    }

    /// True when any part of this object is within `meters` of the center,
    /// or the center falls inside a polygon object.
    pub fn intersects_circle(&self, center: &Position, meters: f64) -> bool {
        if !self.is_geometry() {
            return false;
        }
        let mut hit = false;
        self.foreach_position(&mut |p| {
            if p.distance_to(center) <= meters {
                hit = true;
            }
        });
        if hit {
            return true;
        }
        self.contains_point(center)
    }

    /// True when `p` falls inside this object's area (polygon types only).
    pub fn contains_point(&self, p: &Position) -> bool {
        match self {
            Object::Polygon { rings, .. } => point_in_polygon(p, rings),
            Object::MultiPolygon { polygons, .. } => {
                polygons.iter().any(|rings| point_in_polygon(p, rings))
            }
            Object::Feature { geometry, .. } => geometry.contains_point(p),
            Object::GeometryCollection { geometries, .. } => {
                geometries.iter().any(|g| g.contains_point(p))
            }
            Object::FeatureCollection { features, .. } => {
                features.iter().any(|g| g.contains_point(p))
            }
            _ => false,
        }
    }

    /// Object-vs-object containment: every part of `self` lies inside an
    /// area target, on a line target, or on a point target.
    pub fn within(&self, other: &Object) -> bool {
        if !self.is_geometry() || !other.is_geometry() {
            return false;
        }
        match other {
            Object::Polygon { .. } | Object::MultiPolygon { .. } => {
                let mut any = false;
                let mut all = true;
                self.foreach_position(&mut |p| {
                    any = true;
                    if !other.contains_point(p) {
                        all = false;
                    }
                });
                any && all
            }
            Object::LineString { .. } | Object::MultiLineString { .. } => {
                self.covered_by_lines(other)
            }
            Object::SimplePoint(_) | Object::Point { .. } | Object::MultiPoint { .. } => {
                self.covered_by_points(other)
            }
            Object::Feature { geometry, .. } => self.within(geometry),
            Object::GeometryCollection { geometries, .. } => {
                geometries.iter().any(|g| self.within(g))
            }
            Object::FeatureCollection { features, .. } => {
                features.iter().any(|g| self.within(g))
            }
            Object::Str(_) => false,
        }
    }

    /// Every position of `self` on one of `other`'s segments, and every
    /// segment interior following the target too (checked at midpoints, so
    /// a chord that only touches the target at its endpoints is rejected).
    fn covered_by_lines(&self, other: &Object) -> bool {
        let mut segs: Vec<(Position, Position)> = Vec::new();
        other.foreach_segment(&mut |a, b| segs.push((*a, *b)));
        if segs.is_empty() {
            return false;
        }
        let on_line = |p: &Position| segs.iter().any(|(a, b)| point_on_segment(p, a, b));
        let mut any = false;
        let mut all = true;
        self.foreach_position(&mut |p| {
            any = true;
            if !on_line(p) {
                all = false;
            }
        });
        if !any || !all {
            return false;
        }
        let mut interiors_covered = true;
        self.foreach_segment(&mut |a, b| {
            let mid = Position::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0, 0.0);
            if !on_line(&mid) {
                interiors_covered = false;
            }
        });
        interiors_covered
    }

    /// Every position of `self` coincides with one of `other`'s points.
    /// Anything carrying segments can never sit inside a bare point set.
    fn covered_by_points(&self, other: &Object) -> bool {
        let mut has_segment = false;
        self.foreach_segment(&mut |_, _| has_segment = true);
        if has_segment {
            return false;
        }
        let mut points: Vec<Position> = Vec::new();
        other.foreach_position(&mut |p| points.push(*p));
        let mut any = false;
        let mut all = true;
        self.foreach_position(&mut |p| {
            any = true;
            if !points.iter().any(|q| p.approx_eq(q)) {
                all = false;
            }
        });
        any && all
    }

    /// Object-vs-object intersection: a shared point between the two
    /// geometries — a vertex inside an area, a vertex on a segment, edges
    /// crossing, or coincident bare points.
    pub fn intersects(&self, other: &Object) -> bool {
        if !self.is_geometry() || !other.is_geometry() {
            return false;
        }
        if !self
            .calculated_bbox()
            .intersects_bbox(&other.calculated_bbox())
        {
            return false;
        }
        match other {
            Object::Feature { geometry, .. } => return self.intersects(geometry),
            Object::GeometryCollection { geometries, .. } => {
                return geometries.iter().any(|g| self.intersects(g))
            }
            Object::FeatureCollection { features, .. } => {
                return features.iter().any(|g| self.intersects(g))
            }
            _ => {}
        }

        // a vertex of either falls inside the other's area
        let mut hit = false;
        self.foreach_position(&mut |p| {
            if other.contains_point(p) {
                hit = true;
            }
        });
        if hit {
            return true;
        }
        other.foreach_position(&mut |p| {
            if self.contains_point(p) {
                hit = true;
            }
        });
        if hit {
            return true;
        }

        let mut self_segs: Vec<(Position, Position)> = Vec::new();
        self.foreach_segment(&mut |a, b| self_segs.push((*a, *b)));
        let mut other_segs: Vec<(Position, Position)> = Vec::new();
        other.foreach_segment(&mut |a, b| other_segs.push((*a, *b)));

        // a vertex of either lies on an edge of the other
        let mut on_edge = false;
        self.foreach_position(&mut |p| {
            if other_segs.iter().any(|(a, b)| point_on_segment(p, a, b)) {
                on_edge = true;
            }
        });
        if on_edge {
            return true;
        }
        other.foreach_position(&mut |p| {
            if self_segs.iter().any(|(a, b)| point_on_segment(p, a, b)) {
                on_edge = true;
            }
        });
        if on_edge {
            return true;
        }

        // edges cross without either holding a vertex of the other
        if self_segs.iter().any(|(a1, a2)| {
            other_segs
                .iter()
                .any(|(b1, b2)| segments_intersect(a1, a2, b1, b2))
        }) {
            return true;
        }

        // two bare point sets intersect only on coincident points
        if self_segs.is_empty() && other_segs.is_empty() {
            let mut points: Vec<Position> = Vec::new();
            other.foreach_position(&mut |p| points.push(*p));
            let mut coincide = false;
            self.foreach_position(&mut |p| {
                if points.iter().any(|q| p.approx_eq(q)) {
                    coincide = true;
                }
            });
            return coincide;
        }
        false
    }

    /// Approximate in-memory footprint in bytes, used by the out-of-memory
    /// watcher's accounting.
    pub fn weight(&self) -> usize {
        match self {
            Object::Str(s) => s.len() + 24,
            _ => {
                let mut n = 0usize;
                self.foreach_position(&mut |_| n += 1);
                n * 24 + 48
            }
        }
    }
}

fn corners(bbox: &BBox) -> [Position; 4] {
    [
        bbox.min,
        Position::new(bbox.max.x, bbox.min.y, 0.0),
        bbox.max,
        Position::new(bbox.min.x, bbox.max.y, 0.0),
    ]
}

/// Visits a ring's edges, synthesizing the closing edge when the ring is
/// not stored closed.
fn ring_segments(ring: &[Position], f: &mut impl FnMut(&Position, &Position)) {
    if ring.len() < 2 {
        return;
    }
    for pair in ring.windows(2) {
        f(&pair[0], &pair[1]);
    }
    let (first, last) = (&ring[0], &ring[ring.len() - 1]);
    if !first.approx_eq(last) {
        f(last, first);
    }
}

fn coordinates(v: &Value) -> Result<&Value, GeoJsonError> {
    v.get("coordinates")
        .ok_or(GeoJsonError::MissingMember("coordinates"))
}

fn parse_position(v: &Value) -> Result<Position, GeoJsonError> {
    let arr = v
        .as_array()
        .ok_or(GeoJsonError::Invalid("position must be an array".to_string()))?;
    if arr.len() < 2 {
        return Err(GeoJsonError::Invalid(
            "position must have at least two numbers".to_string(),
        ));
    }
    let num = |i: usize| -> Result<f64, GeoJsonError> {
        arr.get(i)
            .and_then(Value::as_f64)
            .ok_or(GeoJsonError::Invalid("position members must be numbers".to_string()))
    };
    Ok(Position::new(
        num(0)?,
        num(1)?,
        if arr.len() > 2 { num(2)? } else { 0.0 },
    ))
}

fn parse_positions(v: &Value) -> Result<Vec<Position>, GeoJsonError> {
    v.as_array()
        .ok_or(GeoJsonError::Invalid("coordinates must be an array".to_string()))?
        .iter()
        .map(parse_position)
        .collect()
}

fn parse_position_groups(v: &Value) -> Result<Vec<Vec<Position>>, GeoJsonError> {
    v.as_array()
        .ok_or(GeoJsonError::Invalid("coordinates must be an array".to_string()))?
        .iter()
        .map(parse_positions)
        .collect()
}

fn parse_bbox_member(v: &Value) -> Result<Option<BBox>, GeoJsonError> {
    let arr = match v.get("bbox").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return Ok(None),
    };
    let nums: Vec<f64> = arr.iter().filter_map(Value::as_f64).collect();
    match nums.len() {
        4 => Ok(Some(BBox::new(
            Position::new(nums[0], nums[1], 0.0),
            Position::new(nums[2], nums[3], 0.0),
        ))),
        6 => Ok(Some(BBox::new(
            Position::new(nums[0], nums[1], nums[2]),
            Position::new(nums[3], nums[4], nums[5]),
        ))),
        n => Err(GeoJsonError::Invalid(format!("bbox must have 4 or 6 numbers, got {}", n))),
    }
}

fn position_json(p: &Position) -> String {
    if p.z != 0.0 {
        format!(
            "[{},{},{}]",
            format_float(p.x),
            format_float(p.y),
            format_float(p.z)
        )
    } else {
        format!("[{},{}]", format_float(p.x), format_float(p.y))
    }
}

fn positions_json(points: &[Position]) -> String {
    let body = points.iter().map(position_json).collect::<Vec<_>>().join(",");
    format!("[{}]", body)
}

fn position_groups_json(groups: &[Vec<Position>]) -> String {
    let body = groups
        .iter()
        .map(|g| positions_json(g))
        .collect::<Vec<_>>()
        .join(",");
    format!("[{}]", body)
}

fn bbox_json(bbox: &Option<BBox>) -> String {
    match bbox {
        Some(b) => {
            if b.min.z != 0.0 || b.max.z != 0.0 {
                format!(
                    r#","bbox":[{},{},{},{},{},{}]"#,
                    format_float(b.min.x),
                    format_float(b.min.y),
                    format_float(b.min.z),
                    format_float(b.max.x),
                    format_float(b.max.y),
                    format_float(b.max.z)
                )
            } else {
                format!(
                    r#","bbox":[{},{},{},{}]"#,
                    format_float(b.min.x),
                    format_float(b.min.y),
                    format_float(b.max.x),
                    format_float(b.max.y)
                )
            }
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly_10x10() -> Object {
        Object::parse_json(
            r#"{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,10],[0,0]]]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_point() {
        let obj = Object::parse_json(r#"{"type":"Point","coordinates":[-112.1,33.5]}"#).unwrap();
        let p = obj.calculated_point();
        assert_eq!(p.lat(), 33.5);
        assert_eq!(p.lon(), -112.1);
    }

    #[test]
    fn test_parse_point_with_z() {
        let obj =
            Object::parse_json(r#"{"type":"Point","coordinates":[-112.1,33.5,120]}"#).unwrap();
        assert_eq!(obj.calculated_point().z, 120.0);
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(matches!(
            Object::parse_json(r#"{"type":"Blob","coordinates":[0,0]}"#),
            Err(GeoJsonError::UnknownType(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_point() {
        let src = r#"{"type":"Point","coordinates":[-112.1,33.5]}"#;
        let obj = Object::parse_json(src).unwrap();
        assert_eq!(obj.json(), src);
        let again = Object::parse_json(&obj.json()).unwrap();
        assert_eq!(obj, again);
    }

    #[test]
    fn test_json_roundtrip_polygon() {
        let obj = poly_10x10();
        let again = Object::parse_json(&obj.json()).unwrap();
        assert_eq!(obj, again);
    }

    #[test]
    fn test_feature_json() {
        let src = r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[1,2]},"properties":{"name":"hq"}}"#;
        let obj = Object::parse_json(src).unwrap();
        assert_eq!(obj.json(), src);
    }

    #[test]
    fn test_string_object() {
        let obj = Object::Str("hello".to_string());
        assert!(!obj.is_geometry());
        assert_eq!(obj.text(), "hello");
        assert_eq!(obj.json(), "\"hello\"");
        assert!(!obj.within_bbox(&BBox::from_latlon_bounds(-90.0, -180.0, 90.0, 180.0)));
    }

    #[test]
    fn test_simple_point_json() {
        let obj = Object::SimplePoint(Position::from_latlon(33.5, -112.1));
        assert_eq!(obj.json(), r#"{"type":"Point","coordinates":[-112.1,33.5]}"#);
    }

    #[test]
    fn test_within_bbox() {
        let obj = Object::SimplePoint(Position::from_latlon(5.0, 5.0));
        assert!(obj.within_bbox(&BBox::from_latlon_bounds(0.0, 0.0, 10.0, 10.0)));
        assert!(!obj.within_bbox(&BBox::from_latlon_bounds(6.0, 6.0, 10.0, 10.0)));
    }

    #[test]
    fn test_circle_predicates() {
        let obj = Object::SimplePoint(Position::from_latlon(0.01, 0.01));
        let center = Position::from_latlon(0.0, 0.0);
        // 0.01 degrees is roughly 1.5km
        assert!(obj.within_circle(&center, 10_000.0));
        assert!(!obj.within_circle(&center, 100.0));
        assert!(obj.intersects_circle(&center, 10_000.0));
    }

    #[test]
    fn test_point_within_polygon_object() {
        let poly = poly_10x10();
        let inside = Object::SimplePoint(Position::new(5.0, 5.0, 0.0));
        let outside = Object::SimplePoint(Position::new(15.0, 5.0, 0.0));
        assert!(inside.within(&poly));
        assert!(!outside.within(&poly));
        assert!(inside.intersects(&poly));
        assert!(!outside.intersects(&poly));
    }

    #[test]
    fn test_polygon_intersects_polygon() {
        let a = poly_10x10();
        let b = Object::parse_json(
            r#"{"type":"Polygon","coordinates":[[[5,5],[15,5],[15,15],[5,15],[5,5]]]}"#,
        )
        .unwrap();
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.within(&b));
    }

    #[test]
    fn test_point_vs_line() {
        let line = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[0,0],[10,10]]}"#,
        )
        .unwrap();
        // inside the line's bbox but nowhere near the line itself
        let off = Object::SimplePoint(Position::new(5.0, 2.0, 0.0));
        assert!(!off.within(&line));
        assert!(!off.intersects(&line));
        assert!(!line.intersects(&off));

        let on = Object::SimplePoint(Position::new(5.0, 5.0, 0.0));
        assert!(on.within(&line));
        assert!(on.intersects(&line));
        assert!(line.intersects(&on));
        // a line is never within a point
        assert!(!line.within(&on));
    }

    #[test]
    fn test_line_vs_line() {
        let diag = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[0,0],[10,10]]}"#,
        )
        .unwrap();
        let cross = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[0,10],[10,0]]}"#,
        )
        .unwrap();
        assert!(diag.intersects(&cross));
        assert!(cross.intersects(&diag));
        assert!(!diag.within(&cross));

        // overlapping bboxes, but the segments never touch
        let near_miss = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[0,1],[9,10]]}"#,
        )
        .unwrap();
        assert!(!diag.intersects(&near_miss));
        assert!(!near_miss.intersects(&diag));

        // a sub-segment is within the longer line
        let sub = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[2,2],[6,6]]}"#,
        )
        .unwrap();
        assert!(sub.within(&diag));
        assert!(sub.intersects(&diag));
        assert!(!diag.within(&sub));

        // endpoints on the target but the chord leaves it
        let bent = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[0,0],[10,0],[10,10]]}"#,
        )
        .unwrap();
        assert!(!diag.within(&bent));
    }

    #[test]
    fn test_point_vs_point() {
        let a = Object::SimplePoint(Position::new(3.0, 4.0, 0.0));
        let b = Object::SimplePoint(Position::new(3.0, 4.0, 0.0));
        let c = Object::SimplePoint(Position::new(3.0, 4.5, 0.0));
        assert!(a.within(&b));
        assert!(a.intersects(&b));
        assert!(!a.within(&c));
        assert!(!a.intersects(&c));

        let multi = Object::parse_json(
            r#"{"type":"MultiPoint","coordinates":[[1,1],[3,4]]}"#,
        )
        .unwrap();
        assert!(a.within(&multi));
        assert!(a.intersects(&multi));
        assert!(!multi.within(&a), "only one of the two points coincides");
        assert!(multi.intersects(&a));
    }

    #[test]
    fn test_line_crosses_polygon_without_vertices_inside() {
        let poly = poly_10x10();
        // both endpoints outside; the segment passes straight through
        let through = Object::parse_json(
            r#"{"type":"LineString","coordinates":[[-5,5],[15,5]]}"#,
        )
        .unwrap();
        assert!(through.intersects(&poly));
        assert!(poly.intersects(&through));
        assert!(!through.within(&poly));
    }

    #[test]
    fn test_bbox_member_respected() {
        let obj = Object::parse_json(
            r#"{"type":"Point","coordinates":[5,5],"bbox":[0,0,10,10]}"#,
        )
        .unwrap();
        let b = obj.calculated_bbox();
        assert_eq!(b.min.x, 0.0);
        assert_eq!(b.max.y, 10.0);
    }

    #[test]
    fn test_geohash() {
        let obj = Object::SimplePoint(Position::from_latlon(57.64911, 10.40744));
        assert_eq!(obj.geohash(11).unwrap(), "u4pruydqqvj");
    }
}
