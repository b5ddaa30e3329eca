//! GeoJSON object model and geometry math.
//!
//! The controller stores opaque `Object` values and consumes a narrow
//! surface: bounding boxes, representative points, geohashes, and the
//! spatial predicates used by search and fence evaluation. This module
//! provides that surface.
//!
//! - `object`: the `Object` sum type (geometry / string / simple point),
//!   GeoJSON parsing and serialization, spatial predicates
//! - `position`: positions, bounding boxes, haversine distance,
//!   point-in-polygon, slippy-tile math
//! - `geohash`: base-32 geohash encode/decode

pub mod geohash;
pub mod object;
pub mod position;

pub use geohash::GeohashError;
pub use object::{GeoJsonError, Object};
pub use position::{haversine, tile_to_bbox, BBox, Position};
