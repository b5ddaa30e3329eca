//! Geohash encoding and decoding.
//!
//! Standard base-32 geohash: interleaved longitude/latitude bisection, five
//! bits per output character. Decoding returns the cell's bounding box.

use crate::geojson::position::BBox;
use thiserror::Error;

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Maximum supported precision. Twelve characters resolve to well under a
/// centimeter, beyond which f64 interleaving stops gaining anything.
pub const MAX_PRECISION: usize = 12;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeohashError {
    #[error("invalid geohash precision: {0}")]
    InvalidPrecision(usize),

    #[error("invalid geohash character: {0}")]
    InvalidCharacter(char),

    #[error("empty geohash")]
    Empty,
}

/// Encodes a lat/lon pair at the given precision (1..=12 characters).
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String, GeohashError> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeohashError::InvalidPrecision(precision));
    }
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut hash = String::with_capacity(precision);
    let mut bit = 0usize;
    let mut ch = 0usize;
    let mut even = true; // even bits bisect longitude

    while hash.len() < precision {
        if even {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if lon >= mid {
                ch |= 1 << (4 - bit);
                lon_range.0 = mid;
            } else {
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                ch |= 1 << (4 - bit);
                lat_range.0 = mid;
            } else {
                lat_range.1 = mid;
            }
        }
        even = !even;
        if bit < 4 {
            bit += 1;
        } else {
            hash.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    Ok(hash)
}

/// Decodes a geohash into the bounding box of its cell.
pub fn decode(hash: &str) -> Result<BBox, GeohashError> {
    if hash.is_empty() {
        return Err(GeohashError::Empty);
    }
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even = true;

    for c in hash.to_ascii_lowercase().chars() {
        let idx = BASE32
            .iter()
            .position(|&b| b as char == c)
            .ok_or(GeohashError::InvalidCharacter(c))?;
        for bit in (0..5).rev() {
            let set = (idx >> bit) & 1 == 1;
            if even {
                let mid = (lon_range.0 + lon_range.1) / 2.0;
                if set {
                    lon_range.0 = mid;
                } else {
                    lon_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if set {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even = !even;
        }
    }
    Ok(BBox::from_latlon_bounds(
        lat_range.0,
        lon_range.0,
        lat_range.1,
        lon_range.1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_value() {
        // well-known reference hash for 57.64911, 10.40744
        let hash = encode(57.64911, 10.40744, 11).unwrap();
        assert_eq!(hash, "u4pruydqqvj");
    }

    #[test]
    fn test_encode_precision() {
        let hash = encode(33.5, -112.1, 5).unwrap();
        assert_eq!(hash.len(), 5);
        assert!(encode(0.0, 0.0, 0).is_err());
        assert!(encode(0.0, 0.0, 13).is_err());
    }

    #[test]
    fn test_decode_roundtrip() {
        let hash = encode(33.5, -112.1, 9).unwrap();
        let bbox = decode(&hash).unwrap();
        let center = bbox.center();
        assert!((center.lat() - 33.5).abs() < 0.001);
        assert!((center.lon() - -112.1).abs() < 0.001);
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode("").is_err());
        assert!(matches!(
            decode("abci"),
            Err(GeohashError::InvalidCharacter('i'))
        ));
    }
}
