//! RESP (Redis Serialization Protocol) Data Types
//!
//! GeoKV speaks a RESP-compatible wire protocol. Each value starts with a
//! type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All types are terminated with CRLF (`\r\n`).
//!
//! Besides the client-facing protocol, the same multi-bulk encoding is the
//! on-disk format of the append-only file: one `*N\r\n$len\r\n…` record per
//! committed mutation, in the shape of the originating command.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// Represents a value in the RESP protocol.
///
/// This enum covers all RESP data types and is used for both parsing
/// incoming commands and serializing outgoing responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple strings are used for non-binary safe strings.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Errors are similar to simple strings but indicate an error condition.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integers.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Bulk strings are binary-safe strings.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null value (null bulk string or null array)
    Null,

    /// Arrays can contain any RESP type, including nested arrays.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a new simple string response.
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error response.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates a new integer response.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a new bulk string response.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a bulk string holding a float formatted without trailing
    /// zeros. RESP has no float type; floats travel as bulk strings.
    pub fn float(f: f64) -> Self {
        RespValue::BulkString(Bytes::from(format_float(f)))
    }

    /// Creates a null response.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array response.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Common response for successful operations
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns true if this value is an empty simple or bulk string. The
    /// router suppresses these: the handler has already written its own
    /// payload (e.g. a live subscription handshake).
    pub fn is_empty_string(&self) -> bool {
        match self {
            RespValue::SimpleString(s) => s.is_empty(),
            RespValue::BulkString(b) => b.is_empty(),
            _ => false,
        }
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Attempts to extract the inner array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the inner array if this is an Array variant.
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "{}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "{}", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

/// Encodes command tokens as a RESP multi-bulk record.
///
/// This is the exact byte form of one append-only-file record, and of the
/// commands replicated to followers.
pub fn encode_multibulk(tokens: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 * tokens.len() + 16);
    buf.push(prefix::ARRAY);
    buf.extend_from_slice(tokens.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for token in tokens {
        buf.push(prefix::BULK_STRING);
        buf.extend_from_slice(token.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(CRLF);
    }
    buf
}

/// Formats a float the way the wire protocol and AOF expect: shortest
/// representation that round-trips, no exponent, no trailing zeros.
pub fn format_float(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        let mut s = format!("{}", f);
        if s.contains('e') || s.contains('E') {
            s = format!("{:.10}", f);
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_serialize() {
        let value = RespValue::simple_string("OK");
        assert_eq!(value.serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_error_serialize() {
        let value = RespValue::error("ERR unknown command");
        assert_eq!(value.serialize(), b"-ERR unknown command\r\n");
    }

    #[test]
    fn test_integer_serialize() {
        let value = RespValue::integer(1000);
        assert_eq!(value.serialize(), b":1000\r\n");

        let negative = RespValue::integer(-42);
        assert_eq!(negative.serialize(), b":-42\r\n");
    }

    #[test]
    fn test_bulk_string_serialize() {
        let value = RespValue::bulk_string(Bytes::from("hello"));
        assert_eq!(value.serialize(), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_null_serialize() {
        let value = RespValue::null();
        assert_eq!(value.serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("GET")),
            RespValue::bulk_string(Bytes::from("fleet")),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$5\r\nfleet\r\n");
    }

    #[test]
    fn test_encode_multibulk() {
        let tokens = vec!["set".to_string(), "fleet".to_string(), "truck1".to_string()];
        assert_eq!(
            encode_multibulk(&tokens),
            b"*3\r\n$3\r\nset\r\n$5\r\nfleet\r\n$6\r\ntruck1\r\n"
        );
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(33.5), "33.5");
        assert_eq!(format_float(-112.1), "-112.1");
        assert_eq!(format_float(90.0), "90");
        assert_eq!(format_float(0.0), "0");
    }

    #[test]
    fn test_empty_string_detection() {
        assert!(RespValue::simple_string("").is_empty_string());
        assert!(RespValue::bulk_string(Bytes::new()).is_empty_string());
        assert!(!RespValue::ok().is_empty_string());
        assert!(!RespValue::Null.is_empty_string());
    }
}
