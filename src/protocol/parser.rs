//! Incremental RESP Protocol Parser
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((value, consumed)))` - Successfully parsed a value, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the message is incomplete
//! - `Err(ParseError)` - Invalid protocol data
//!
//! The caller appends incoming network data to a buffer, calls `parse()`,
//! and advances the buffer by `consumed` bytes on success. Incomplete input
//! is never an error; the caller simply reads more from the socket.
//!
//! Telnet-style clients are supported through inline parsing: any line that
//! does not start with a RESP prefix byte is split on whitespace into
//! command tokens, with quoted strings honored. The same incremental parser
//! is reused by the append-only-file loader and the replication follower,
//! both of which tail streams of multi-bulk records.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP protocol parser.
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for array parsing)
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse a RESP value from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((value, consumed)))` - Successfully parsed a value
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Parse error
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => self.parse_simple_string(buf),
            prefix::ERROR => self.parse_error(buf),
            prefix::INTEGER => self.parse_integer(buf),
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            _ => self.parse_inline(buf),
        }
    }

    /// Parses a simple string: `+<string>\r\n`
    fn parse_simple_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let content = &buf[1..1 + pos];
                let s = std::str::from_utf8(content)
                    .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

                // +1 for prefix, +2 for CRLF
                let consumed = 1 + pos + 2;
                Ok(Some((RespValue::SimpleString(s.to_string()), consumed)))
            }
            None => Ok(None),
        }
    }

    /// Parses an error: `-<error message>\r\n`
    fn parse_error(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let content = &buf[1..1 + pos];
                let s = std::str::from_utf8(content)
                    .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

                let consumed = 1 + pos + 2;
                Ok(Some((RespValue::Error(s.to_string()), consumed)))
            }
            None => Ok(None),
        }
    }

    /// Parses an integer: `:<integer>\r\n`
    fn parse_integer(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match find_crlf(&buf[1..]) {
            Some(pos) => {
                let content = &buf[1..1 + pos];
                let s = std::str::from_utf8(content)
                    .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

                let n: i64 = s
                    .parse()
                    .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
                let consumed = 1 + pos + 2;
                Ok(Some((RespValue::Integer(n), consumed)))
            }
            None => Ok(None),
        }
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let length_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let length_str = std::str::from_utf8(&buf[1..1 + length_end])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let length: i64 = length_str
            .parse()
            .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;

        if length == -1 {
            let consumed = 1 + length_end + 2; // $-1\r\n
            return Ok(Some((RespValue::Null, consumed)));
        }

        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;

        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let data_start = 1 + length_end + 2; // prefix + length + CRLF

        let total_needed = data_start + length + 2; // data + CRLF
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[data_start + length..data_start + length + 2] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);

        Ok(Some((RespValue::BulkString(data), total_needed)))
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let count_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let count_str = std::str::from_utf8(&buf[1..1 + count_end])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let count: i64 = count_str
            .parse()
            .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;

        if count == -1 {
            let consumed = 1 + count_end + 2;
            return Ok(Some((RespValue::Null, consumed)));
        }

        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let count = count as usize;

        let mut elements = Vec::with_capacity(count);
        let mut consumed = 1 + count_end + 2; // *<count>\r\n

        self.depth += 1;

        for _ in 0..count {
            if consumed >= buf.len() {
                return Ok(None);
            }

            match self.parse_value(&buf[consumed..])? {
                Some((value, element_consumed)) => {
                    elements.push(value);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }

        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }

    /// Parses a telnet-style inline command, honoring double quotes so that
    /// `SET k id OBJECT "{...}"` style input survives intact.
    fn parse_inline(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let crlf_pos = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let line = std::str::from_utf8(&buf[..crlf_pos])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let parts = split_inline(line)?;
        if parts.is_empty() {
            return Err(ParseError::ProtocolError("empty inline command".to_string()));
        }

        let elements: Vec<RespValue> = parts
            .into_iter()
            .map(|s| RespValue::BulkString(Bytes::from(s)))
            .collect();

        Ok(Some((RespValue::Array(elements), crlf_pos + 2)))
    }
}

/// Splits an inline command line into tokens. Double-quoted tokens may
/// contain whitespace; a backslash escapes the next character inside quotes.
fn split_inline(line: &str) -> ParseResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut has_token = false;

    for ch in line.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token || !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(ParseError::ProtocolError(
            "unbalanced quotes in inline command".to_string(),
        ));
    }
    if has_token || !current.is_empty() {
        parts.push(current);
    }
    Ok(parts)
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
    }
    None
}

/// Helper function to parse a single RESP message from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_string() {
        let input = b"+OK\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::SimpleString("OK".to_string()));
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_simple_string_incomplete() {
        let input = b"+OK";
        assert!(parse_message(input).unwrap().is_none());
    }

    #[test]
    fn test_parse_error() {
        let input = b"-ERR unknown command\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::Error("ERR unknown command".to_string()));
        assert_eq!(result.1, 22);
    }

    #[test]
    fn test_parse_integer() {
        let input = b":1000\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::Integer(1000));
        assert_eq!(result.1, 7);
    }

    #[test]
    fn test_parse_bulk_string() {
        let input = b"$5\r\nhello\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::BulkString(Bytes::from("hello")));
        assert_eq!(result.1, 11);
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let input = b"$-1\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::Null);
        assert_eq!(result.1, 5);
    }

    #[test]
    fn test_parse_bulk_string_incomplete() {
        let input = b"$5\r\nhel";
        assert!(parse_message(input).unwrap().is_none());
    }

    #[test]
    fn test_parse_array() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nfleet\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(
            result.0,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("GET")),
                RespValue::BulkString(Bytes::from("fleet")),
            ])
        );
        assert_eq!(result.1, 25);
    }

    #[test]
    fn test_parse_array_incomplete() {
        let input = b"*3\r\n$3\r\nSET\r\n$5\r\nfleet\r\n";
        assert!(parse_message(input).unwrap().is_none());
    }

    #[test]
    fn test_parse_inline_command() {
        let input = b"SET fleet truck1 POINT 33.5 -112.1\r\n";
        let result = parse_message(input).unwrap().unwrap();
        let arr = result.0.into_array().unwrap();
        assert_eq!(arr.len(), 6);
        assert_eq!(arr[0].as_str(), Some("SET"));
        assert_eq!(arr[5].as_str(), Some("-112.1"));
    }

    #[test]
    fn test_parse_inline_quoted() {
        let input = b"SET k id OBJECT \"{\\\"type\\\":\\\"Point\\\"}\"\r\n";
        let result = parse_message(input).unwrap().unwrap();
        let arr = result.0.into_array().unwrap();
        assert_eq!(arr.len(), 5);
        assert_eq!(arr[4].as_str(), Some("{\"type\":\"Point\"}"));
    }

    #[test]
    fn test_parse_invalid_integer() {
        let input = b":not_a_number\r\n";
        let result = parse_message(input);
        assert!(matches!(result, Err(ParseError::InvalidInteger(_))));
    }

    #[test]
    fn test_roundtrip() {
        let original = RespValue::Array(vec![
            RespValue::bulk_string(Bytes::from("SET")),
            RespValue::bulk_string(Bytes::from("fleet")),
            RespValue::bulk_string(Bytes::from("truck1")),
        ]);

        let serialized = original.serialize();
        let (parsed, _) = parse_message(&serialized).unwrap().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let input = b"$5\r\nhel\x00o\r\n";
        let result = parse_message(input).unwrap().unwrap();
        assert_eq!(result.0, RespValue::BulkString(Bytes::from(&b"hel\x00o"[..])));
    }
}
