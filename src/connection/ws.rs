//! WebSocket framing (RFC 6455), just enough for the command surface:
//! the upgrade handshake, masked client text frames in, unmasked server
//! text frames out, and close/ping control frames.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID from RFC 6455 §4.2.2.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("malformed websocket frame: {0}")]
    Malformed(String),

    #[error("frame too large: {0} bytes")]
    TooLarge(u64),
}

/// Maximum accepted client frame payload.
const MAX_FRAME_SIZE: u64 = 1024 * 1024;

/// One parsed client frame.
#[derive(Debug, PartialEq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Computes the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The complete 101 handshake response.
pub fn handshake_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

/// Builds an unmasked server-to-client text frame.
pub fn text_frame(payload: &[u8]) -> Vec<u8> {
    frame(OPCODE_TEXT, payload)
}

/// Builds an unmasked server-to-client frame with the given opcode.
pub fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | (opcode & 0x0f));
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Incrementally parses one client frame, unmasking the payload.
/// `Ok(None)` means more bytes are needed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(WsFrame, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & 0x80 != 0;
    let mut len = (buf[1] & 0x7f) as u64;
    let mut offset = 2usize;

    if len == 126 {
        if buf.len() < 4 {
            return Ok(None);
        }
        len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
        offset = 4;
    } else if len == 127 {
        if buf.len() < 10 {
            return Ok(None);
        }
        len = u64::from_be_bytes(buf[2..10].try_into().expect("length checked"));
        offset = 10;
    }
    if len > MAX_FRAME_SIZE {
        return Err(WsError::TooLarge(len));
    }

    let mask: Option<[u8; 4]> = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mask = [
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ];
        offset += 4;
        Some(mask)
    } else {
        None
    };

    let total = offset + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let mut payload = buf[offset..total].to_vec();
    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    Ok(Some((
        WsFrame {
            fin,
            opcode,
            payload,
        },
        total,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        // the worked example from RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_text_frame_roundtrip_small() {
        let framed = text_frame(b"hello");
        assert_eq!(framed[0], 0x81);
        assert_eq!(framed[1], 5);
        assert_eq!(&framed[2..], b"hello");
    }

    #[test]
    fn test_parse_masked_client_frame() {
        // "SET" masked with a known key
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let payload = b"SET k id POINT 1 2";
        let mut raw = vec![0x81, 0x80 | payload.len() as u8];
        raw.extend_from_slice(&mask);
        for (i, &b) in payload.iter().enumerate() {
            raw.push(b ^ mask[i % 4]);
        }
        let (frame, consumed) = parse_frame(&raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OPCODE_TEXT);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_parse_incomplete_frame() {
        assert!(parse_frame(&[0x81]).unwrap().is_none());
        assert!(parse_frame(&[0x81, 0x85, 0x00, 0x01]).unwrap().is_none());
    }

    #[test]
    fn test_extended_length_frame() {
        let payload = vec![b'x'; 300];
        let framed = text_frame(&payload);
        assert_eq!(framed[1], 126);
        let (frame, consumed) = parse_frame(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(frame.payload.len(), 300);
    }
}
