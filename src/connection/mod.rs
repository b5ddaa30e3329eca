//! Client connection management.
//!
//! Each accepted socket runs in its own task. The connection layer owns
//! protocol detection and framing — RESP/inline, one-shot HTTP, and
//! WebSocket all feed the same command router — plus the per-connection
//! output mode, keepalive enforcement, and the kill flag from
//! `CLIENT KILL`.
//!
//! - `handler`: the connection loop, upgrades to live/replication streams
//! - `http`: request parsing and JSON response framing
//! - `ws`: RFC 6455 handshake and frame codec

pub mod handler;
pub mod http;
pub mod ws;

pub use handler::{handle_connection, ConnectionError};
