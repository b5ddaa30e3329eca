//! RESP Protocol Implementation
//!
//! GeoKV's wire format is a RESP-compatible multi-bulk frame. Commands are
//! case-insensitive verbs followed by string/number arguments; responses are
//! RESP values or JSON documents depending on the connection's output mode.
//!
//! - `types`: the `RespValue` enum, wire serialization, multi-bulk encoding
//! - `parser`: incremental parser for incoming RESP and inline commands
//!
//! The multi-bulk encoding doubles as the append-only-file record format and
//! the replication stream format, so this module is consumed by the AOF
//! writer/loader and the follow client as well as the connection layer.

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_multibulk, format_float, RespValue};
