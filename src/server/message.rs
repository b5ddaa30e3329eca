//! Parsed client messages.
//!
//! The connection layer turns wire frames (RESP arrays, inline lines, HTTP
//! paths, WebSocket text frames) into a `Message`: the command tokens plus
//! the connection's framing and output mode. The router only ever sees this
//! type, so all three surfaces share one command vocabulary.

/// How responses are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// RESP values (`+OK\r\n`, arrays, …)
    Resp,
    /// JSON documents (`{"ok":true,…,"elapsed":"…"}`)
    Json,
}

/// How responses are framed onto the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    /// The legacy native framing: `$<len> <payload>\r\n`.
    Native,
    /// Plain RESP over TCP (the default).
    Resp,
    /// One-shot HTTP request; the body is always JSON.
    Http,
    /// WebSocket; mirrors the native output mode inside text frames.
    WebSocket,
}

/// One parsed command.
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw command tokens, `args[0]` being the verb as sent.
    pub args: Vec<String>,
    /// Lowercased verb. Two-word commands (`CONFIG GET …`) are rewritten by
    /// the router into `config get` before dispatch.
    pub command: String,
    pub output: OutputType,
    pub conn_type: ConnType,
    /// Per-message credential (HTTP header or query), checked when
    /// `requirepass` is configured.
    pub auth: Option<String>,
}

impl Message {
    pub fn new(args: Vec<String>, output: OutputType, conn_type: ConnType) -> Message {
        let command = args.first().map(|s| s.to_lowercase()).unwrap_or_default();
        Message {
            args,
            command,
            output,
            conn_type,
            auth: None,
        }
    }

    /// Builds an internal message (expirer deletes, replicated commands,
    /// mass inserts). Internal writes use RESP output; their responses are
    /// discarded.
    pub fn internal(args: Vec<String>) -> Message {
        Message::new(args, OutputType::Resp, ConnType::Resp)
    }

    /// The argument tokens after the verb.
    pub fn tail(&self) -> &[String] {
        &self.args[1..]
    }
}

/// Pops the next token from a token slice, mirroring the original parser's
/// `tokenval` helper. Returns the remaining tail and the token.
pub fn tokenval<'a>(vs: &'a [String]) -> Option<(&'a [String], &'a str)> {
    vs.split_first().map(|(head, tail)| (tail, head.as_str()))
}
