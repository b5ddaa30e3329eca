//! Per-connection protocol handling.
//!
//! One task per accepted socket. The handler sniffs the protocol from the
//! first complete line — RESP arrays and inline commands stay on the
//! native loop, an `HTTP/1.x` request line switches to the one-shot JSON
//! surface, and an HTTP upgrade turns the socket into a WebSocket command
//! stream. All three build the same `Message` type and go through
//! `Server::handle_message`.
//!
//! Two upgrades leave the request/response loop entirely: a fence search
//! (`Reply::Live`) turns the connection into a live event stream, and
//! `AOF pos` (`Reply::AofStream`) turns it into a raw replication tail.
//! Both consume the handler and split the socket so reads (quit detection,
//! kill) and writes (payload stream) proceed independently.

use crate::protocol::{RespParser, RespValue};
use crate::server::fence;
use crate::server::message::{ConnType, Message, OutputType};
use crate::server::{ClientInfo, LiveRequest, Reply, Server};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{http, ws};

/// Maximum buffered bytes for a single command.
const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] crate::protocol::ParseError),

    #[error("http error: {0}")]
    Http(#[from] http::HttpError),

    #[error("websocket error: {0}")]
    Ws(#[from] ws::WsError),

    #[error("client disconnected")]
    Disconnected,

    #[error("connection killed")]
    Killed,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("buffer size limit exceeded")]
    BufferFull,
}

/// A pending switch out of the request/response loop.
enum Upgrade {
    Live(Box<LiveRequest>),
    Aof(u64),
}

/// Entry point for one accepted socket.
pub async fn handle_connection(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    if server.protected() && !addr.ip().is_loopback() {
        let mut stream = stream;
        let _ = stream
            .write_all(b"-DENIED GeoKV is running in protected mode. Set a requirepass or disable protected-mode to accept remote connections.\r\n")
            .await;
        return;
    }

    let client = server.register_client(addr.to_string());
    debug!(client = %addr, id = client.id, "client connected");

    let handler = ConnectionHandler::new(Arc::clone(&server), stream, addr, Arc::clone(&client));
    match handler.run().await {
        Ok(()) | Err(ConnectionError::Disconnected) => {
            debug!(client = %addr, "client disconnected")
        }
        Err(ConnectionError::Killed) => info!(client = %addr, "client killed"),
        Err(ConnectionError::IdleTimeout) => debug!(client = %addr, "client idle timeout"),
        Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            debug!(client = %addr, "connection reset by client")
        }
        Err(e) => warn!(client = %addr, error = %e, "connection error"),
    }
    server.unregister_client(client.id);
}

struct ConnectionHandler {
    server: Arc<Server>,
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    parser: RespParser,
    client: Arc<ClientInfo>,
    output: OutputType,
    conn_type: ConnType,
    upgrade: Option<Upgrade>,
    close_after_reply: bool,
}

impl ConnectionHandler {
    fn new(
        server: Arc<Server>,
        stream: TcpStream,
        addr: SocketAddr,
        client: Arc<ClientInfo>,
    ) -> ConnectionHandler {
        ConnectionHandler {
            server,
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            client,
            output: OutputType::Resp,
            conn_type: ConnType::Resp,
            upgrade: None,
            close_after_reply: false,
        }
    }

    async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            if self.client.killed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Killed);
            }

            // drain every complete command already buffered
            loop {
                let progressed = match self.conn_type {
                    ConnType::WebSocket => self.try_websocket_frame().await?,
                    _ => match http::looks_like_http(&self.buffer) {
                        Some(true) => self.try_http_request().await?,
                        Some(false) => self.try_resp_command().await?,
                        None => false,
                    },
                };
                if self.close_after_reply {
                    return Ok(());
                }
                if let Some(upgrade) = self.upgrade.take() {
                    return match upgrade {
                        Upgrade::Live(req) => run_live(self, *req).await,
                        Upgrade::Aof(pos) => run_aof_stream(self, pos).await,
                    };
                }
                if !progressed {
                    break;
                }
                if self.client.killed.load(Ordering::SeqCst) {
                    return Err(ConnectionError::Killed);
                }
            }

            self.read_more().await?;
        }
    }

    /// Parses and executes one RESP/inline command, returning false when
    /// the buffer holds no complete command.
    async fn try_resp_command(&mut self) -> Result<bool, ConnectionError> {
        let parsed = self.parser.parse(&self.buffer)?;
        let Some((value, consumed)) = parsed else {
            return Ok(false);
        };
        self.buffer.advance(consumed);

        let tokens = match resp_tokens(value) {
            Some(tokens) if !tokens.is_empty() => tokens,
            _ => {
                self.stream
                    .write_all(&RespValue::error("ERR invalid command format").serialize())
                    .await?;
                self.stream.flush().await?;
                return Ok(true);
            }
        };
        let mut msg = Message::new(tokens, self.output, self.conn_type);

        if msg.command == "quit" {
            self.stream.write_all(b"+OK\r\n").await?;
            self.stream.flush().await?;
            return Err(ConnectionError::Disconnected);
        }

        let reply = self.server.handle_message(&self.client, &mut msg).await;
        self.apply_reply(reply).await?;
        Ok(true)
    }

    /// Parses and executes one WebSocket frame.
    async fn try_websocket_frame(&mut self) -> Result<bool, ConnectionError> {
        let parsed = ws::parse_frame(&self.buffer)?;
        let Some((frame, consumed)) = parsed else {
            return Ok(false);
        };
        self.buffer.advance(consumed);

        match frame.opcode {
            ws::OPCODE_CLOSE => {
                let close = ws::frame(ws::OPCODE_CLOSE, &[]);
                self.stream.write_all(&close).await?;
                self.stream.flush().await?;
                return Err(ConnectionError::Disconnected);
            }
            ws::OPCODE_PING => {
                let pong = ws::frame(ws::OPCODE_PONG, &frame.payload);
                self.stream.write_all(&pong).await?;
                self.stream.flush().await?;
                return Ok(true);
            }
            ws::OPCODE_TEXT => {}
            _ => return Ok(true),
        }

        let line = String::from_utf8_lossy(&frame.payload).to_string();
        let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return Ok(true);
        }
        let mut msg = Message::new(tokens, self.output, ConnType::WebSocket);
        let reply = self.server.handle_message(&self.client, &mut msg).await;
        self.apply_reply(reply).await?;
        Ok(true)
    }

    /// Handles one HTTP exchange (or a WebSocket upgrade). Returns false
    /// when the request is still incomplete.
    async fn try_http_request(&mut self) -> Result<bool, ConnectionError> {
        let Some((request, consumed)) = http::parse_request(&self.buffer)? else {
            return Ok(false);
        };
        self.buffer.advance(consumed);

        if request.is_websocket_upgrade() {
            let key = request.header("sec-websocket-key").unwrap_or_default();
            let response = ws::handshake_response(key);
            self.stream.write_all(response.as_bytes()).await?;
            self.stream.flush().await?;
            self.conn_type = ConnType::WebSocket;
            self.output = OutputType::Json;
            debug!(client = %self.addr, "websocket established");
            return Ok(true);
        }

        let mut tokens = if request.method == "POST" {
            let line = String::from_utf8_lossy(&request.body).to_string();
            line.split_whitespace().map(str::to_string).collect()
        } else {
            http::path_tokens(&request.path)
        };
        if tokens.is_empty() {
            tokens = vec!["server".to_string()];
        }

        let mut msg = Message::new(tokens, OutputType::Json, ConnType::Http);
        msg.auth = http::query_param(&request.path, "auth")
            .or_else(|| request.header("authorization").map(str::to_string));

        let reply = self.server.handle_message(&self.client, &mut msg).await;
        let body = match reply {
            Reply::Body(body) | Reply::Output(_, body) => body,
            Reply::Live(_) | Reply::AofStream(_) => {
                b"{\"ok\":false,\"err\":\"live connections are not supported over http\"}"
                    .to_vec()
            }
            Reply::None => Vec::new(),
        };
        let body = String::from_utf8_lossy(&body).to_string();
        self.stream.write_all(&http::response(&body)).await?;
        self.stream.flush().await?;
        self.close_after_reply = true;
        Ok(true)
    }

    async fn apply_reply(&mut self, reply: Reply) -> Result<(), ConnectionError> {
        match reply {
            Reply::Body(body) => self.write_framed(&body).await,
            Reply::Output(output, body) => {
                self.output = output;
                self.write_framed(&body).await
            }
            Reply::Live(req) => {
                self.upgrade = Some(Upgrade::Live(req));
                Ok(())
            }
            Reply::AofStream(pos) => {
                self.upgrade = Some(Upgrade::Aof(pos));
                Ok(())
            }
            Reply::None => Ok(()),
        }
    }

    /// Applies per-connection framing to a response body.
    async fn write_framed(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        match self.conn_type {
            ConnType::WebSocket => {
                let framed = ws::text_frame(body);
                self.stream.write_all(&framed).await?;
            }
            ConnType::Native => {
                // legacy native framing: `$<len> <payload>\r\n`
                self.stream
                    .write_all(format!("${} ", body.len()).as_bytes())
                    .await?;
                self.stream.write_all(body).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            _ => {
                if self.output == OutputType::Json {
                    // JSON over a RESP socket travels as a bulk string
                    self.stream
                        .write_all(format!("${}\r\n", body.len()).as_bytes())
                        .await?;
                    self.stream.write_all(body).await?;
                    self.stream.write_all(b"\r\n").await?;
                } else {
                    self.stream.write_all(body).await?;
                }
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads from the socket, honoring keepalive and kill.
    async fn read_more(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            return Err(ConnectionError::BufferFull);
        }
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }
        let keepalive = self.server.config.keepalive();

        let n = if keepalive > 0 {
            tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => read?,
                _ = tokio::time::sleep(Duration::from_secs(keepalive)) => {
                    return Err(ConnectionError::IdleTimeout);
                }
                _ = self.client.kill.notified() => return Err(ConnectionError::Killed),
            }
        } else {
            tokio::select! {
                read = self.stream.get_mut().read_buf(&mut self.buffer) => read?,
                _ = self.client.kill.notified() => return Err(ConnectionError::Killed),
            }
        };

        if n == 0 {
            return Err(ConnectionError::Disconnected);
        }
        Ok(())
    }
}

/// The live fence loop: handshake, subscribe, stream matching payloads
/// until the client quits, lags out of the hub, or is killed.
async fn run_live(handler: ConnectionHandler, req: LiveRequest) -> Result<(), ConnectionError> {
    let ConnectionHandler {
        server,
        stream,
        addr,
        client,
        output,
        conn_type,
        ..
    } = handler;
    let stream = stream.into_inner();
    let (mut read_half, mut write_half) = stream.into_split();

    if !req.fence.whereevals.is_empty() && !server.scripts.available() {
        let body = match req.msg.output {
            OutputType::Json => {
                b"{\"ok\":false,\"err\":\"scripting is not available\"}".to_vec()
            }
            OutputType::Resp => {
                RespValue::error("ERR scripting is not available").serialize()
            }
        };
        write_half.write_all(&body).await?;
        return Ok(());
    }

    // handshake
    match output {
        OutputType::Json => {
            write_payload(
                &mut write_half,
                conn_type,
                output,
                b"{\"ok\":true,\"live\":true}",
            )
            .await?;
        }
        OutputType::Resp => {
            write_half.write_all(b"+OK\r\n").await?;
        }
    }
    info!(client = %addr, key = %req.fence.key, "connection is live");

    let (sub_id, mut rx) = server.live.subscribe();
    let groups = std::sync::Mutex::new(HashMap::new());
    let mut chunk = [0u8; 1024];

    let result: Result<(), ConnectionError> = async {
        loop {
            tokio::select! {
                details = rx.recv() => {
                    let Some(details) = details else {
                        // dropped by the hub (overflow) or server shutdown
                        return Err(ConnectionError::Disconnected);
                    };
                    let payloads = {
                        let db = server.db.read().await;
                        fence::fence_match(None, &[], &groups, &req.fence, &details, &db)
                    };
                    for payload in payloads {
                        write_payload(&mut write_half, conn_type, output, payload.as_bytes())
                            .await?;
                    }
                }
                read = read_half.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(ConnectionError::Disconnected);
                    }
                    // live connections accept only QUIT and PING
                    let text = String::from_utf8_lossy(&chunk[..n]).to_lowercase();
                    if text.contains("quit") {
                        return Ok(());
                    }
                    if text.contains("ping") {
                        write_half.write_all(b"+PONG\r\n").await?;
                    }
                }
                _ = client.kill.notified() => {
                    return Err(ConnectionError::Killed);
                }
            }
        }
    }
    .await;
    server.live.unsubscribe(sub_id);
    result
}

/// The replication tail: acknowledge, then stream raw AOF bytes until the
/// follower drops or the shrinker swaps the file.
async fn run_aof_stream(handler: ConnectionHandler, pos: u64) -> Result<(), ConnectionError> {
    let ConnectionHandler { server, stream, addr, .. } = handler;
    let stream = stream.into_inner();
    let (_read_half, mut write_half) = stream.into_split();

    write_half.write_all(b"+OK\r\n").await?;
    info!(client = %addr, pos, "follower connected");
    crate::server::aof::stream_aof(server, &mut write_half, pos).await;
    Err(ConnectionError::Disconnected)
}

async fn write_payload(
    write_half: &mut OwnedWriteHalf,
    conn_type: ConnType,
    output: OutputType,
    payload: &[u8],
) -> Result<(), ConnectionError> {
    match conn_type {
        ConnType::WebSocket => {
            let framed = ws::text_frame(payload);
            write_half.write_all(&framed).await?;
        }
        _ => match output {
            OutputType::Json => {
                write_half.write_all(payload).await?;
                write_half.write_all(b"\r\n").await?;
            }
            OutputType::Resp => {
                write_half
                    .write_all(format!("${}\r\n", payload.len()).as_bytes())
                    .await?;
                write_half.write_all(payload).await?;
                write_half.write_all(b"\r\n").await?;
            }
        },
    }
    Ok(())
}

/// Flattens a parsed RESP value into command tokens.
fn resp_tokens(value: RespValue) -> Option<Vec<String>> {
    let arr = value.into_array()?;
    let mut tokens = Vec::with_capacity(arr.len());
    for item in arr {
        tokens.push(item.as_str()?.to_string());
    }
    Some(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerOptions;
    use tokio::net::TcpListener;

    async fn create_test_server(append_only: bool) -> (SocketAddr, Arc<Server>, tempfile::TempDir)
    {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = ServerOptions {
            dir: dir.path().to_path_buf(),
            append_only,
            dev: true,
            ..Default::default()
        };
        let server = Server::start(opts).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (addr, server, dir)
    }

    async fn roundtrip(stream: &mut TcpStream, send: &[u8]) -> Vec<u8> {
        stream.write_all(send).await.unwrap();
        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_ping() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let resp = roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n").await;
        assert_eq!(resp, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get_point() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let resp = roundtrip(&mut client, b"SET fleet truck1 POINT 33.5 -112.1\r\n").await;
        assert_eq!(resp, b"+OK\r\n");

        let resp = roundtrip(&mut client, b"GET fleet truck1 POINT\r\n").await;
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("33.5"), "{}", text);
        assert!(text.contains("-112.1"), "{}", text);
    }

    #[tokio::test]
    async fn test_get_json_output() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"SET fleet truck1 POINT 33.5 -112.1\r\n").await;
        roundtrip(&mut client, b"OUTPUT json\r\n").await;
        let resp = roundtrip(&mut client, b"GET fleet truck1 POINT\r\n").await;
        let text = String::from_utf8(resp).unwrap();
        assert!(
            text.contains(r#""point":{"lat":33.5,"lon":-112.1}"#),
            "{}",
            text
        );
        assert!(text.contains(r#""ok":true"#));
    }

    #[tokio::test]
    async fn test_nearby_includes_id() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"SET fleet truck1 POINT 33.5 -112.1\r\n").await;
        let resp = roundtrip(&mut client, b"NEARBY fleet POINT 33.5 -112.1 1000\r\n").await;
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("truck1"), "{}", text);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let resp = roundtrip(&mut client, b"*1\r\n$7\r\nNOTACMD\r\n").await;
        assert!(resp.starts_with(b"-ERR unknown command"));
    }

    #[tokio::test]
    async fn test_fset_withfields() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"SET k a FIELD speed 50 POINT 1 2\r\n").await;
        let resp = roundtrip(&mut client, b"FSET k a speed 90\r\n").await;
        assert_eq!(resp, b":1\r\n");

        roundtrip(&mut client, b"OUTPUT json\r\n").await;
        let resp = roundtrip(&mut client, b"GET k a WITHFIELDS\r\n").await;
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains(r#""fields":{"speed":90}"#), "{}", text);
    }

    #[tokio::test]
    async fn test_http_get_command() {
        let (addr, _server, _dir) = create_test_server(false).await;

        // seed over resp, query over http
        let mut seeder = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut seeder, b"SET fleet truck1 POINT 33.5 -112.1\r\n").await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let resp = roundtrip(
            &mut client,
            b"GET /get/fleet/truck1/point HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK"), "{}", text);
        assert!(text.contains(r#""ok":true"#), "{}", text);
        assert!(text.contains("33.5"), "{}", text);
    }

    #[tokio::test]
    async fn test_expire_then_gone() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"SET k a POINT 1 2\r\n").await;
        let resp = roundtrip(&mut client, b"EXPIRE k a 1\r\n").await;
        assert_eq!(resp, b":1\r\n");

        // ttl must be within (0, 1]
        let resp = roundtrip(&mut client, b"TTL k a\r\n").await;
        assert_eq!(resp, b":1\r\n");

        tokio::time::sleep(Duration::from_millis(1300)).await;
        roundtrip(&mut client, b"OUTPUT json\r\n").await;
        let resp = roundtrip(&mut client, b"GET k a\r\n").await;
        let text = String::from_utf8(resp).unwrap();
        assert!(
            text.contains("id not found") || text.contains("key not found"),
            "{}",
            text
        );
    }

    #[tokio::test]
    async fn test_pdel_children() {
        let (addr, _server, _dir) = create_test_server(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"SET k t1 POINT 1 1\r\n").await;
        roundtrip(&mut client, b"SET k t2 POINT 2 2\r\n").await;
        roundtrip(&mut client, b"SET k other POINT 3 3\r\n").await;

        let resp = roundtrip(&mut client, b"PDEL k t*\r\n").await;
        assert_eq!(resp, b":2\r\n");

        let resp = roundtrip(&mut client, b"GET k other OBJECT\r\n").await;
        assert!(!resp.starts_with(b"$-1"), "other must survive");
        let resp = roundtrip(&mut client, b"GET k t1\r\n").await;
        assert!(resp.starts_with(b"$-1"), "t1 must be gone");
    }

    #[tokio::test]
    async fn test_live_fence_receives_set() {
        let (addr, _server, _dir) = create_test_server(false).await;

        let mut live = TcpStream::connect(addr).await.unwrap();
        live.write_all(b"NEARBY fleet FENCE POINT 0 0 10000\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = live.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        let mut writer = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut writer, b"SET fleet t POINT 0.01 0.01\r\n").await;

        let n = tokio::time::timeout(Duration::from_secs(2), live.read(&mut buf))
            .await
            .expect("live payload should arrive")
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"detect\":\"inside\""), "{}", text);
        assert!(text.contains("\"id\":\"t\""), "{}", text);
    }

    #[tokio::test]
    async fn test_sethook_delivers_payload() {
        let (addr, _server, _dir) = create_test_server(false).await;

        // a one-shot http endpoint that records what it receives
        let endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint_port = endpoint.local_addr().unwrap().port();
        let received = tokio::spawn(async move {
            let (mut socket, _) = endpoint.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let cmd = format!(
            "SETHOOK h http://127.0.0.1:{}/hook NEARBY fleet FENCE POINT 0 0 10000\r\n",
            endpoint_port
        );
        let resp = roundtrip(&mut client, cmd.as_bytes()).await;
        assert_eq!(resp, b":1\r\n");

        roundtrip(&mut client, b"SET fleet t POINT 0.01 0.01\r\n").await;

        let request = tokio::time::timeout(Duration::from_secs(5), received)
            .await
            .expect("hook payload should be delivered")
            .unwrap();
        assert!(request.contains("\"detect\":\"inside\""), "{}", request);
        assert!(request.contains("\"id\":\"t\""), "{}", request);
        assert!(request.contains("\"hook\":\"h\""), "{}", request);
    }

    #[tokio::test]
    async fn test_hook_redelivers_after_endpoint_recovers() {
        let (addr, _server, _dir) = create_test_server(false).await;

        // reserve a port, then leave it closed while the first delivery
        // attempts fail
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let cmd = format!(
            "SETHOOK h http://127.0.0.1:{}/hook NEARBY fleet FENCE POINT 0 0 10000\r\n",
            port
        );
        roundtrip(&mut client, cmd.as_bytes()).await;
        roundtrip(&mut client, b"SET fleet t POINT 0.01 0.01\r\n").await;

        // let a few delivery attempts fail, then bring the endpoint up
        tokio::time::sleep(Duration::from_millis(600)).await;
        let endpoint = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let received = tokio::spawn(async move {
            let (mut socket, _) = endpoint.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let request = tokio::time::timeout(Duration::from_secs(5), received)
            .await
            .expect("payload should be redelivered within the queue ttl")
            .unwrap();
        assert!(request.contains("\"id\":\"t\""), "{}", request);
    }

    #[tokio::test]
    async fn test_client_kill_closes_connection() {
        let (addr, server, _dir) = create_test_server(false).await;
        let mut victim = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut victim, b"PING\r\n").await;

        // find the victim's id and kill it from another connection
        let id = {
            let conns = server.conns.lock().unwrap();
            *conns.keys().next().unwrap()
        };
        let mut killer = TcpStream::connect(addr).await.unwrap();
        let resp = roundtrip(&mut killer, format!("CLIENT KILL {}\r\n", id).as_bytes()).await;
        assert_eq!(resp, b"+OK\r\n");

        // the victim's next read observes the close
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), victim.read(&mut buf))
            .await
            .expect("victim should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
