//! The replication follow client (C7).
//!
//! `FOLLOW host port` points this server at a leader; `FOLLOW none` clears
//! it. While following, client writes are refused with "not the leader"
//! and reads are refused with "catching up to leader" until the tail
//! reaches the byte position the leader reported at connect time.
//!
//! The follower requests `AOF <local size>` and applies the raw record
//! stream through the ordinary write path, so replicated mutations are
//! re-journaled locally, fence-matched against local hooks, and broadcast
//! to local live subscribers. Every `FOLLOW` reconfiguration bumps a
//! generation counter; a follow task that observes a newer generation
//! exits, so at most one tail is ever live.

use crate::protocol::{encode_multibulk, RespParser, RespValue};
use crate::server::message::{tokenval, Message};
use crate::server::{CmdError, Server};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

impl Server {
    /// `FOLLOW host port` / `FOLLOW none`.
    pub(crate) fn cmd_follow(
        self: &Arc<Self>,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, host) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;

        if host.eq_ignore_ascii_case("none") {
            if !vs.is_empty() {
                return Err(CmdError::InvalidNumArgs);
            }
            self.config.set_follow("", 0);
            let _ = self.config.save();
            self.followc.fetch_add(1, Ordering::SeqCst);
            self.fcup.store(false, Ordering::SeqCst);
            self.fcuponce.store(false, Ordering::SeqCst);
            info!("following no one");
            return Ok(self.ok_message(msg, start));
        }

        let (vs, port) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let port: u64 = port
            .parse()
            .map_err(|_| CmdError::InvalidArgument(port.to_string()))?;
        if port == 0 || port > u16::MAX as u64 {
            return Err(CmdError::InvalidArgument(port.to_string()));
        }
        let host = host.to_string();

        self.config.set_follow(&host, port);
        let _ = self.config.save();
        self.fcup.store(false, Ordering::SeqCst);
        self.fcuponce.store(false, Ordering::SeqCst);
        let generation = self.followc.fetch_add(1, Ordering::SeqCst) + 1;
        info!(leader = %format!("{}:{}", host, port), "following");
        tokio::spawn(follow_loop(Arc::clone(self), host, port, generation));
        Ok(self.ok_message(msg, start))
    }

    /// Applies one replicated record through the ordinary write path.
    pub(crate) async fn apply_follow(&self, tokens: Vec<String>) -> Result<(), CmdError> {
        let msg = Message::internal(tokens);
        let mut db = self.db.write().await;
        self.apply_internal(&mut db, &msg)?;
        Ok(())
    }
}

/// The outbound tail task. Reconnects with capped exponential backoff and
/// self-exits once its generation is superseded.
pub(crate) async fn follow_loop(server: Arc<Server>, host: String, port: u64, generation: u64) {
    let mut backoff = BACKOFF_MIN;
    let mut shutdown = server.shutdown_signal();
    loop {
        if server.followc.load(Ordering::SeqCst) != generation || *shutdown.borrow() {
            debug!("follow task superseded; exiting");
            return;
        }
        match follow_once(&server, &host, port, generation).await {
            Ok(()) => backoff = BACKOFF_MIN,
            Err(e) => {
                warn!(leader = %format!("{}:{}", host, port), error = %e, "follow error");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn follow_once(
    server: &Arc<Server>,
    host: &str,
    port: u64,
    generation: u64,
) -> Result<(), FollowError> {
    let mut stream = TcpStream::connect((host, port as u16)).await?;
    let mut buffer: Vec<u8> = Vec::new();

    // authenticate against the leader when required
    let leaderauth = server.config.leader_auth();
    if !leaderauth.is_empty() {
        send_command(&mut stream, &["auth".to_string(), leaderauth]).await?;
        let value = read_value(&mut stream, &mut buffer).await?;
        if value.is_error() {
            return Err(FollowError::Refused(format!("{}", value)));
        }
    }

    // learn how far the leader's log reaches right now
    send_command(&mut stream, &["server".to_string()]).await?;
    let stats = read_value(&mut stream, &mut buffer).await?;
    let leader_size = server_stat(&stats, "aof_size")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| FollowError::Refused("leader did not report aof_size".to_string()))?;

    // tail from wherever our own journal already reaches
    let pos = server.db.read().await.aof_size;
    let pos = pos.min(leader_size);
    send_command(&mut stream, &["aof".to_string(), pos.to_string()]).await?;
    let ack = read_value(&mut stream, &mut buffer).await?;
    if ack.is_error() {
        return Err(FollowError::Refused(format!("{}", ack)));
    }
    info!(pos, leader_size, "follow stream established");
    server.config.set_follow_pos(pos);
    let _ = server.config.save();

    let mut consumed = pos;
    let mut parser = RespParser::new();
    let mut chunk = [0u8; 4096];
    loop {
        if server.followc.load(Ordering::SeqCst) != generation {
            return Ok(());
        }
        // drain complete records already buffered
        loop {
            match parser.parse(&buffer) {
                Ok(Some((value, used))) => {
                    buffer.drain(..used);
                    consumed += used as u64;
                    let tokens = match value.into_array() {
                        Some(arr) => arr
                            .into_iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect::<Vec<_>>(),
                        None => {
                            return Err(FollowError::Protocol(
                                "replication record is not an array".to_string(),
                            ))
                        }
                    };
                    if tokens.is_empty() {
                        return Err(FollowError::Protocol("empty record".to_string()));
                    }
                    if let Err(e) = server.apply_follow(tokens).await {
                        warn!(error = %e, "replicated command failed");
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(FollowError::Protocol(e.to_string())),
            }
        }
        if consumed >= leader_size && !server.fcup.load(Ordering::SeqCst) {
            server.fcup.store(true, Ordering::SeqCst);
            server.fcuponce.store(true, Ordering::SeqCst);
            info!("caught up to leader");
        }
        server.config.set_follow_pos(consumed);

        let n = tokio::select! {
            read = stream.read(&mut chunk) => read?,
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
        };
        if n == 0 {
            return Err(FollowError::Protocol("leader closed the stream".to_string()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[derive(Debug, thiserror::Error)]
enum FollowError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("leader refused: {0}")]
    Refused(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

async fn send_command(stream: &mut TcpStream, tokens: &[String]) -> std::io::Result<()> {
    stream.write_all(&encode_multibulk(tokens)).await?;
    stream.flush().await
}

/// Reads one complete RESP value from the stream.
async fn read_value(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
) -> Result<RespValue, FollowError> {
    let mut parser = RespParser::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some((value, used)) = parser
            .parse(buffer)
            .map_err(|e| FollowError::Protocol(e.to_string()))?
        {
            buffer.drain(..used);
            return Ok(value);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(FollowError::Protocol("connection closed".to_string()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Pulls a named value out of the RESP `SERVER` pair array.
fn server_stat(value: &RespValue, name: &str) -> Option<String> {
    let arr = value.as_array()?;
    let mut i = 0;
    while i + 1 < arr.len() {
        if arr[i].as_str() == Some(name) {
            return arr[i + 1].as_str().map(str::to_string);
        }
        i += 2;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::{ConnType, OutputType};
    use crate::server::{Reply, ServerOptions};
    use bytes::Bytes;

    async fn start_server(dir: &std::path::Path) -> Arc<Server> {
        Server::start(ServerOptions {
            dir: dir.to_path_buf(),
            append_only: true,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    async fn send(server: &Arc<Server>, client: &Arc<crate::server::ClientInfo>, line: &str) -> Reply {
        let tokens = line.split_whitespace().map(str::to_string).collect();
        let mut msg = Message::new(tokens, OutputType::Resp, ConnType::Resp);
        server.handle_message(client, &mut msg).await
    }

    #[tokio::test]
    async fn test_follow_replicates_leader_writes() {
        let leader_dir = tempfile::TempDir::new().unwrap();
        let leader = start_server(leader_dir.path()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let leader_addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&leader).serve(listener));

        let leader_client = leader.register_client("test".to_string());
        send(&leader, &leader_client, "SET fleet truck1 POINT 33.5 -112.1").await;

        let follower_dir = tempfile::TempDir::new().unwrap();
        let follower = start_server(follower_dir.path()).await;
        let follower_client = follower.register_client("test".to_string());
        send(
            &follower,
            &follower_client,
            &format!("FOLLOW 127.0.0.1 {}", leader_addr.port()),
        )
        .await;

        // writes are refused while following
        let reply = send(&follower, &follower_client, "SET fleet x POINT 1 1").await;
        match reply {
            Reply::Body(body) => {
                let text = String::from_utf8_lossy(&body);
                assert!(text.contains("not the leader"), "{}", text);
            }
            _ => panic!("expected an error body"),
        }

        // the catch-up flag rises and the leader's data appears
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if follower.fcuponce.load(Ordering::SeqCst) {
                let db = follower.db.read().await;
                if db
                    .get_col("fleet")
                    .map(|col| col.get("truck1").is_some())
                    .unwrap_or(false)
                {
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "follower never caught up"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // a post-catch-up write on the leader also arrives
        send(&leader, &leader_client, "SET fleet truck2 POINT 1 2").await;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let db = follower.db.read().await;
                if db
                    .get_col("fleet")
                    .map(|col| col.get("truck2").is_some())
                    .unwrap_or(false)
                {
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "live tail never delivered truck2"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        follower.stop();
        leader.stop();
    }

    #[test]
    fn test_server_stat_lookup() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("id")),
            RespValue::bulk_string(Bytes::from("abc")),
            RespValue::bulk_string(Bytes::from("aof_size")),
            RespValue::bulk_string(Bytes::from("12345")),
        ]);
        assert_eq!(server_stat(&value, "aof_size"), Some("12345".to_string()));
        assert_eq!(server_stat(&value, "id"), Some("abc".to_string()));
        assert_eq!(server_stat(&value, "missing"), None);
    }
}
