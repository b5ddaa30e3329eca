//! The append-only file (C4/C5) and the leader side of replication.
//!
//! Every committed mutation is appended as a RESP multi-bulk record in the
//! exact shape of the originating command, in commit order. Startup replays
//! the file through the ordinary write handlers (with journaling disabled),
//! reconstructing collections, TTLs, and hooks.
//!
//! `AOF pos` turns a connection into a raw byte stream of the log from the
//! offset, tailing live writes; `AOFMD5 pos size` answers a checksum over a
//! byte range so a follower can verify its copy of the log.

use crate::protocol::{encode_multibulk, RespValue};
use crate::server::message::{tokenval, Message};
use crate::server::{elapsed, CmdError, Db, Server};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Chunk size for replay reads and follower streaming.
const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum AofError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt aof record: {0}")]
    Corrupt(String),

    #[error("replay failed on '{command}': {error}")]
    Replay { command: String, error: String },
}

/// Appends one record under the exclusive lock. The caller treats any
/// error as fatal: a partial journal would fork state on restart.
pub(crate) fn append_record(db: &mut Db, args: &[String]) -> std::io::Result<()> {
    let bytes = encode_multibulk(args);
    let file = db.aof.as_mut().expect("append_record requires an open aof");
    file.write_all(&bytes)?;
    db.aof_size += bytes.len() as u64;
    Ok(())
}

impl Server {
    /// Replays the log from the start, applying each record through the
    /// write handlers without re-journaling. Returns the record count.
    pub(crate) fn load_aof(&self, db: &mut Db) -> Result<usize, AofError> {
        let start = Instant::now();
        let mut file = match db.aof.take() {
            Some(file) => file,
            None => return Ok(0),
        };
        file.seek(SeekFrom::Start(0))?;

        let mut parser = crate::protocol::RespParser::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut count = 0usize;
        let mut total: u64 = 0;

        let result = loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                if buffer.is_empty() {
                    break Ok(());
                }
                break Err(AofError::Corrupt(
                    "trailing partial record at end of file".to_string(),
                ));
            }
            total += n as u64;
            buffer.extend_from_slice(&chunk[..n]);

            loop {
                match parser.parse(&buffer) {
                    Ok(Some((value, consumed))) => {
                        buffer.drain(..consumed);
                        let tokens = record_tokens(value)?;
                        let msg = Message::internal(tokens);
                        self.apply_replay(db, &msg).map_err(|e| AofError::Replay {
                            command: msg.command.clone(),
                            error: e.to_string(),
                        })?;
                        count += 1;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(AofError::Corrupt(e.to_string())),
                }
            }
        };

        // leave the handle at the end, ready for appends
        file.seek(SeekFrom::End(0))?;
        db.aof_size = total;
        db.aof = Some(file);
        result?;

        info!(
            records = count,
            bytes = total,
            elapsed = %elapsed(start),
            "aof loaded"
        );
        Ok(count)
    }

    /// Applies one replayed (or replicated) record. Mutates state and
    /// rebuilds hooks but performs no journaling or fan-out.
    pub(crate) fn apply_replay(&self, db: &mut Db, msg: &Message) -> Result<(), CmdError> {
        match msg.command.as_str() {
            "set" | "fset" | "del" | "pdel" | "drop" | "flushdb" | "sethook" | "delhook"
            | "pdelhook" | "expire" | "persist" | "jset" | "jdel" => {
                // replayed deletes of absent ids and similar no-ops are fine
                match self.write_command_for_replay(db, msg) {
                    Ok(()) => Ok(()),
                    Err(CmdError::KeyNotFound) | Err(CmdError::IdNotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            other => Err(CmdError::UnknownCommand(other.to_string())),
        }
    }

    fn write_command_for_replay(&self, db: &mut Db, msg: &Message) -> Result<(), CmdError> {
        let start = Instant::now();
        match msg.command.as_str() {
            "set" => self.cmd_set(db, msg, start).map(|_| ()),
            "fset" => self.cmd_fset(db, msg, start).map(|_| ()),
            "del" => self.cmd_del(db, msg, start).map(|_| ()),
            "pdel" => self.cmd_pdel(db, msg, start).map(|_| ()),
            "drop" => self.cmd_drop(db, msg, start).map(|_| ()),
            "flushdb" => self.cmd_flushdb(db, msg, start).map(|_| ()),
            "expire" => self.cmd_expire(db, msg, start).map(|_| ()),
            "persist" => self.cmd_persist(db, msg, start).map(|_| ()),
            "jset" => self.cmd_jset(db, msg, start).map(|_| ()),
            "jdel" => self.cmd_jdel(db, msg, start).map(|_| ()),
            "sethook" => self.cmd_sethook(db, msg, start).map(|_| ()),
            "delhook" => self.cmd_delhook(db, msg, start).map(|_| ()),
            "pdelhook" => self.cmd_pdelhook(db, msg, start).map(|_| ()),
            other => Err(CmdError::UnknownCommand(other.to_string())),
        }
    }

    /// `AOFMD5 pos size` — hex md5 over a byte range of the log.
    pub(crate) fn cmd_aofmd5(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, pos) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, size) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let pos: u64 = pos
            .parse()
            .map_err(|_| CmdError::InvalidArgument(pos.to_string()))?;
        let size: u64 = size
            .parse()
            .map_err(|_| CmdError::InvalidArgument(size.to_string()))?;
        if pos + size > db.aof_size {
            return Err(CmdError::other("pos+size is beyond the end of the aof"));
        }

        let mut file = std::fs::File::open(self.aof_path())
            .map_err(|e| CmdError::Other(e.to_string()))?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| CmdError::Other(e.to_string()))?;
        let mut body = vec![0u8; size as usize];
        file.read_exact(&mut body)
            .map_err(|e| CmdError::Other(e.to_string()))?;
        let digest = format!("{:x}", md5::compute(&body));

        match msg.output {
            crate::server::OutputType::Json => Ok(RespValue::bulk_string(format!(
                "{{\"ok\":true,\"md5\":\"{}\",\"elapsed\":\"{}\"}}",
                digest,
                elapsed(start)
            ))),
            crate::server::OutputType::Resp => Ok(RespValue::bulk_string(digest)),
        }
    }

    /// `AOF pos` — validates the offset; the connection layer switches into
    /// the raw streaming loop.
    pub(crate) fn cmd_aof(&self, db: &Db, msg: &Message) -> Result<u64, CmdError> {
        if db.aof.is_none() {
            return Err(CmdError::other("aof disabled"));
        }
        let vs = msg.tail();
        let (vs, pos) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let pos: u64 = pos
            .parse()
            .map_err(|_| CmdError::InvalidArgument(pos.to_string()))?;
        if pos > db.aof_size {
            return Err(CmdError::other("pos is beyond the end of the aof"));
        }
        Ok(pos)
    }
}

/// Streams the log from `pos` to a follower, then tails live commits until
/// the connection drops or the shrinker swaps the file out from under us
/// (the follower reconnects and re-tails from zero).
pub(crate) async fn stream_aof<W>(server: Arc<Server>, writer: &mut W, mut pos: u64)
where
    W: AsyncWriteExt + Unpin,
{
    let epoch = server.aof_epoch.load(Ordering::SeqCst);
    server.aof_followers.fetch_add(1, Ordering::SeqCst);
    let mut shutdown = server.shutdown_signal();

    let result: std::io::Result<()> = async {
        let mut file = std::fs::File::open(server.aof_path())?;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if server.aof_epoch.load(Ordering::SeqCst) != epoch {
                debug!("aof stream ended: file swapped by shrink");
                return Ok(());
            }
            if *shutdown.borrow() {
                return Ok(());
            }
            let n = file.read(&mut chunk)?;
            if n > 0 {
                writer.write_all(&chunk[..n]).await?;
                writer.flush().await?;
                pos += n as u64;
                continue;
            }
            // at the head: wait for the next commit
            tokio::select! {
                _ = server.aof_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
    .await;

    server.aof_followers.fetch_sub(1, Ordering::SeqCst);
    if let Err(e) = result {
        warn!(error = %e, "aof stream ended with error");
    }
}

/// Converts a parsed record into command tokens.
fn record_tokens(value: RespValue) -> Result<Vec<String>, AofError> {
    let arr = value
        .into_array()
        .ok_or_else(|| AofError::Corrupt("record is not an array".to_string()))?;
    let mut tokens = Vec::with_capacity(arr.len());
    for item in arr {
        match item.as_str() {
            Some(s) => tokens.push(s.to_string()),
            None => return Err(AofError::Corrupt("record token is not a string".to_string())),
        }
    }
    if tokens.is_empty() {
        return Err(AofError::Corrupt("empty record".to_string()));
    }
    Ok(tokens)
}
