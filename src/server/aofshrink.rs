//! Online AOF compaction (C6).
//!
//! The shrinker rewrites the log into a minimal equivalent — one idempotent
//! `SET` per live object, one `SETHOOK` per hook — while the server keeps
//! serving writes. It works in four phases:
//!
//! ```text
//! idle → copying → draining → swapping → idle
//! ```
//!
//! *copying*: walk collections in key order, taking the exclusive lock only
//! for small batches (8 keys outer, 32 ids inner) so foreground writes
//! interleave. While `shrinking` is set, the router mirrors every committed
//! mutation into the in-memory `shrink_log` tail.
//!
//! *draining*: flush the copy buffer whenever it passes 4 MiB; at the end,
//! re-acquire the lock, append the accumulated tail, and fsync.
//!
//! *swapping* (under the exclusive lock): close the live file, rename
//! live → `.bak`, rename shrink → live, reopen, seek to the end, reset the
//! size counter, delete the backup, and bump the AOF epoch so follower
//! streams reconnect and re-tail from offset zero.
//!
//! Any error before the swap aborts the shrink and leaves the live AOF
//! untouched. An error after the live file is closed is unrecoverable: the
//! process logs and exits, and the next start replays whichever file the
//! rename sequence left in place.

use crate::geojson::Object;
use crate::protocol::{encode_multibulk, format_float};
use crate::server::Server;
use chrono::Utc;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

const MAX_KEYS_PER_BATCH: usize = 8;
const MAX_IDS_PER_BATCH: usize = 32;
const MAX_CHUNK: usize = 4 * 1024 * 1024;

/// Runs one full shrink. Starting a second shrink while one is active is a
/// no-op.
pub(crate) async fn aof_shrink(server: Arc<Server>) {
    let start = Instant::now();
    {
        let mut db = server.db.write().await;
        if db.aof.is_none() || db.shrinking {
            return;
        }
        db.shrinking = true;
        db.shrink_log.clear();
    }
    info!("aof shrink started");

    let result = shrink_and_swap(&server).await;

    {
        let mut db = server.db.write().await;
        db.shrinking = false;
        db.shrink_log.clear();
    }
    server
        .stats
        .last_shrink_millis
        .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    match result {
        Ok(()) => info!(elapsed = ?start.elapsed(), "aof shrink ended"),
        Err(e) => error!(error = %e, "aof shrink failed"),
    }
}

async fn shrink_and_swap(server: &Arc<Server>) -> std::io::Result<()> {
    let shrink_path = server.opts.dir.join("appendonly.aof-shrink");
    let bak_path = server.opts.dir.join("appendonly.aof-bak");
    let live_path = server.aof_path();
    let mut file = std::fs::File::create(&shrink_path)?;
    let mut buf: Vec<u8> = Vec::new();

    // ----- copying: collections in key order, small locked batches
    let mut next_key: Option<String> = None;
    loop {
        let keys: Vec<String> = {
            let db = server.db.write().await;
            let lower = match &next_key {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            db.cols
                .range((lower, Bound::Unbounded))
                .take(MAX_KEYS_PER_BATCH)
                .map(|(key, _)| key.clone())
                .collect()
        };
        let Some(last) = keys.last() else {
            break;
        };
        next_key = Some(last.clone());

        for key in &keys {
            let mut next_id = String::new();
            loop {
                let mut records: Vec<Vec<String>> = Vec::new();
                let mut ids_done = true;
                {
                    let db = server.db.write().await;
                    let col = match db.get_col(key) {
                        Some(col) => col,
                        // dropped since the key batch was taken
                        None => break,
                    };
                    let field_names = col.field_arr().to_vec();
                    let expires = db.expires.get(key);
                    let now = Utc::now();
                    let mut count = 0usize;
                    let pivot = next_id.clone();
                    col.scan_greater_or_equal(&pivot, |id, obj, fields| {
                        if count == MAX_IDS_PER_BATCH {
                            next_id = id.to_string();
                            ids_done = false;
                            return false;
                        }
                        let mut values: Vec<String> =
                            vec!["set".to_string(), key.clone(), id.to_string()];
                        for (idx, &value) in fields.iter().enumerate() {
                            if value != 0.0 {
                                if let Some(name) = field_names.get(idx) {
                                    values.push("field".to_string());
                                    values.push(name.clone());
                                    values.push(format_float(value));
                                }
                            }
                        }
                        if let Some(at) = expires.and_then(|ids| ids.get(id)) {
                            let remaining =
                                (*at - now).num_milliseconds() as f64 / 1000.0;
                            // round down to 0.1s; omit when already due
                            let remaining = (remaining * 10.0).floor() / 10.0;
                            if remaining > 0.0 {
                                values.push("ex".to_string());
                                values.push(format_float(remaining));
                            }
                        }
                        push_object_clause(&mut values, obj);
                        records.push(values);
                        count += 1;
                        true
                    });
                }
                for record in &records {
                    buf.extend_from_slice(&encode_multibulk(record));
                }
                if buf.len() > MAX_CHUNK {
                    file.write_all(&buf)?;
                    buf.clear();
                }
                if ids_done {
                    break;
                }
            }
        }
    }

    // ----- hooks, in name order
    let hook_records: Vec<Vec<String>> = {
        let db = server.db.write().await;
        let mut names: Vec<&String> = db.hooks.keys().collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| db.hooks.get(*name))
            .map(|hook| {
                let mut values = vec![
                    "sethook".to_string(),
                    hook.name.clone(),
                    hook.endpoints.join(","),
                ];
                for (mkey, mval) in &hook.metas {
                    values.push("meta".to_string());
                    values.push(mkey.clone());
                    values.push(mval.clone());
                }
                values.extend(hook.message.iter().cloned());
                values
            })
            .collect()
    };
    for record in &hook_records {
        buf.extend_from_slice(&encode_multibulk(record));
    }
    if !buf.is_empty() {
        file.write_all(&buf)?;
        buf.clear();
    }
    file.sync_data()?;

    // ----- draining + swapping, under the exclusive lock
    let mut db = server.db.write().await;
    let tail = std::mem::take(&mut db.shrink_log);
    for values in &tail {
        buf.extend_from_slice(&encode_multibulk(values));
    }
    file.write_all(&buf)?;
    file.sync_data()?;

    // the shrink file now matches the dataset exactly; everything past the
    // close of the live file is unrecoverable on error
    drop(file);
    let live = db.aof.take().expect("shrink requires an open aof");
    drop(live);

    if let Err(e) = std::fs::rename(&live_path, &bak_path) {
        error!(error = %e, "fatal: shrink backup rename failed");
        std::process::exit(1);
    }
    if let Err(e) = std::fs::rename(&shrink_path, &live_path) {
        error!(error = %e, "fatal: shrink swap rename failed");
        std::process::exit(1);
    }
    let mut reopened = match std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&live_path)
    {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, "fatal: shrink reopen failed");
            std::process::exit(1);
        }
    };
    let size = match reopened.seek(SeekFrom::End(0)) {
        Ok(size) => size,
        Err(e) => {
            error!(error = %e, "fatal: shrink seek failed");
            std::process::exit(1);
        }
    };
    db.aof = Some(reopened);
    db.aof_size = size;
    let _ = std::fs::remove_file(&bak_path);

    // follower streams re-tail the new file from offset zero
    server.aof_epoch.fetch_add(1, Ordering::SeqCst);
    server.aof_notify.notify_waiters();
    Ok(())
}

/// Appends the geometry clause of an idempotent `SET` record.
fn push_object_clause(values: &mut Vec<String>, obj: &Object) {
    match obj {
        Object::SimplePoint(p) => {
            values.push("point".to_string());
            values.push(format_float(p.lat()));
            values.push(format_float(p.lon()));
        }
        Object::Point { pos, bbox: None } if pos.z != 0.0 => {
            values.push("point".to_string());
            values.push(format_float(pos.lat()));
            values.push(format_float(pos.lon()));
            values.push(format_float(pos.z));
        }
        Object::Str(s) => {
            values.push("string".to_string());
            values.push(s.clone());
        }
        other => {
            values.push("object".to_string());
            values.push(other.json());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geojson::Position;
    use crate::server::{Message, ServerOptions};

    async fn apply(server: &Server, tokens: &[&str]) {
        let msg = Message::internal(tokens.iter().map(|s| s.to_string()).collect());
        let mut db = server.db.write().await;
        server.apply_internal(&mut db, &msg).unwrap();
    }

    #[tokio::test]
    async fn test_shrink_compacts_and_preserves_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = ServerOptions {
            dir: dir.path().to_path_buf(),
            append_only: true,
            ..Default::default()
        };
        let server = Server::start(opts.clone()).await.unwrap();

        // churn: rewrite the same id many times, create-and-delete another
        for i in 0..50 {
            apply(
                &server,
                &["set", "k", "a", "POINT", &format!("{}", i % 10), "2"],
            )
            .await;
        }
        apply(&server, &["set", "k", "gone", "POINT", "1", "1"]).await;
        apply(&server, &["del", "k", "gone"]).await;

        let before = server.db.read().await.aof_size;
        aof_shrink(Arc::clone(&server)).await;
        let after = server.db.read().await.aof_size;
        assert!(after < before, "shrink must compact ({} -> {})", before, after);
        assert!(!server.db.read().await.shrinking);

        // replaying the compacted log reproduces the live state
        server.stop();
        let replayed = Server::start(opts).await.unwrap();
        let db = replayed.db.read().await;
        let col = db.get_col("k").expect("collection must survive shrink");
        assert_eq!(col.count(), 1);
        assert!(col.get("gone").is_none());
        assert_eq!(col.get("a").unwrap().obj.calculated_point().lat(), 9.0);
    }

    #[tokio::test]
    async fn test_shrink_is_single_flight() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = Server::start(ServerOptions {
            dir: dir.path().to_path_buf(),
            append_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
        apply(&server, &["set", "k", "a", "POINT", "1", "2"]).await;

        server.db.write().await.shrinking = true;
        // a second shrink while one is marked active must be a no-op
        aof_shrink(Arc::clone(&server)).await;
        assert!(server.db.read().await.shrinking, "no-op must not clear the flag");
        server.db.write().await.shrinking = false;
    }

    #[test]
    fn test_object_clause_simple_point() {
        let mut values = Vec::new();
        push_object_clause(
            &mut values,
            &Object::SimplePoint(Position::from_latlon(33.5, -112.1)),
        );
        assert_eq!(values, vec!["point", "33.5", "-112.1"]);
    }

    #[test]
    fn test_object_clause_string() {
        let mut values = Vec::new();
        push_object_clause(&mut values, &Object::Str("hello".to_string()));
        assert_eq!(values, vec!["string", "hello"]);
    }

    #[test]
    fn test_object_clause_geometry() {
        let mut values = Vec::new();
        let obj = Object::parse_json(r#"{"type":"Point","coordinates":[1,2]}"#).unwrap();
        push_object_clause(&mut values, &obj);
        assert_eq!(values[0], "object");
        assert_eq!(values[1], r#"{"type":"Point","coordinates":[1,2]}"#);
    }

    #[test]
    fn test_object_clause_point_with_z() {
        let mut values = Vec::new();
        push_object_clause(
            &mut values,
            &Object::Point {
                pos: Position::new(-112.1, 33.5, 250.0),
                bbox: None,
            },
        );
        assert_eq!(values, vec!["point", "33.5", "-112.1", "250"]);
    }
}
