//! The expiration index and expirer (C3).
//!
//! Deadlines live in two places: the authoritative per-collection map in
//! `Db.expires` (always consistent with the collections, invariant I1) and
//! a flat, lazily-sorted list the expirer scans. The list may hold stale
//! entries — a `PERSIST` or a re-`EXPIRE` does not search it — so every
//! candidate is re-verified against the authoritative map under the write
//! lock before the delete fires.
//!
//! Expiration deletes are synthetic `DEL key id` commands issued through
//! the ordinary write path, so they are journaled, replicated, and
//! broadcast exactly like client deletes.

use crate::server::{Db, Message, Server};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use tracing::debug;

/// Most deadlines processed per expirer tick; a burst of simultaneous
/// deadlines spreads over consecutive ticks.
const MAX_PER_TICK: usize = 256;

/// One pending deadline in the expirer's flat view.
#[derive(Debug, Clone)]
pub struct ExItem {
    pub key: String,
    pub id: String,
    pub at: DateTime<Utc>,
}

/// The expirer's time-ordered snapshot list.
#[derive(Debug, Default)]
pub struct ExpireList {
    items: Vec<ExItem>,
    sorted: bool,
}

impl ExpireList {
    pub fn new() -> ExpireList {
        ExpireList::default()
    }

    pub fn push(&mut self, item: ExItem) {
        self.items.push(item);
        self.sorted = false;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.sorted = true;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes and returns up to `max` entries due at or before `now`,
    /// sorting lazily first.
    pub fn take_due(&mut self, now: DateTime<Utc>, max: usize) -> Vec<ExItem> {
        if self.items.is_empty() {
            return Vec::new();
        }
        if !self.sorted {
            self.items.sort_by_key(|item| item.at);
            self.sorted = true;
        }
        let due = self
            .items
            .iter()
            .take_while(|item| item.at <= now)
            .take(max)
            .count();
        self.items.drain(..due).collect()
    }
}

impl Server {
    /// Installs (or replaces) a deadline for `(key, id)`.
    pub(crate) fn set_expire(
        &self,
        db: &mut Db,
        key: &str,
        id: &str,
        at: DateTime<Utc>,
    ) {
        db.expires
            .entry(key.to_string())
            .or_default()
            .insert(id.to_string(), at);
        self.exlist.lock().unwrap().push(ExItem {
            key: key.to_string(),
            id: id.to_string(),
            at,
        });
    }

    /// Drops the deadline for `(key, id)`, if any. Stale expirer-list
    /// entries are left behind and die at verification time.
    pub(crate) fn clear_expire(&self, db: &mut Db, key: &str, id: &str) {
        if let Some(ids) = db.expires.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                db.expires.remove(key);
            }
        }
    }

    /// Drops every deadline under a collection key (DROP path).
    pub(crate) fn clear_key_expires(&self, db: &mut Db, key: &str) {
        db.expires.remove(key);
    }

    pub(crate) fn get_expire(&self, db: &Db, key: &str, id: &str) -> Option<DateTime<Utc>> {
        db.expires.get(key).and_then(|ids| ids.get(id)).copied()
    }

    /// Rebuilds the expirer's flat list from the authoritative map. Called
    /// once after the AOF replay.
    pub(crate) fn fill_expires_list(&self, db: &Db) {
        let mut list = self.exlist.lock().unwrap();
        list.clear();
        for (key, ids) in &db.expires {
            for (id, at) in ids {
                list.push(ExItem {
                    key: key.clone(),
                    id: id.clone(),
                    at: *at,
                });
            }
        }
    }

    /// One expirer pass: collect due candidates, then re-verify and delete
    /// each under the write lock through the normal write path.
    pub(crate) async fn expire_tick(&self) {
        if !self.config.follow_host().is_empty() {
            // a follower replays the leader's expiration deletes instead of
            // firing its own
            return;
        }
        let now = Utc::now();
        let candidates = {
            let mut list = self.exlist.lock().unwrap();
            list.take_due(now, MAX_PER_TICK)
        };
        if candidates.is_empty() {
            return;
        }

        let mut db = self.db.write().await;
        for item in candidates {
            // the deadline may have been cleared or pushed out since the
            // snapshot entry was created
            let live = self
                .get_expire(&db, &item.key, &item.id)
                .map(|at| at <= now)
                .unwrap_or(false);
            if !live {
                continue;
            }
            let msg = Message::internal(vec![
                "del".to_string(),
                item.key.clone(),
                item.id.clone(),
            ]);
            match self.apply_internal(&mut db, &msg) {
                Ok(_) => {
                    self.stats.expired.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %item.key, id = %item.id, "expired");
                }
                Err(e) => {
                    debug!(key = %item.key, id = %item.id, error = %e, "expire delete failed");
                }
            }
        }
    }
}
