//! The live query multiplexer (C9).
//!
//! A connection that issues a fence search is upgraded into a long-lived
//! subscriber: it registers a bounded channel here, and every committed
//! mutation is broadcast to all channels. The send never blocks the writer
//! — a subscriber that cannot keep up has its channel overflow and is
//! dropped, closing its connection, rather than stalling commits.
//!
//! Fence evaluation happens on the subscriber's own task (it needs no
//! lock; the details record carries old and new objects), so a slow fence
//! only penalizes its own connection.

use crate::server::CommandDetails;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel depth per subscriber. At typical payload rates this is a few
/// seconds of slack before the slowest-subscriber drop kicks in.
const CHANNEL_CAPACITY: usize = 128;

/// The set of live subscriber channels.
#[derive(Debug, Default)]
pub struct LiveHub {
    subs: Mutex<HashMap<u64, mpsc::Sender<Arc<CommandDetails>>>>,
    next_id: AtomicU64,
}

impl LiveHub {
    pub fn new() -> LiveHub {
        LiveHub::default()
    }

    /// Registers a new subscriber, returning its id and receive side.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<CommandDetails>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subs.lock().unwrap().insert(id, tx);
        debug!(subscriber = id, "live subscriber registered");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subs.lock().unwrap().remove(&id).is_some() {
            debug!(subscriber = id, "live subscriber removed");
        }
    }

    pub fn count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Pushes a committed mutation to every subscriber. Full or closed
    /// channels drop their subscriber on the spot.
    pub fn broadcast(&self, details: Arc<CommandDetails>) {
        let mut dead: Vec<u64> = Vec::new();
        let mut subs = self.subs.lock().unwrap();
        for (&id, tx) in subs.iter() {
            if tx.try_send(Arc::clone(&details)).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            subs.remove(&id);
            warn!(subscriber = id, "live subscriber dropped (overflow or gone)");
        }
    }

    /// Drops every subscriber channel; their connection loops observe the
    /// closed receiver and finish.
    pub fn close_all(&self) {
        self.subs.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> Arc<CommandDetails> {
        Arc::new(CommandDetails {
            command: "set".to_string(),
            updated: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_subscribe_and_broadcast() {
        let hub = LiveHub::new();
        let (_id, mut rx) = hub.subscribe();
        assert_eq!(hub.count(), 1);

        hub.broadcast(details());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.command, "set");
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = LiveHub::new();
        let (id, mut rx) = hub.subscribe();
        hub.unsubscribe(id);
        assert_eq!(hub.count(), 0);

        hub.broadcast(details());
        assert!(rx.recv().await.is_none() || rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overflow_drops_subscriber() {
        let hub = LiveHub::new();
        let (_id, rx) = hub.subscribe();
        // never drain; capacity + 1 sends must evict the subscriber
        for _ in 0..(CHANNEL_CAPACITY + 1) {
            hub.broadcast(details());
        }
        assert_eq!(hub.count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn test_close_all() {
        let hub = LiveHub::new();
        let (_a, mut rx_a) = hub.subscribe();
        let (_b, _rx_b) = hub.subscribe();
        hub.close_all();
        assert_eq!(hub.count(), 0);
        assert!(rx_a.recv().await.is_none());
    }
}
