//! Background maintenance loops (C12).
//!
//! | loop            | period | action                                      |
//! |-----------------|--------|---------------------------------------------|
//! | expirer         | 100 ms | delete due deadlines via the write path     |
//! | memory watcher  | 2 s    | set the OOM flag from approximate usage     |
//! | auto-GC         | 1 s    | periodic queue/cache trim when `autogc` set |
//! | script pruner   | 10 s   | reclaim idle script interpreters            |
//!
//! Every loop checks the shutdown signal each iteration and never holds
//! the main lock across its sleep.

use crate::server::Server;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info};

const EXPIRER_PERIOD: Duration = Duration::from_millis(100);
const MEMORY_PERIOD: Duration = Duration::from_secs(2);
const AUTOGC_PERIOD: Duration = Duration::from_secs(1);
const SCRIPT_PRUNE_PERIOD: Duration = Duration::from_secs(10);

/// Spawns all four loops. They stop when the server's shutdown signal
/// fires.
pub(crate) fn spawn_loops(server: &Arc<Server>) {
    tokio::spawn(expirer_loop(Arc::clone(server)));
    tokio::spawn(memory_loop(Arc::clone(server)));
    tokio::spawn(autogc_loop(Arc::clone(server)));
    tokio::spawn(script_prune_loop(Arc::clone(server)));
}

async fn expirer_loop(server: Arc<Server>) {
    let mut tick = interval(EXPIRER_PERIOD);
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = tick.tick() => server.expire_tick().await,
            _ = shutdown.changed() => return,
        }
    }
}

/// Sets the out-of-memory flag whenever the approximate data-plane weight
/// exceeds `maxmemory`. Writes are refused with an OOM error while set.
async fn memory_loop(server: Arc<Server>) {
    let mut tick = interval(MEMORY_PERIOD);
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let max = server.config.max_memory();
                if max == 0 {
                    server.out_of_memory.store(false, Ordering::SeqCst);
                    continue;
                }
                let used = server.db.read().await.memory_weight();
                let oom = used > max;
                if oom != server.out_of_memory.load(Ordering::SeqCst) {
                    info!(used, max, oom, "memory watcher state change");
                }
                server.out_of_memory.store(oom, Ordering::SeqCst);
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// When `autogc` is configured, trims reclaimable state every `autogc`
/// seconds: expired queue rows and the expirer's slack capacity.
async fn autogc_loop(server: Arc<Server>) {
    let mut tick = interval(AUTOGC_PERIOD);
    let mut shutdown = server.shutdown_signal();
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let autogc = server.config.auto_gc();
                if autogc == 0 {
                    continue;
                }
                if last.elapsed() < Duration::from_secs(autogc) {
                    continue;
                }
                let before = server.db.read().await.memory_weight();
                let purged = server.queue.purge_expired().unwrap_or(0);
                let after = server.db.read().await.memory_weight();
                debug!(before, after, purged, "autogc pass");
                last = Instant::now();
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn script_prune_loop(server: Arc<Server>) {
    let mut tick = interval(SCRIPT_PRUNE_PERIOD);
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = tick.tick() => server.scripts.prune(),
            _ = shutdown.changed() => return,
        }
    }
}
