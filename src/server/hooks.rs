//! Geofence hooks (C8): registration, matching, and delivery.
//!
//! A hook is a named, persistent fence subscription. `SETHOOK` validates
//! the endpoints, parses the embedded fence search, and installs the hook;
//! every committed write on the hook's key is then fence-matched and the
//! resulting payloads are enqueued into the durable queue. Each hook owns
//! one delivery task that drains its queue in order and tries endpoints
//! until one accepts, retrying every quarter second until the payload's
//! 30-second TTL lapses.
//!
//! Replacing a hook with a structurally equal definition (same key,
//! endpoints, metas, and command tokens) reuses the existing hook and just
//! signals its delivery task.

use crate::endpoint;
use crate::protocol::RespValue;
use crate::queue::HookQueue;
use crate::server::fence;
use crate::server::message::{tokenval, Message, OutputType};
use crate::server::search::SearchArgs;
use crate::server::{elapsed, json_string, CmdError, CommandDetails, Db, Server};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Queue TTL for hook payloads. An endpoint down for longer loses events.
pub const HOOK_QUEUE_TTL: Duration = Duration::from_secs(30);

/// Retry cadence when delivery is failing.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// A registered geofence hook.
pub struct Hook {
    pub name: String,
    /// The collection key the fence watches.
    pub key: String,
    pub endpoints: Vec<String>,
    /// Sorted by name for canonical equality.
    pub metas: Vec<(String, String)>,
    /// The frozen fence command tokens, starting at the search verb.
    pub message: Vec<String>,
    pub fence: SearchArgs,
    /// Fence group ids per object id (see `fence::fence_match`).
    pub(crate) groups: std::sync::Mutex<HashMap<String, String>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Hook {
    fn new(
        name: String,
        key: String,
        endpoints: Vec<String>,
        metas: Vec<(String, String)>,
        message: Vec<String>,
        fence: SearchArgs,
    ) -> Hook {
        Hook {
            name,
            key,
            endpoints,
            metas,
            message,
            fence,
            groups: std::sync::Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Structural equality: same key, endpoints (ordered), metas (sorted),
    /// and command tokens.
    pub fn equals(&self, other: &Hook) -> bool {
        self.name == other.name
            && self.key == other.key
            && self.endpoints == other.endpoints
            && self.metas == other.metas
            && self.message == other.message
    }

    /// Wakes the delivery task; there may be something new in the queue.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Stops the delivery task. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawns the delivery task for this hook.
    pub(crate) fn open(
        self: &Arc<Self>,
        queue: Arc<HookQueue>,
        epm: Arc<endpoint::Manager>,
    ) {
        let hook = Arc::clone(self);
        tokio::spawn(async move {
            delivery_loop(hook, queue, epm).await;
        });
    }
}

/// The per-hook delivery loop: wake on signal or retry tick, drain the
/// queue in a transaction, attempt delivery outside it, reinsert the
/// undelivered tail on failure.
async fn delivery_loop(hook: Arc<Hook>, queue: Arc<HookQueue>, epm: Arc<endpoint::Manager>) {
    loop {
        if hook.is_closed() {
            return;
        }
        let all_sent = process_pending(&hook, &queue, &epm).await;
        if hook.is_closed() {
            return;
        }
        if all_sent {
            hook.notify.notified().await;
        } else {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

/// Drains and delivers until the queue is empty. Returns false when an
/// entry could not be delivered to any endpoint (the tail was reinserted).
async fn process_pending(
    hook: &Arc<Hook>,
    queue: &HookQueue,
    epm: &endpoint::Manager,
) -> bool {
    loop {
        let entries = match queue.drain(&hook.name) {
            Ok(entries) => entries,
            Err(e) => {
                error!(hook = %hook.name, error = %e, "hook queue drain failed");
                return false;
            }
        };
        if entries.is_empty() {
            return true;
        }
        for (i, entry) in entries.iter().enumerate() {
            let mut sent = false;
            for url in &hook.endpoints {
                match epm.send(url, &entry.value).await {
                    Ok(()) => {
                        debug!(hook = %hook.name, idx = entry.idx, endpoint = %url,
                               "hook payload delivered");
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        debug!(hook = %hook.name, idx = entry.idx, endpoint = %url,
                               error = %e, "hook endpoint send failed");
                    }
                }
            }
            if !sent {
                // keep this entry and everything after it, with whatever
                // TTL each has left
                if let Err(e) = queue.reinsert(&hook.name, &entries[i..]) {
                    error!(hook = %hook.name, error = %e, "hook queue reinsert failed");
                }
                return false;
            }
        }
    }
}

/// Fans a committed mutation out to the hooks watching its key. Runs under
/// the exclusive lock as part of the commit path; delivery itself happens
/// in each hook's task.
pub(crate) fn queue_hooks(server: &Server, db: &Db, details: &CommandDetails) {
    if !matches!(
        details.command.as_str(),
        "set" | "fset" | "del" | "expire" | "persist" | "jset" | "jdel" | "drop"
    ) {
        return;
    }
    let hooks = match db.hook_cols.get(&details.key) {
        Some(hooks) => hooks,
        None => return,
    };
    for hook in hooks.values() {
        let payloads = fence::fence_match(
            Some(&hook.name),
            &hook.metas,
            &hook.groups,
            &hook.fence,
            details,
            db,
        );
        if payloads.is_empty() {
            continue;
        }
        if let Err(e) = server.queue.push(&hook.name, &payloads, HOOK_QUEUE_TTL) {
            error!(hook = %hook.name, error = %e, "hook enqueue failed");
            continue;
        }
        hook.signal();
    }
}

impl Server {
    /// `SETHOOK name endpoint[,endpoint…] [META k v …]
    ///  (NEARBY|WITHIN|INTERSECTS) key … FENCE …`
    pub(crate) fn cmd_sethook(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, name) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (mut vs, urls) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if name.is_empty() || urls.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let name = name.to_string();

        let mut endpoints = Vec::new();
        for url in urls.split(',') {
            let url = url.trim().to_string();
            if let Err(e) = self.epm.validate(&url) {
                error!(hook = %name, url = %url, error = %e, "sethook endpoint rejected");
                return Err(CmdError::InvalidArgument(url));
            }
            endpoints.push(url);
        }

        // META pairs may appear before the fence command
        let mut metas: Vec<(String, String)> = Vec::new();
        let verb = loop {
            let (rest, token) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
            match token.to_lowercase().as_str() {
                "meta" => {
                    let (rest, mkey) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let (rest, mval) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    if mkey.is_empty() || mval.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    metas.push((mkey.to_string(), mval.to_string()));
                    vs = rest;
                }
                "nearby" | "within" | "intersects" => break token.to_lowercase(),
                other => return Err(CmdError::InvalidArgument(other.to_string())),
            }
        };
        metas.sort_by(|a, b| a.0.cmp(&b.0));

        // vs still points at the verb; freeze these tokens as the hook's
        // command for HOOKS listings and the shrinker
        let message: Vec<String> = vs.to_vec();
        let fence_args = &vs[1..];
        let fence = self.parse_search_args(&verb, fence_args)?;
        if !fence.fence {
            return Err(CmdError::other("missing FENCE argument"));
        }
        if !fence.whereevals.is_empty() && !self.scripts.available() {
            return Err(CmdError::other("scripting is not available"));
        }

        let hook = Arc::new(Hook::new(
            name.clone(),
            fence.key.clone(),
            endpoints,
            metas,
            message,
            fence,
        ));

        if let Some(existing) = db.hooks.get(&name) {
            if existing.equals(&hook) {
                // nothing changed; nudge the delivery task anyway
                existing.signal();
                let res = match msg.output {
                    OutputType::Json => self.ok_message(msg, start),
                    OutputType::Resp => RespValue::integer(0),
                };
                return Ok((res, CommandDetails::default()));
            }
            existing.close();
            if let Some(by_key) = db.hook_cols.get_mut(&existing.key) {
                by_key.remove(&name);
            }
            db.hooks.remove(&name);
        }

        db.hooks.insert(name.clone(), Arc::clone(&hook));
        db.hook_cols
            .entry(hook.key.clone())
            .or_default()
            .insert(name, Arc::clone(&hook));
        hook.open(Arc::clone(&self.queue), Arc::clone(&self.epm));

        let details = CommandDetails {
            command: "sethook".to_string(),
            updated: true,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(1),
        };
        Ok((res, details))
    }

    /// `DELHOOK name`
    pub(crate) fn cmd_delhook(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, name) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() || name.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let mut details = CommandDetails {
            command: "delhook".to_string(),
            timestamp: Utc::now(),
            ..Default::default()
        };
        if let Some(hook) = db.hooks.remove(name) {
            hook.close();
            if let Some(by_key) = db.hook_cols.get_mut(&hook.key) {
                by_key.remove(name);
            }
            details.updated = true;
        }
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(i64::from(details.updated)),
        };
        Ok((res, details))
    }

    /// `PDELHOOK pattern`
    pub(crate) fn cmd_pdelhook(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, pattern) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() || pattern.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let names: Vec<String> = db
            .hooks
            .keys()
            .filter(|name| crate::glob::glob_match(pattern, name))
            .cloned()
            .collect();
        let mut count = 0;
        for name in names {
            if let Some(hook) = db.hooks.remove(&name) {
                hook.close();
                if let Some(by_key) = db.hook_cols.get_mut(&hook.key) {
                    by_key.remove(&name);
                }
                count += 1;
            }
        }
        let details = CommandDetails {
            command: "pdelhook".to_string(),
            pattern: pattern.to_string(),
            updated: count > 0,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(count),
        };
        Ok((res, details))
    }

    /// `HOOKS pattern` — matching hooks in name order.
    pub(crate) fn cmd_hooks(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, pattern) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() || pattern.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let mut hooks: Vec<&Arc<Hook>> = db
            .hooks
            .values()
            .filter(|hook| crate::glob::glob_match(pattern, &hook.name))
            .collect();
        hooks.sort_by(|a, b| a.name.cmp(&b.name));

        match msg.output {
            OutputType::Json => {
                let mut body = String::from("{\"ok\":true,\"hooks\":[");
                for (i, hook) in hooks.iter().enumerate() {
                    if i > 0 {
                        body.push(',');
                    }
                    body.push('{');
                    body.push_str(&format!("\"name\":{}", json_string(&hook.name)));
                    body.push_str(&format!(",\"key\":{}", json_string(&hook.key)));
                    body.push_str(",\"endpoints\":[");
                    for (j, url) in hook.endpoints.iter().enumerate() {
                        if j > 0 {
                            body.push(',');
                        }
                        body.push_str(&json_string(url));
                    }
                    body.push_str("],\"command\":[");
                    for (j, token) in hook.message.iter().enumerate() {
                        if j > 0 {
                            body.push(',');
                        }
                        body.push_str(&json_string(token));
                    }
                    body.push_str("],\"meta\":{");
                    for (j, (mkey, mval)) in hook.metas.iter().enumerate() {
                        if j > 0 {
                            body.push(',');
                        }
                        body.push_str(&format!("{}:{}", json_string(mkey), json_string(mval)));
                    }
                    body.push_str("}}");
                }
                body.push_str(&format!("],\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => {
                let mut vals = Vec::new();
                for hook in hooks {
                    let mut hvals = vec![
                        RespValue::bulk_string(hook.name.clone()),
                        RespValue::bulk_string(hook.key.clone()),
                    ];
                    hvals.push(RespValue::array(
                        hook.endpoints
                            .iter()
                            .map(|u| RespValue::bulk_string(u.clone()))
                            .collect(),
                    ));
                    hvals.push(RespValue::array(
                        hook.message
                            .iter()
                            .map(|t| RespValue::bulk_string(t.clone()))
                            .collect(),
                    ));
                    let mut metas = Vec::new();
                    for (mkey, mval) in &hook.metas {
                        metas.push(RespValue::bulk_string(mkey.clone()));
                        metas.push(RespValue::bulk_string(mval.clone()));
                    }
                    hvals.push(RespValue::array(metas));
                    vals.push(RespValue::array(hvals));
                }
                Ok(RespValue::array(vals))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::search::Shape;
    use crate::geojson::Position;

    fn fence_stub() -> SearchArgs {
        SearchArgs {
            cmd: "nearby".to_string(),
            key: "fleet".to_string(),
            cursor: 0,
            limit: 0,
            ulimit: false,
            sparse: 0,
            usparse: false,
            output: crate::server::scanner::Output::Objects,
            precision: 0,
            glob: "*".to_string(),
            wheres: Vec::new(),
            whereins: Vec::new(),
            whereevals: Vec::new(),
            nofields: false,
            fence: true,
            detect: None,
            commands: None,
            desc: false,
            shape: Shape::Point {
                center: Position::from_latlon(0.0, 0.0),
                meters: 1000.0,
            },
            knn: false,
            roam: None,
        }
    }

    fn hook(name: &str, endpoints: &[&str]) -> Hook {
        Hook::new(
            name.to_string(),
            "fleet".to_string(),
            endpoints.iter().map(|s| s.to_string()).collect(),
            vec![("a".to_string(), "1".to_string())],
            vec!["nearby".to_string(), "fleet".to_string()],
            fence_stub(),
        )
    }

    #[test]
    fn test_hook_equality() {
        let a = hook("h", &["http://x/"]);
        let b = hook("h", &["http://x/"]);
        assert!(a.equals(&b));

        let c = hook("h", &["http://y/"]);
        assert!(!a.equals(&c));

        let d = hook("other", &["http://x/"]);
        assert!(!a.equals(&d));
    }

    #[test]
    fn test_hook_close_is_idempotent() {
        let h = hook("h", &["http://x/"]);
        assert!(!h.is_closed());
        h.close();
        assert!(h.is_closed());
        h.close();
        assert!(h.is_closed());
    }

    #[tokio::test]
    async fn test_delivery_loop_exits_on_close() {
        let h = Arc::new(hook("h", &["http://127.0.0.1:1/"]));
        let queue = Arc::new(crate::queue::HookQueue::open_in_memory().unwrap());
        let epm = Arc::new(endpoint::Manager::new());
        let task = tokio::spawn(delivery_loop(
            Arc::clone(&h),
            Arc::clone(&queue),
            epm,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("delivery loop should exit after close")
            .unwrap();
    }
}
