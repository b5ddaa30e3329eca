//! The request controller.
//!
//! `Server` is the serialized single-writer command executor at the core of
//! GeoKV. One `tokio::sync::RwLock<Db>` guards the collection registry, the
//! expiration index, the append-only file, the shrink state, and the hook
//! registry. The router classifies each command, picks the locking
//! discipline, runs the handler, and — for writes — fans the resulting
//! `CommandDetails` out to the AOF, the shrink tail-log, matching geofence
//! hooks, and live subscribers, in that order.
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────────────────────────┐
//! │ conn     │──>│ classify + │──>│ handler (mutates Db, returns  │
//! │ message  │   │ lock       │   │ CommandDetails)               │
//! └──────────┘   └────────────┘   └──────────────┬────────────────┘
//!                                                │
//!                  ┌─────────────────────────────┼──────────────┐
//!                  ▼              ▼              ▼              ▼
//!              AOF append   shrink tail    hook queues    live subs
//! ```
//!
//! Module map (mirrors the component list in DESIGN.md):
//! - `crud`: SET/FSET/DEL/PDEL/DROP/FLUSHDB/EXPIRE/PERSIST/GET/TTL/… handlers
//! - `search`: SCAN/SEARCH/NEARBY/WITHIN/INTERSECTS parsing and execution
//! - `scanner`: the paged/filtered output writer
//! - `hooks` + `fence`: geofence hooks, matching, and delivery
//! - `live`: live fence subscribers
//! - `aof` / `aofshrink`: the append-only log and its online rewrite
//! - `follow`: leader-tailing replication client
//! - `expire`: the expiration index and expirer
//! - `background`: the maintenance loops
//! - `client` / `dev`: connection table and dev-gated commands

pub mod aof;
pub mod aofshrink;
pub mod background;
pub mod client;
pub mod crud;
pub mod dev;
pub mod expire;
pub mod fence;
pub mod follow;
pub mod hooks;
pub mod live;
pub mod message;
pub mod scanner;
pub mod search;

pub use client::ClientInfo;
pub use message::{ConnType, Message, OutputType};

use crate::collection::Collection;
use crate::config::Config;
use crate::endpoint;
use crate::geojson::Object;
use crate::protocol::RespValue;
use crate::queue::HookQueue;
use crate::script::{NoScripting, ScriptEngine};
use chrono::{DateTime, Utc};
use expire::ExpireList;
use hooks::Hook;
use live::LiveHub;
use rand::RngCore;
use search::SearchArgs;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{error, info, warn};

/// Client-visible command errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CmdError {
    #[error("invalid number of arguments")]
    InvalidNumArgs,

    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("id not found")]
    IdNotFound,

    #[error("{0}")]
    Other(String),
}

impl CmdError {
    pub fn other(msg: impl Into<String>) -> CmdError {
        CmdError::Other(msg.into())
    }
}

/// The per-mutation change record driving AOF, replication, hooks, and live
/// streams.
#[derive(Debug, Clone)]
pub struct CommandDetails {
    pub command: String,
    pub key: String,
    pub id: String,
    pub field: String,
    pub value: f64,
    pub obj: Option<Object>,
    pub fields: Vec<f64>,
    pub fmap: HashMap<String, usize>,
    pub old_obj: Option<Object>,
    pub old_fields: Vec<f64>,
    pub updated: bool,
    pub timestamp: DateTime<Utc>,
    /// Pattern-delete parent: only `children` are journaled and broadcast.
    pub parent: bool,
    pub pattern: String,
    pub children: Vec<CommandDetails>,
}

impl Default for CommandDetails {
    fn default() -> Self {
        CommandDetails {
            command: String::new(),
            key: String::new(),
            id: String::new(),
            field: String::new(),
            value: 0.0,
            obj: None,
            fields: Vec::new(),
            fmap: HashMap::new(),
            old_obj: None,
            old_fields: Vec::new(),
            updated: false,
            timestamp: Utc::now(),
            parent: false,
            pattern: String::new(),
            children: Vec::new(),
        }
    }
}

/// Everything guarded by the global reader/writer lock.
pub(crate) struct Db {
    pub cols: BTreeMap<String, Collection>,
    /// Synced with `cols`: every (key, id) here exists in its collection.
    pub expires: HashMap<String, HashMap<String, DateTime<Utc>>>,
    pub aof: Option<std::fs::File>,
    pub aof_size: u64,
    pub shrinking: bool,
    /// Mutations committed while a shrink is copying; flushed at swap time.
    pub shrink_log: Vec<Vec<String>>,
    pub hooks: HashMap<String, Arc<Hook>>,
    /// Hooks indexed by the collection key their fence watches.
    pub hook_cols: HashMap<String, HashMap<String, Arc<Hook>>>,
}

impl Db {
    fn new() -> Db {
        Db {
            cols: BTreeMap::new(),
            expires: HashMap::new(),
            aof: None,
            aof_size: 0,
            shrinking: false,
            shrink_log: Vec::new(),
            hooks: HashMap::new(),
            hook_cols: HashMap::new(),
        }
    }

    pub fn get_col(&self, key: &str) -> Option<&Collection> {
        self.cols.get(key)
    }

    pub fn get_col_mut(&mut self, key: &str) -> Option<&mut Collection> {
        self.cols.get_mut(key)
    }

    /// Approximate heap usage of the data plane.
    pub fn memory_weight(&self) -> u64 {
        self.cols.values().map(|c| c.weight() as u64).sum()
    }
}

/// Startup options from the CLI.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub dir: PathBuf,
    pub http: bool,
    pub dev: bool,
    pub append_only: bool,
    pub protected_mode_override: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: "127.0.0.1".to_string(),
            port: 9851,
            dir: PathBuf::from("data"),
            http: false,
            dev: false,
            append_only: true,
            protected_mode_override: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    #[error("aof load failed: {0}")]
    AofLoad(String),
}

/// Counters surfaced by `SERVER`/`STATS`.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_conns: AtomicU64,
    pub total_commands: AtomicU64,
    pub expired: AtomicU64,
    pub last_shrink_millis: AtomicU64,
}

/// The result of handling one message; the connection layer applies the
/// framing (HTTP envelope, WebSocket frames) around the body bytes.
pub enum Reply {
    /// Serialized response body to write.
    Body(Vec<u8>),
    /// `OUTPUT` switched the connection's mode; body follows the new mode.
    Output(OutputType, Vec<u8>),
    /// Upgrade this connection to a live fence stream.
    Live(Box<LiveRequest>),
    /// Upgrade this connection to an AOF follower stream from the offset.
    AofStream(u64),
    /// Nothing to write (the handler wrote its own payload).
    None,
}

/// A fence search that requested a live upgrade.
pub struct LiveRequest {
    pub fence: SearchArgs,
    pub msg: Message,
}

/// Outcome of a search command: a response, or a live upgrade.
pub enum SearchOutcome {
    Value(RespValue),
    Live(SearchArgs),
}

/// The GeoKV request controller.
pub struct Server {
    pub(crate) opts: ServerOptions,
    pub(crate) config: Config,
    pub(crate) db: RwLock<Db>,
    pub(crate) queue: Arc<HookQueue>,
    pub(crate) epm: Arc<endpoint::Manager>,
    pub(crate) scripts: Arc<dyn ScriptEngine>,
    pub(crate) exlist: std::sync::Mutex<ExpireList>,
    pub(crate) conns: std::sync::Mutex<HashMap<u64, Arc<ClientInfo>>>,
    pub(crate) next_client_id: AtomicU64,
    /// Bumped on every FOLLOW reconfiguration; superseded follow tasks exit.
    pub(crate) followc: AtomicU64,
    pub(crate) fcup: AtomicBool,
    pub(crate) fcuponce: AtomicBool,
    pub(crate) out_of_memory: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Wakes AOF follower streams after each committed write.
    pub(crate) aof_notify: Notify,
    /// Bumped when the shrinker swaps files; streams re-tail from scratch.
    pub(crate) aof_epoch: AtomicU64,
    pub(crate) aof_followers: AtomicUsize,
    pub(crate) live: LiveHub,
    pub(crate) stats: ServerStats,
    pub(crate) started: Instant,
    pub(crate) server_id: String,
}

impl Server {
    /// Builds the server: loads config and the hook queue, replays the AOF,
    /// rebuilds the expiration list, and spawns the background loops.
    pub async fn start(opts: ServerOptions) -> Result<Arc<Server>, StartError> {
        std::fs::create_dir_all(&opts.dir)?;
        let config = Config::load(&opts.dir)?;
        if let Some(mode) = &opts.protected_mode_override {
            let _ = config.set_property("protected-mode", mode);
        }
        config.set_append_only(opts.append_only);

        // the queue loads before the aof so replayed hooks can enqueue
        let queue = Arc::new(HookQueue::open(&opts.dir.join("queue.db"))?);

        let (shutdown, _) = watch::channel(false);
        let server = Arc::new(Server {
            opts,
            config,
            db: RwLock::new(Db::new()),
            queue,
            epm: Arc::new(endpoint::Manager::new()),
            scripts: Arc::new(NoScripting),
            exlist: std::sync::Mutex::new(ExpireList::new()),
            conns: std::sync::Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            followc: AtomicU64::new(0),
            fcup: AtomicBool::new(false),
            fcuponce: AtomicBool::new(false),
            out_of_memory: AtomicBool::new(false),
            shutdown,
            aof_notify: Notify::new(),
            aof_epoch: AtomicU64::new(0),
            aof_followers: AtomicUsize::new(0),
            live: LiveHub::new(),
            stats: ServerStats::default(),
            started: Instant::now(),
            server_id: random_hex(16),
        });

        {
            let mut db = server.db.write().await;
            if server.config.append_only() {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(server.aof_path())?;
                db.aof = Some(file);
                server
                    .load_aof(&mut db)
                    .map_err(|e| StartError::AofLoad(e.to_string()))?;
            }
            server.fill_expires_list(&db);
        }

        background::spawn_loops(&server);

        if server.opts.http {
            info!("http surface requested; all listeners accept http requests");
        }
        if !server.config.follow_host().is_empty() {
            let host = server.config.follow_host();
            let port = server.config.follow_port();
            let generation = server.followc.load(Ordering::SeqCst);
            tokio::spawn(follow::follow_loop(
                Arc::clone(&server),
                host,
                port,
                generation,
            ));
        }

        Ok(server)
    }

    /// Path of the live append-only file.
    pub fn aof_path(&self) -> PathBuf {
        self.opts.dir.join("appendonly.aof")
    }

    /// Signals every background task and live connection to stop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.live.close_all();
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Accept loop. Each connection runs in its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
              "server listening");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        crate::connection::handle_connection(server, stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// True when connections from non-loopback peers must be refused: the
    /// server is bound locally, has no password, and protected mode is on.
    pub fn protected(&self) -> bool {
        if self.opts.protected_mode_override.as_deref() == Some("no") {
            return false;
        }
        if !matches!(self.opts.host.as_str(), "" | "127.0.0.1" | "::1" | "localhost") {
            return false;
        }
        self.config.protected_mode() != "no" && self.config.require_pass().is_empty()
    }

    /// Routes one parsed message: authentication, classification, locking,
    /// execution, and post-handler fan-out.
    pub async fn handle_message(
        self: &Arc<Self>,
        conn_client: &Arc<ClientInfo>,
        msg: &mut Message,
    ) -> Reply {
        self.stats.total_commands.fetch_add(1, Ordering::Relaxed);
        conn_client.touch();
        let start = Instant::now();

        // ping/echo short-circuit before any locking
        if msg.command == "ping" || msg.command == "echo" {
            return self.reply_ping(msg, start);
        }

        // authentication comes before classification
        if !conn_client.authenticated.load(Ordering::SeqCst) || msg.command == "auth" {
            let requirepass = self.config.require_pass();
            if !requirepass.is_empty() {
                let password = if msg.command == "auth" {
                    msg.args.get(1).cloned().unwrap_or_default()
                } else {
                    match &msg.auth {
                        Some(auth) => auth.clone(),
                        None => return self.reply_err(msg, start, "authentication required"),
                    }
                };
                if requirepass != password.trim() {
                    return self.reply_err(msg, start, "invalid password");
                }
                conn_client.authenticated.store(true, Ordering::SeqCst);
                if msg.command == "auth" {
                    return Reply::Body(
                        self.serialize_output(msg, self.ok_message(msg, start)),
                    );
                }
            } else if msg.command == "auth" {
                return self.reply_err(msg, start, "invalid password");
            }
        }

        // two-word commands get rewritten into "config get"-style verbs
        if (msg.command == "config" || msg.command == "script") && msg.args.len() > 1 {
            let combined = format!("{} {}", msg.args[0], msg.args[1]).to_lowercase();
            let mut args = vec![combined.clone()];
            args.extend_from_slice(&msg.args[2..]);
            msg.args = args;
            msg.command = combined;
        }

        match msg.command.as_str() {
            // ----- write commands: exclusive lock, leadership + read-only
            // gates, AOF + fan-out on success
            "set" | "fset" | "del" | "pdel" | "drop" | "flushdb" | "sethook" | "delhook"
            | "pdelhook" | "expire" | "persist" | "jset" | "jdel" => {
                let mut db = self.db.write().await;
                if !self.config.follow_host().is_empty() {
                    return self.reply_err(msg, start, "not the leader");
                }
                if self.config.read_only() {
                    return self.reply_err(msg, start, "read only");
                }
                if self.out_of_memory.load(Ordering::SeqCst)
                    && matches!(msg.command.as_str(), "set" | "fset" | "jset")
                {
                    return self.reply_err(
                        msg,
                        start,
                        "OOM command not allowed when used memory > 'maxmemory'",
                    );
                }
                match self.write_command(&mut db, msg, start) {
                    Ok((res, details)) => {
                        self.commit(&mut db, &msg.args, &details);
                        self.reply_value(msg, res)
                    }
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }

            // ----- script-write: exclusive lock, same gates, no router AOF
            "eval" | "evalsha" => {
                let _db = self.db.write().await;
                if !self.config.follow_host().is_empty() {
                    return self.reply_err(msg, start, "not the leader");
                }
                if self.config.read_only() {
                    return self.reply_err(msg, start, "read only");
                }
                self.reply_script_unavailable(msg, start)
            }

            // ----- read commands: shared lock, catching-up gate
            "get" | "keys" | "scan" | "nearby" | "within" | "intersects" | "hooks" | "search"
            | "ttl" | "bounds" | "server" | "stats" | "info" | "type" | "jget" | "aofmd5"
            | "aof" | "evalro" | "evalrosha" => {
                let db = self.db.read().await;
                if !self.config.follow_host().is_empty() && !self.fcuponce.load(Ordering::SeqCst)
                {
                    return self.reply_err(msg, start, "catching up to leader");
                }
                if msg.command == "evalro" || msg.command == "evalrosha" {
                    return self.reply_script_unavailable(msg, start);
                }
                self.read_command(&db, msg, start)
            }

            // ----- system commands: exclusive lock, no AOF
            "follow" | "readonly" | "config get" | "config set" | "config rewrite" | "client"
            | "gc" => {
                let _db = self.db.write().await;
                let result = match msg.command.as_str() {
                    "follow" => self.cmd_follow(msg, start),
                    "readonly" => self.cmd_readonly(msg, start),
                    "config get" => self.cmd_config_get(msg, start),
                    "config set" => self.cmd_config_set(msg, start),
                    "config rewrite" => self.cmd_config_rewrite(msg, start),
                    "client" => self.cmd_client(msg, start, conn_client),
                    "gc" => self.cmd_gc(msg, start),
                    _ => unreachable!(),
                };
                match result {
                    Ok(res) => self.reply_value(msg, res),
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }

            // ----- local connection commands: no lock
            "output" => match self.cmd_output(msg, start) {
                Ok((output, res)) => {
                    // serialize under the mode the connection is switching to
                    let mut switched = msg.clone();
                    switched.output = output;
                    Reply::Output(output, self.serialize_output(&switched, res))
                }
                Err(e) => self.reply_cmd_err(msg, start, e),
            },

            // ----- dev commands
            "massinsert" => {
                if !self.opts.dev {
                    return self.reply_cmd_err(
                        msg,
                        start,
                        CmdError::UnknownCommand(msg.args[0].clone()),
                    );
                }
                let mut db = self.db.write().await;
                match self.cmd_mass_insert(&mut db, msg, start) {
                    Ok(res) => self.reply_value(msg, res),
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }
            "sleep" => {
                if !self.opts.dev {
                    return self.reply_cmd_err(
                        msg,
                        start,
                        CmdError::UnknownCommand(msg.args[0].clone()),
                    );
                }
                let _db = self.db.read().await;
                match self.cmd_sleep(msg, start).await {
                    Ok(res) => self.reply_value(msg, res),
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }
            "shutdown" => {
                if !self.opts.dev {
                    return self.reply_cmd_err(
                        msg,
                        start,
                        CmdError::UnknownCommand(msg.args[0].clone()),
                    );
                }
                warn!("shutdown requested by developer");
                self.stop();
                std::process::exit(0);
            }
            "aofshrink" => {
                let _db = self.db.read().await;
                let server = Arc::clone(self);
                tokio::spawn(async move {
                    aofshrink::aof_shrink(server).await;
                });
                self.reply_value(msg, self.ok_message(msg, start))
            }

            // ----- scripts with no router lock
            "evalna" | "evalnasha" | "script load" | "script exists" | "script flush" => {
                self.reply_script_unavailable(msg, start)
            }

            _ => self.reply_cmd_err(
                msg,
                start,
                CmdError::UnknownCommand(msg.args.first().cloned().unwrap_or_default()),
            ),
        }
    }

    /// Dispatches a write command under the exclusive lock.
    fn write_command(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        match msg.command.as_str() {
            "set" => self.cmd_set(db, msg, start),
            "fset" => self.cmd_fset(db, msg, start),
            "del" => self.cmd_del(db, msg, start),
            "pdel" => self.cmd_pdel(db, msg, start),
            "drop" => self.cmd_drop(db, msg, start),
            "flushdb" => self.cmd_flushdb(db, msg, start),
            "expire" => self.cmd_expire(db, msg, start),
            "persist" => self.cmd_persist(db, msg, start),
            "jset" => self.cmd_jset(db, msg, start),
            "jdel" => self.cmd_jdel(db, msg, start),
            "sethook" => self.cmd_sethook(db, msg, start),
            "delhook" => self.cmd_delhook(db, msg, start),
            "pdelhook" => self.cmd_pdelhook(db, msg, start),
            _ => Err(CmdError::UnknownCommand(
                msg.args.first().cloned().unwrap_or_default(),
            )),
        }
    }

    /// Dispatches a read command under the shared lock.
    fn read_command(self: &Arc<Self>, db: &Db, msg: &Message, start: Instant) -> Reply {
        let result: Result<RespValue, CmdError> = match msg.command.as_str() {
            "get" => self.cmd_get(db, msg, start),
            "keys" => self.cmd_keys(db, msg, start),
            "ttl" => self.cmd_ttl(db, msg, start),
            "bounds" => self.cmd_bounds(db, msg, start),
            "type" => self.cmd_type(db, msg, start),
            "jget" => self.cmd_jget(db, msg, start),
            "server" => self.cmd_server(db, msg, start),
            "stats" => self.cmd_stats(db, msg, start),
            "info" => self.cmd_info(db, msg, start),
            "hooks" => self.cmd_hooks(db, msg, start),
            "aofmd5" => self.cmd_aofmd5(db, msg, start),
            "aof" => {
                return match self.cmd_aof(db, msg) {
                    Ok(pos) => Reply::AofStream(pos),
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }
            "scan" => self.cmd_scan(db, msg, start),
            "search" => self.cmd_search(db, msg, start),
            "nearby" | "within" | "intersects" => {
                return match self.cmd_spatial_search(db, msg, start) {
                    Ok(SearchOutcome::Value(res)) => self.reply_value(msg, res),
                    Ok(SearchOutcome::Live(fence)) => Reply::Live(Box::new(LiveRequest {
                        fence,
                        msg: msg.clone(),
                    })),
                    Err(e) => self.reply_cmd_err(msg, start, e),
                }
            }
            _ => Err(CmdError::UnknownCommand(
                msg.args.first().cloned().unwrap_or_default(),
            )),
        };
        match result {
            Ok(res) => self.reply_value(msg, res),
            Err(e) => self.reply_cmd_err(msg, start, e),
        }
    }

    /// Post-handler fan-out for a successful write: journal to the AOF
    /// (fatal on failure), mirror into the shrink tail-log, enqueue matching
    /// hook payloads, and broadcast to live subscribers. Pattern-delete
    /// parents fan out their children instead of themselves.
    pub(crate) fn commit(&self, db: &mut Db, args: &[String], details: &CommandDetails) {
        if !details.updated {
            return;
        }
        if details.parent {
            for child in &details.children {
                let child_args = vec![
                    child.command.clone(),
                    child.key.clone(),
                    child.id.clone(),
                ];
                self.commit_one(db, &child_args, child);
            }
        } else {
            self.commit_one(db, args, details);
        }
    }

    fn commit_one(&self, db: &mut Db, args: &[String], details: &CommandDetails) {
        if db.aof.is_some() {
            if let Err(e) = aof::append_record(db, args) {
                // a partial journal would silently fork state on restart
                error!(error = %e, "fatal: aof append failed");
                std::process::exit(1);
            }
            if self.aof_followers.load(Ordering::SeqCst) > 0 {
                if let Some(file) = db.aof.as_ref() {
                    if let Err(e) = file.sync_data() {
                        error!(error = %e, "fatal: aof fsync failed");
                        std::process::exit(1);
                    }
                }
            }
            if db.shrinking {
                db.shrink_log.push(args.to_vec());
            }
            self.aof_notify.notify_waiters();
        }
        hooks::queue_hooks(self, db, details);
        self.live.broadcast(Arc::new(details.clone()));
    }

    /// Applies an internal write (expirer delete, replicated record, mass
    /// insert) through the same handler + commit path as client writes.
    pub(crate) fn apply_internal(
        &self,
        db: &mut Db,
        msg: &Message,
    ) -> Result<CommandDetails, CmdError> {
        let (_, details) = self.write_command(db, msg, Instant::now())?;
        self.commit(db, &msg.args, &details);
        Ok(details)
    }

    // ----- reply helpers ---------------------------------------------------

    fn reply_ping(&self, msg: &Message, start: Instant) -> Reply {
        match msg.output {
            OutputType::Json => {
                let body = if msg.args.len() > 1 {
                    format!(
                        "{{\"ok\":true,\"{}\":{},\"elapsed\":\"{}\"}}",
                        msg.command,
                        json_string(&msg.args[1]),
                        elapsed(start)
                    )
                } else {
                    format!(
                        "{{\"ok\":true,\"{}\":\"pong\",\"elapsed\":\"{}\"}}",
                        msg.command,
                        elapsed(start)
                    )
                };
                Reply::Body(body.into_bytes())
            }
            OutputType::Resp => {
                let value = if msg.args.len() > 1 {
                    RespValue::bulk_string(msg.args[1].clone())
                } else {
                    RespValue::simple_string("PONG")
                };
                Reply::Body(value.serialize())
            }
        }
    }

    pub(crate) fn reply_value(&self, msg: &Message, res: RespValue) -> Reply {
        if res.is_empty_string() {
            return Reply::None;
        }
        if res.is_error() {
            // state errors surface uniformly through the error writer
            let text = match &res {
                RespValue::Error(e) => e.clone(),
                _ => unreachable!(),
            };
            return self.reply_err(msg, Instant::now(), &text);
        }
        Reply::Body(self.serialize_output(msg, res))
    }

    fn reply_cmd_err(&self, msg: &Message, start: Instant, err: CmdError) -> Reply {
        if let (CmdError::InvalidNumArgs, OutputType::Resp) = (&err, msg.output) {
            return Reply::Body(
                RespValue::error(format!(
                    "ERR wrong number of arguments for '{}' command",
                    msg.command
                ))
                .serialize(),
            );
        }
        self.reply_err(msg, start, &err.to_string())
    }

    pub(crate) fn reply_err(&self, msg: &Message, start: Instant, errmsg: &str) -> Reply {
        match msg.output {
            OutputType::Json => Reply::Body(
                format!(
                    "{{\"ok\":false,\"err\":{},\"elapsed\":\"{}\"}}",
                    json_string(errmsg),
                    elapsed(start)
                )
                .into_bytes(),
            ),
            OutputType::Resp => {
                Reply::Body(RespValue::error(format!("ERR {}", errmsg)).serialize())
            }
        }
    }

    fn reply_script_unavailable(&self, msg: &Message, start: Instant) -> Reply {
        if self.scripts.available() {
            // a real engine would run here; the seam only reports state
            return self.reply_err(msg, start, "scripting engine rejected the script");
        }
        self.reply_err(msg, start, "scripting is not available")
    }

    fn serialize_output(&self, msg: &Message, res: RespValue) -> Vec<u8> {
        match msg.output {
            OutputType::Json => res
                .as_str()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
            OutputType::Resp => res.serialize(),
        }
    }

    /// The standard success response for the message's output mode.
    pub(crate) fn ok_message(&self, msg: &Message, start: Instant) -> RespValue {
        match msg.output {
            OutputType::Json => RespValue::bulk_string(format!(
                "{{\"ok\":true,\"elapsed\":\"{}\"}}",
                elapsed(start)
            )),
            OutputType::Resp => RespValue::ok(),
        }
    }

    /// `OUTPUT` / `OUTPUT resp|json`.
    fn cmd_output(
        &self,
        msg: &Message,
        start: Instant,
    ) -> Result<(OutputType, RespValue), CmdError> {
        match msg.args.len() {
            1 => {
                let name = match msg.output {
                    OutputType::Json => "json",
                    OutputType::Resp => "resp",
                };
                let res = match msg.output {
                    OutputType::Json => RespValue::bulk_string(format!(
                        "{{\"ok\":true,\"output\":\"{}\",\"elapsed\":\"{}\"}}",
                        name,
                        elapsed(start)
                    )),
                    OutputType::Resp => RespValue::bulk_string(name),
                };
                Ok((msg.output, res))
            }
            2 => {
                let output = match msg.args[1].to_lowercase().as_str() {
                    "json" => OutputType::Json,
                    "resp" => OutputType::Resp,
                    other => return Err(CmdError::InvalidArgument(other.to_string())),
                };
                // the confirmation follows the new mode
                let mut confirm = msg.clone();
                confirm.output = output;
                Ok((output, self.ok_message(&confirm, start)))
            }
            _ => Err(CmdError::InvalidNumArgs),
        }
    }

    /// `GC`: trims what the runtime lets us trim and reports OK.
    fn cmd_gc(&self, msg: &Message, start: Instant) -> Result<RespValue, CmdError> {
        if let Err(e) = self.queue.purge_expired() {
            warn!(error = %e, "gc: queue purge failed");
        }
        Ok(self.ok_message(msg, start))
    }

    /// `READONLY yes|no`.
    fn cmd_readonly(&self, msg: &Message, start: Instant) -> Result<RespValue, CmdError> {
        if msg.args.len() != 2 {
            return Err(CmdError::InvalidNumArgs);
        }
        match msg.args[1].to_lowercase().as_str() {
            "yes" => {
                if !self.config.read_only() {
                    self.config.set_read_only(true);
                    info!("read only");
                    let _ = self.config.save();
                }
            }
            "no" => {
                if self.config.read_only() {
                    self.config.set_read_only(false);
                    info!("read write");
                    let _ = self.config.save();
                }
            }
            other => return Err(CmdError::InvalidArgument(other.to_string())),
        }
        Ok(self.ok_message(msg, start))
    }

    /// `CONFIG GET pattern`.
    fn cmd_config_get(&self, msg: &Message, start: Instant) -> Result<RespValue, CmdError> {
        if msg.args.len() != 2 {
            return Err(CmdError::InvalidNumArgs);
        }
        let pattern = &msg.args[1];
        let mut pairs: Vec<(String, String)> = Vec::new();
        for name in crate::config::PROPERTIES {
            if crate::glob::glob_match(pattern, name) {
                if let Some(value) = self.config.get_property(name) {
                    pairs.push((name.to_string(), value));
                }
            }
        }
        match msg.output {
            OutputType::Json => {
                let mut body = String::from("{\"ok\":true,\"properties\":{");
                for (i, (name, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        body.push(',');
                    }
                    body.push_str(&format!("{}:{}", json_string(name), json_string(value)));
                }
                body.push_str(&format!("}},\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => {
                let mut vals = Vec::new();
                for (name, value) in pairs {
                    vals.push(RespValue::bulk_string(name));
                    vals.push(RespValue::bulk_string(value));
                }
                Ok(RespValue::array(vals))
            }
        }
    }

    /// `CONFIG SET name [value]`.
    fn cmd_config_set(&self, msg: &Message, start: Instant) -> Result<RespValue, CmdError> {
        if msg.args.len() < 2 || msg.args.len() > 3 {
            return Err(CmdError::InvalidNumArgs);
        }
        let name = msg.args[1].to_lowercase();
        let value = msg.args.get(2).map(String::as_str).unwrap_or("");
        self.config
            .set_property(&name, value)
            .map_err(|e| CmdError::Other(e.to_string()))?;
        Ok(self.ok_message(msg, start))
    }

    /// `CONFIG REWRITE`.
    fn cmd_config_rewrite(&self, msg: &Message, start: Instant) -> Result<RespValue, CmdError> {
        if msg.args.len() != 1 {
            return Err(CmdError::InvalidNumArgs);
        }
        self.config
            .save()
            .map_err(|e| CmdError::Other(e.to_string()))?;
        Ok(self.ok_message(msg, start))
    }
}

/// JSON-escapes a string (including the quotes).
pub fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Human-readable elapsed time for response trailers, e.g. `41.3µs`.
pub fn elapsed(start: Instant) -> String {
    format!("{:?}", start.elapsed())
}

/// Random lowercase hex string of `2 * n_bytes` characters.
pub fn random_hex(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_string_escapes() {
        assert_eq!(json_string("plain"), "\"plain\"");
        assert_eq!(json_string("with \"quotes\""), "\"with \\\"quotes\\\"\"");
    }

    #[test]
    fn test_random_hex() {
        let a = random_hex(8);
        let b = random_hex(8);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_command_details_default() {
        let d = CommandDetails::default();
        assert!(!d.updated);
        assert!(!d.parent);
        assert!(d.children.is_empty());
    }
}
