//! # GeoKV - An In-Memory Geospatial Database Server
//!
//! GeoKV stores geometric objects keyed by collection and id, indexes them
//! for spatial search, journals every mutation to an append-only log, and
//! pushes geofence events to external endpoints and live subscribers.
//! Clients speak a RESP-compatible line protocol, JSON over HTTP, or
//! WebSocket — all three share one command vocabulary.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               GeoKV                                 │
//! │                                                                     │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────────────────────┐    │
//! │  │ TCP/HTTP/  │──>│ Connection │──>│  Server (request          │    │
//! │  │ WebSocket  │   │  Handler   │   │  controller, one RW lock) │    │
//! │  └────────────┘   └────────────┘   └──────────┬────────────────┘    │
//! │                                               │                     │
//! │               ┌──────────────┬────────────────┼──────────────┐      │
//! │               ▼              ▼                ▼              ▼      │
//! │         ┌──────────┐   ┌──────────┐    ┌───────────┐   ┌─────────┐  │
//! │         │   AOF    │   │  Hook    │    │   Live    │   │ Follower│  │
//! │         │ journal  │   │ queues   │    │   subs    │   │ streams │  │
//! │         └──────────┘   └──────────┘    └───────────┘   └─────────┘  │
//! │                                                                     │
//! │   Background: expirer · memory watcher · auto-GC · script pruner    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parsing and serialization (also the AOF record
//!   format)
//! - [`geojson`]: the stored object model and geometry predicates
//! - [`collection`]: the per-key ordered + spatial store
//! - [`config`]: persisted server settings
//! - [`server`]: the request controller — routing, locking, journaling,
//!   hooks, replication, expiration
//! - [`connection`]: per-socket protocol handling
//! - [`endpoint`]: hook payload delivery
//! - [`queue`]: the durable hook delivery queue
//! - [`script`]: the scripting-engine seam
//!
//! ## Quick Start
//!
//! ```ignore
//! use geokv::server::{Server, ServerOptions};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::start(ServerOptions::default()).await.unwrap();
//!     let listener = TcpListener::bind("127.0.0.1:9851").await.unwrap();
//!     server.serve(listener).await;
//! }
//! ```

pub mod collection;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod geojson;
pub mod glob;
pub mod protocol;
pub mod queue;
pub mod script;
pub mod server;

pub use collection::Collection;
pub use config::Config;
pub use geojson::Object;
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{Server, ServerOptions};

/// The default port GeoKV listens on
pub const DEFAULT_PORT: u16 = 9851;

/// The default host GeoKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of GeoKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
