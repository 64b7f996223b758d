//! # Discovery
//!
//! Client library for a zone-aware service-discovery system, plus the
//! peer-replication building block its servers use to fan instance
//! mutations out to each other.
//!
//! Applications use [`Discovery`] for two things:
//!
//! - **Registration** — [`Discovery::register`] announces an instance and
//!   keeps it alive with a 30-second renew heartbeat, falling back to a
//!   fresh registration when the server has lost the record. The returned
//!   [`Registration`] handle deregisters in an ordered fashion on cancel.
//! - **Resolution** — [`Discovery::watch`] subscribes to an appid,
//!   [`Discovery::fetch`] returns the current zone→instances snapshot
//!   without blocking, and a single background loop long-polls the
//!   discovery nodes with per-app incremental timestamps, failing over
//!   between nodes and coalescing change notifications.
//!
//! [`PeerNode`] is the server-side fan-out primitive: it forwards one
//! instance mutation to one peer, tagging cross-zone traffic with
//! `replication=false` so the cluster does not amplify its own updates.
//!
//! ## Quick Start
//!
//! ```no_run
//! use discovery::{Config, Discovery, Instance};
//!
//! #[tokio::main]
//! async fn main() -> discovery::Result<()> {
//!     let config = Config::new("127.0.0.1:7171")
//!         .with_zone("sh1")
//!         .with_env("test");
//!     let client = Discovery::new(config)?;
//!
//!     // keep this process registered as "my.service"
//!     let registration = client
//!         .register(Instance::new("my.service").with_addr("http://10.0.0.1:80"))
//!         .await?;
//!
//!     // resolve and watch a peer service
//!     let mut events = client.watch("peer.service").await;
//!     events.changed().await.ok();
//!     if let Some(peers) = client.fetch("peer.service") {
//!         for (zone, instances) in peers.iter() {
//!             println!("{zone}: {} instance(s)", instances.len());
//!         }
//!     }
//!
//!     registration.cancel().await;
//!     client.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod discovery;
pub mod error;
mod http;
pub mod peer;
pub mod registry;
pub mod types;

// Re-export main types for convenience
pub use config::{Config, HttpConfig};
pub use discovery::{Discovery, Registry, Resolver};
pub use error::{Code, Error, Result};
pub use peer::PeerNode;
pub use registry::Registration;
pub use types::{AppData, Instance, InstancesByZone, NodeInfo, NodeStatus, Status};
