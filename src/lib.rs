//! ripplekv - a replicated, eventually consistent key-value store core
//!
//! Every node holds a full copy of the keyspace, accepts local writes, logs them durably and
//! pushes them asynchronously to a static set of peers. Conflicts are settled by version alone:
//! a write tagged with version `V` takes effect only if the key is absent or `V` is at least the
//! stored version.
//!
//! # Key Features
//!
//! - **No coordination**: no leader, no consensus, no cross-node locks
//! - **Last-writer-wins by version**: versions are `millis * 10^6 + node_id * 10^3 + counter`
//! - **Single-consumer pipeline**: local and replicated writes are serialized through one queue
//! - **Batched fan-out**: per-peer queues, batches of up to 20 records, exponential backoff
//! - **Text records**: WAL lines and replication records share one inspectable format
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ripplekv::{http::HttpTransport, Config, Node};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .node_id(1)
//!     .data_dir("/var/lib/ripplekv")
//!     .peers(["10.0.0.2:7001"])
//!     .build();
//! let node = Arc::new(Node::open(config, Arc::new(HttpTransport::new()))?);
//!
//! let changed = node.watch("greeting");
//! let version = node.set("greeting", "hello")?;
//! let notification = changed.await?;
//! assert_eq!(notification.new.map(|item| item.version), Some(version));
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//!   set/delete ──► Syncer::submit ──► pipeline task ──► VersionedStore
//!   peer Push  ──►                         │          ──► Notifier
//!                                          │          ──► WriteAheadLog
//!                                          └ Local only ► ReplicationClient (per peer)
//!                                                              └► PeerTransport::push
//! ```
//!
//! # Non-goals
//!
//! - Strong consistency, linearizability or leader election
//! - Byzantine fault tolerance
//! - Peer discovery (the peer set is fixed for the life of the process)
//! - Atomic multi-key transactions

pub mod config;
pub mod error;
pub mod http;
pub mod idgen;
pub mod node;
pub mod notifier;
pub mod replication;
pub mod store;
pub mod syncer;
pub mod types;
pub mod wal;

pub use config::Config;
pub use error::Error;
pub use node::Node;

#[cfg(test)]
mod tests;
