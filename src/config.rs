//! Node configuration.
//!
//! ```text
//!   {data_dir}/
//!     ├── snapshot.dat   (JSON snapshot of the whole keyspace)
//!     └── tx.dat         (append-only transaction log)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::NodeId;

pub const ENV_NODE_ID: &str = "RIPPLEKV_NODE_ID";
pub const ENV_PEERS: &str = "RIPPLEKV_PEERS";
pub const ENV_DATA_DIR: &str = "RIPPLEKV_DATA_DIR";

pub const SNAPSHOT_FILENAME: &str = "snapshot.dat";
pub const WAL_FILENAME: &str = "tx.dat";

#[derive(Debug, Clone)]
pub struct Config {
    /// Must be unique within the replication group and below 1000.
    pub node_id: NodeId,

    pub data_dir: PathBuf,

    /// Peer addresses; static for the lifetime of the process.
    pub peers: Vec<String>,

    /// Capacity of the pipeline intake queue.
    pub intake_capacity: usize,

    pub replication: ReplicationConfig,
}

/// Per-peer sender tuning.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub queue_capacity: usize,
    pub max_batch: usize,
    /// Longest a drain waits for a batch to fill.
    pub batch_window: Duration,
    /// Pause after a drain that found nothing.
    pub idle_interval: Duration,
    /// First retry delay; doubles on each consecutive failure.
    pub backoff_unit: Duration,
    /// A batch is abandoned once the next delay would exceed this.
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_batch: 20,
            batch_window: Duration::from_millis(50),
            idle_interval: Duration::from_secs(1),
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1024),
            call_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: PathBuf::from("./ripplekv_data"),
            peers: Vec::new(),
            intake_capacity: 1000,
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `RIPPLEKV_NODE_ID`, `RIPPLEKV_PEERS` and `RIPPLEKV_DATA_DIR`.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(id) = std::env::var(ENV_NODE_ID) {
            config.node_id = id
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_NODE_ID}={id:?}: {e}")))?;
        }
        if let Ok(peers) = std::env::var(ENV_PEERS) {
            config.peers = parse_peer_list(&peers);
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILENAME)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILENAME)
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn parse_peer_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn node_id(mut self, id: NodeId) -> Self {
        self.config.node_id = id;
        self
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.peers = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn intake_capacity(mut self, capacity: usize) -> Self {
        self.config.intake_capacity = capacity;
        self
    }

    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.config.replication = replication;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
