use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::idgen::{IdGenerator, VersionSource};
use crate::notifier::{Notification, Notifier};
use crate::replication::{call_with_timeout, PeerTransport, ReplicationClient};
use crate::store::VersionedStore;
use crate::syncer::Syncer;
use crate::types::{validate_key, DataItem, NodeId, Origin, TxRequest, Version};
use crate::wal::WriteAheadLog;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub n_keys: usize,
    pub peers: Vec<String>,
}

/// One replica: the store, its mutation pipeline and the senders to every peer.
///
/// Share it behind an `Arc` with whatever serves clients and peers.
pub struct Node<T: PeerTransport> {
    config: Config,
    store: Arc<VersionedStore>,
    notifier: Arc<Notifier>,
    versions: Box<dyn VersionSource>,
    syncer: Syncer,
    transport: Arc<T>,
}

impl<T: PeerTransport> Node<T> {
    /// Open the data directory, restore the last snapshot and start replication.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: Config, transport: Arc<T>) -> Result<Self> {
        let versions = IdGenerator::new(config.node_id)?;
        Self::open_with_versions(config, transport, Box::new(versions))
    }

    pub fn open_with_versions(
        config: Config,
        transport: Arc<T>,
        versions: Box<dyn VersionSource>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(VersionedStore::new());
        let snapshot_path = config.snapshot_path();
        if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)?;
            store
                .load(&bytes)
                .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?;
            info!("Loaded snapshot with {} keys from {:?}", store.len(), snapshot_path);
        }

        let wal = WriteAheadLog::open(config.wal_path())?;
        let notifier = Arc::new(Notifier::new());

        let peers = config
            .peers
            .iter()
            .map(|addr| {
                ReplicationClient::start(addr.clone(), transport.clone(), config.replication.clone())
            })
            .collect();
        let syncer = Syncer::start(
            config.intake_capacity,
            store.clone(),
            notifier.clone(),
            wal,
            peers,
        );

        info!(
            "Node {} ready: data_dir={:?}, peers={:?}",
            config.node_id, config.data_dir, config.peers
        );
        Ok(Self {
            config,
            store,
            notifier,
            versions,
            syncer,
            transport,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn next_version(&self) -> Version {
        self.versions.next_id()
    }

    /// The sole write entry point; everything else funnels into it.
    pub fn submit(&self, req: TxRequest) -> Result<(), Error> {
        self.syncer.submit(req)
    }

    /// Stamp and submit a local write. Returns the version it will carry.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<Version, Error> {
        validate_key(key)?;
        let tx_id = self.next_version();
        self.submit(TxRequest::set(tx_id, Origin::Local, key, value.into()))?;
        Ok(tx_id)
    }

    pub fn delete(&self, key: &str) -> Result<Version, Error> {
        validate_key(key)?;
        let tx_id = self.next_version();
        self.submit(TxRequest::delete(tx_id, Origin::Local, key))?;
        Ok(tx_id)
    }

    pub fn get(&self, key: &str) -> Option<DataItem> {
        self.store.get(key)
    }

    pub fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        self.store.keys(pattern)
    }

    /// Resolve on the next effective change of `key`.
    pub fn watch(&self, key: &str) -> oneshot::Receiver<Notification> {
        self.notifier.subscribe(key)
    }

    /// Apply records pushed by a peer. Malformed records are skipped; the rest wait for intake
    /// capacity, so a saturated pipeline slows the pushing peer down instead of losing writes.
    /// Returns how many records were accepted into the pipeline.
    #[tracing::instrument(skip(self, records), fields(node = self.config.node_id, n = records.len()))]
    pub async fn handle_push(&self, records: &[String]) -> Result<usize, Error> {
        let mut accepted = 0;
        for record in records {
            let req = match TxRequest::parse_record(record) {
                Ok(req) => req.to_remote(),
                Err(e) => {
                    warn!(%record, "Skipping pushed record: {e}");
                    continue;
                }
            };
            self.syncer.submit_wait(req).await?;
            accepted += 1;
        }
        debug!(accepted, "Handled push");
        Ok(accepted)
    }

    pub fn handle_pull(&self) -> Result<Vec<u8>, Error> {
        self.store.serialize()
    }

    pub fn handle_keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        self.store.keys(pattern)
    }

    /// Keys matching `pattern` on a peer.
    pub async fn remote_keys(&self, addr: &str, pattern: &str) -> Result<Vec<String>, Error> {
        call_with_timeout(
            self.config.replication.call_timeout,
            self.transport.keys(addr, pattern),
        )
        .await
    }

    /// Pull a full snapshot from the first peer that answers and feed every item through the
    /// pipeline as a replicated write, so newer local versions survive. Returns the number of
    /// items submitted.
    pub async fn catch_up(&self) -> Result<usize> {
        if self.config.peers.is_empty() {
            info!("No peers to catch up from");
            return Ok(0);
        }

        for addr in &self.config.peers {
            let pulled = call_with_timeout(
                self.config.replication.call_timeout,
                self.transport.pull(addr),
            )
            .await;
            let bytes = match pulled {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to pull snapshot from {addr}: {e}");
                    continue;
                }
            };

            let items: BTreeMap<String, DataItem> = match serde_json::from_slice(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    warn!("Malformed snapshot from {addr}: {e}");
                    continue;
                }
            };
            let count = items.len();
            for (key, item) in items {
                self.syncer
                    .submit_wait(TxRequest::set(item.version, Origin::Remote, key, item.value))
                    .await?;
            }
            info!("Caught up {count} keys from {addr}");
            return Ok(count);
        }

        bail!("Failed to pull a snapshot from any of {} peers", self.config.peers.len())
    }

    /// Write the whole keyspace to the snapshot file atomically.
    pub fn persist(&self) -> Result<()> {
        let snapshot_path = self.config.snapshot_path();
        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = snapshot_path.with_extension("dat.tmp");
        let encoded = self.store.serialize()?;
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &snapshot_path)?;

        if let Some(parent) = snapshot_path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        info!("Persisted snapshot ({} keys) to {:?}", self.store.len(), snapshot_path);
        Ok(())
    }

    /// Drain the pipeline, stop replication and write a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Node {} shutting down", self.config.node_id);
        self.syncer.shutdown().await;
        self.persist()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.config.node_id,
            n_keys: self.store.len(),
            peers: self.config.peers.clone(),
        }
    }
}
