//! The mutation pipeline.
//!
//! Every write, local or replicated, enters through [`Syncer::submit`] and is consumed by a single
//! task in FIFO order: apply to the store, notify watchers, append to the WAL, and for locally
//! originated requests only, hand the record to every peer's sender. Replicated requests are never
//! forwarded again.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::replication::ReplicationClient;
use crate::store::{SetOutcome, VersionedStore};
use crate::types::{Action, DataItem, Origin, TxRequest};
use crate::wal::WriteAheadLog;

pub struct Syncer {
    intake: mpsc::Sender<TxRequest>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Syncer {
    /// Spawn the pipeline task. The pipeline takes ownership of the WAL and the peer senders.
    pub fn start(
        capacity: usize,
        store: Arc<VersionedStore>,
        notifier: Arc<Notifier>,
        wal: WriteAheadLog,
        peers: Vec<ReplicationClient>,
    ) -> Self {
        let (intake, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pipeline = Pipeline {
            store,
            notifier,
            wal,
            peers,
            rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(pipeline.run());

        Self {
            intake,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a request without waiting. Fails with `QueueFull` when the intake is saturated.
    pub fn submit(&self, req: TxRequest) -> Result<()> {
        self.intake.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(req) => {
                warn!(tx_id = req.tx_id, key = %req.key, "Intake queue full, request refused");
                Error::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Queue a request, waiting for intake capacity. Used for bulk catch-up.
    pub async fn submit_wait(&self, req: TxRequest) -> Result<()> {
        self.intake.send(req).await.map_err(|_| Error::Closed)
    }

    /// Stop accepting requests, drain what is already queued, close the WAL and stop every peer
    /// sender. Later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Pipeline task ended abnormally: {e}");
            }
        }
    }
}

struct Pipeline {
    store: Arc<VersionedStore>,
    notifier: Arc<Notifier>,
    wal: WriteAheadLog,
    peers: Vec<ReplicationClient>,
    rx: mpsc::Receiver<TxRequest>,
    shutdown: watch::Receiver<bool>,
}

impl Pipeline {
    async fn run(mut self) {
        info!("Pipeline started with {} peers", self.peers.len());
        loop {
            tokio::select! {
                req = self.rx.recv() => match req {
                    Some(req) => self.process(req),
                    None => break,
                },
                _ = self.shutdown.changed() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(req) = self.rx.recv().await {
                        self.process(req);
                        drained += 1;
                    }
                    info!("Pipeline drained {drained} queued requests on shutdown");
                    break;
                }
            }
        }

        if let Err(e) = self.wal.close() {
            error!("Failed to close WAL: {e:#}");
        }
        for peer in self.peers.drain(..) {
            peer.shutdown().await;
        }
        info!("Pipeline stopped");
    }

    fn process(&mut self, req: TxRequest) {
        trace!(?req, "Processing request");
        self.apply(&req);

        if let Err(e) = self.wal.append(&req) {
            warn!(tx_id = req.tx_id, "Append tx to WAL failed: {e:#}");
        }

        if req.origin == Origin::Local {
            self.fan_out(&req);
        }
    }

    fn apply(&self, req: &TxRequest) {
        match req.action {
            Action::Set => {
                let item = DataItem::new(req.value.clone(), req.tx_id);
                match self.store.set(&req.key, item.clone()) {
                    SetOutcome::RejectedStale { current } => {
                        debug!(
                            key = %req.key,
                            stored = current.version,
                            attempted = req.tx_id,
                            "Stale set rejected"
                        );
                    }
                    outcome => {
                        self.notifier
                            .notify(Action::Set, &req.key, outcome.old().cloned(), Some(item));
                    }
                }
            }
            Action::Delete => match self.store.delete(&req.key, req.tx_id) {
                Ok(old) => {
                    self.notifier
                        .notify(Action::Delete, &req.key, Some(old), None);
                }
                Err(Error::NotFound(_)) => {
                    debug!(key = %req.key, tx_id = req.tx_id, "Delete of absent key");
                }
                Err(e) => {
                    warn!(key = %req.key, tx_id = req.tx_id, "Delete not applied: {e}");
                }
            },
        }
    }

    fn fan_out(&self, req: &TxRequest) {
        if self.peers.is_empty() {
            return;
        }
        let record = req.to_remote().to_record();
        for peer in &self.peers {
            if let Err(e) = peer.push(record.clone()) {
                debug!(peer = peer.addr(), tx_id = req.tx_id, "Fan-out skipped: {e}");
            }
        }
    }
}
