//! Per-peer outbound replication.
//!
//! Every peer gets a bounded queue of encoded records and one background task that drains it in
//! batches, ships each batch with a single remote call and retries failed batches with exponential
//! backoff until the delay exceeds its cap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};

/// Remote operations a node needs from its peers.
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver encoded records; returns how many the peer accepted.
    fn push(
        &self,
        addr: &str,
        records: Vec<String>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Fetch the peer's full snapshot.
    fn pull(&self, addr: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn keys(&self, addr: &str, pattern: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Doubling retry delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self {
            unit,
            max,
            current: unit,
        }
    }

    /// Delay before the next retry, or `None` once the delay has grown past the cap.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current > self.max {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.unit;
    }
}

/// Run a remote call bounded by `limit`; running out of time is a [`Error::Timeout`].
pub async fn call_with_timeout<R>(
    limit: Duration,
    call: impl Future<Output = Result<R>>,
) -> Result<R> {
    timeout(limit, call).await.map_err(|_| Error::Timeout)?
}

/// Drain up to `max` records, waiting at most `window` for the batch to fill.
async fn collect_batch(
    rx: &mut mpsc::Receiver<String>,
    max: usize,
    window: Duration,
) -> Vec<String> {
    let deadline = Instant::now() + window;
    let mut items = Vec::with_capacity(max);
    while items.len() < max {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => items.push(item),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    items
}

/// Handle to one peer's outbound queue and its sender task.
pub struct ReplicationClient {
    addr: String,
    queue: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplicationClient {
    /// Spawn the sender task for `addr` on the current runtime.
    pub fn start<T: PeerTransport>(
        addr: impl Into<String>,
        transport: Arc<T>,
        config: ReplicationConfig,
    ) -> Self {
        let addr = addr.into();
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sender = PeerSender {
            addr: addr.clone(),
            transport,
            backoff: Backoff::new(config.backoff_unit, config.max_backoff),
            config: config.clone(),
            rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(sender.run());
        info!("Started replication to {addr}");

        Self {
            addr,
            queue,
            shutdown,
            task,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue one encoded record without waiting. A full queue drops the record.
    pub fn push(&self, record: String) -> Result<()> {
        self.queue.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(record) => {
                warn!(peer = %self.addr, %record, "Replication queue full, dropping record");
                Error::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Stop the sender task at its next suspension point and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        drop(self.queue);
        if let Err(e) = self.task.await {
            warn!("Replication task for {} ended abnormally: {e}", self.addr);
        }
    }
}

struct PeerSender<T: PeerTransport> {
    addr: String,
    transport: Arc<T>,
    config: ReplicationConfig,
    backoff: Backoff,
    rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl<T: PeerTransport> PeerSender<T> {
    #[tracing::instrument(skip(self), fields(peer = %self.addr))]
    async fn run(mut self) {
        loop {
            let batch = tokio::select! {
                batch = collect_batch(&mut self.rx, self.config.max_batch, self.config.batch_window) => batch,
                _ = self.shutdown.changed() => break,
            };
            if batch.is_empty() {
                if self.pause(self.config.idle_interval).await {
                    break;
                }
                continue;
            }
            if !self.deliver(batch).await {
                break;
            }
        }

        let abandoned = self.rx.len();
        if abandoned > 0 {
            warn!("Replication stopped with {abandoned} queued records abandoned");
        } else {
            info!("Replication stopped");
        }
    }

    /// Sleep unless shutdown is signalled first. Returns true on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = sleep(delay) => false,
            _ = self.shutdown.changed() => true,
        }
    }

    /// Send `batch` until it succeeds or is abandoned. Returns false if shutdown interrupted a
    /// retry wait.
    async fn deliver(&mut self, batch: Vec<String>) -> bool {
        loop {
            match self.send_batch(&batch).await {
                Ok(accepted) => {
                    self.backoff.reset();
                    debug!(
                        sent = batch.len(),
                        accepted, "Pushed batch to remote"
                    );
                    return true;
                }
                Err(e) => match self.backoff.next_delay() {
                    Some(delay) => {
                        info!(
                            size = batch.len(),
                            "Push to remote failed, retry in {delay:?}: {e}"
                        );
                        if self.pause(delay).await {
                            warn!(
                                size = batch.len(),
                                "Shutdown during retry wait, abandoning batch"
                            );
                            return false;
                        }
                    }
                    None => {
                        warn!(
                            commands = ?batch,
                            "Push to remote failed, reached max retry delay, abandoning batch: {e}"
                        );
                        self.backoff.reset();
                        return true;
                    }
                },
            }
        }
    }

    /// Every record in a batch was encoded locally, so anything short of full acceptance is a
    /// failure and the whole batch goes again.
    async fn send_batch(&self, batch: &[String]) -> Result<usize> {
        let accepted = call_with_timeout(
            self.config.call_timeout,
            self.transport.push(&self.addr, batch.to_vec()),
        )
        .await?;
        if accepted < batch.len() {
            return Err(Error::PartialPush {
                accepted,
                sent: batch.len(),
            });
        }
        Ok(accepted)
    }
}
