//! One-shot, key-scoped change notifications.
//!
//! A registration receives at most one notification: the first effective mutation of its key after
//! it registered. Mutations with no registered subscribers are not remembered.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::types::{Action, DataItem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub action: Action,
    pub key: String,
    pub old: Option<DataItem>,
    pub new: Option<DataItem>,
}

#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<String, Vec<oneshot::Sender<Notification>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for the next change of `key`.
    pub fn subscribe(&self, key: &str) -> oneshot::Receiver<Notification> {
        let (tx, rx) = oneshot::channel();
        self.subscribers
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Register `callback` for the next change of `key`. The callback is spawned right away on the
    /// current tokio runtime and awaits the notification slot itself.
    ///
    /// Outside a runtime nothing is registered and an error is logged.
    pub fn add<F, Fut>(&self, key: &str, callback: F)
    where
        F: FnOnce(oneshot::Receiver<Notification>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(key, "Cannot register notification callback: {e}");
                return;
            }
        };
        let rx = self.subscribe(key);
        handle.spawn(callback(rx));
    }

    /// Deliver to every subscriber of `key` and forget them. Returns how many were delivered.
    pub fn notify(
        &self,
        action: Action,
        key: &str,
        old: Option<DataItem>,
        new: Option<DataItem>,
    ) -> usize {
        let Some(senders) = self.subscribers.lock().remove(key) else {
            return 0;
        };
        let notification = Notification {
            action,
            key: key.to_string(),
            old,
            new,
        };
        let delivered = senders
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .filter_map(|tx| tx.send(notification.clone()).ok())
            .count();
        trace!(key, delivered, "notified subscribers");
        delivered
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.lock().get(key).map_or(0, Vec::len)
    }
}
