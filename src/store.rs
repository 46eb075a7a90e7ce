//! Versioned key-value map with last-writer-wins conflict resolution.
//!
//! A write or delete carrying version `V` takes effect on key `K` only if `K` is absent or
//! `V >= store[K].version`. Mutations are expected to come from a single pipeline; reads may run
//! concurrently with it.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use regex::Regex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{DataItem, Version};

/// Result of [`VersionedStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// Key was absent; the item was inserted.
    Created,
    /// Key existed with an equal or older version and was overwritten.
    Applied { old: DataItem },
    /// Key holds a newer version; the store is unchanged.
    RejectedStale { current: DataItem },
}

impl SetOutcome {
    /// Whether the key existed before the call, regardless of whether the write applied.
    pub fn existed(&self) -> bool {
        !matches!(self, SetOutcome::Created)
    }

    pub fn is_applied(&self) -> bool {
        !matches!(self, SetOutcome::RejectedStale { .. })
    }

    /// The item that was stored before the call, if any.
    pub fn old(&self) -> Option<&DataItem> {
        match self {
            SetOutcome::Created => None,
            SetOutcome::Applied { old } => Some(old),
            SetOutcome::RejectedStale { current } => Some(current),
        }
    }
}

#[derive(Debug, Default)]
pub struct VersionedStore {
    data: RwLock<BTreeMap<String, DataItem>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, item: DataItem) -> SetOutcome {
        let mut data = self.data.write();
        match data.get_mut(key) {
            None => {
                data.insert(key.to_string(), item);
                SetOutcome::Created
            }
            Some(existing) if item.version >= existing.version => {
                let old = std::mem::replace(existing, item);
                SetOutcome::Applied { old }
            }
            Some(existing) => {
                trace!(
                    key,
                    stored = existing.version,
                    attempted = item.version,
                    "stale write rejected"
                );
                SetOutcome::RejectedStale {
                    current: existing.clone(),
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<DataItem> {
        self.data.read().get(key).cloned()
    }

    /// Remove `key` if the stored version is not newer than `version`.
    pub fn delete(&self, key: &str, version: Version) -> Result<DataItem> {
        let mut data = self.data.write();
        let stored = data
            .get(key)
            .map(|item| item.version)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if stored > version {
            return Err(Error::Conflict {
                key: key.to_string(),
                stored,
                attempted: version,
            });
        }
        data.remove(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Keys matching `pattern` anywhere in the key (unanchored regex search).
    ///
    /// An empty pattern matches every key. Anchor with `^...$` for whole-key matching.
    pub fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let data = self.data.read();
        if pattern.is_empty() {
            return Ok(data.keys().cloned().collect());
        }
        let re = Regex::new(pattern)
            .map_err(|e| Error::Malformed(format!("invalid key pattern {pattern:?}: {e}")))?;
        Ok(data.keys().filter(|k| re.is_match(k)).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, DataItem> {
        self.data.read().clone()
    }

    /// Whole-map JSON snapshot; an empty store encodes as `{}`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.data.read())?)
    }

    /// Replace the entire map with a snapshot produced by [`serialize`](Self::serialize).
    pub fn load(&self, bytes: &[u8]) -> Result<()> {
        let restored: BTreeMap<String, DataItem> = serde_json::from_slice(bytes)?;
        *self.data.write() = restored;
        Ok(())
    }
}
