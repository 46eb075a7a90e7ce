//! Version / transaction id generation.
//!
//! Ids are `millis * 1_000_000 + node_id * 1_000 + counter`, so "higher id wins" is monotonic per
//! node and roughly time-ordered across nodes.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::types::{NodeId, Version};

const COUNTER_SPAN: u32 = 1_000;
const NODE_SPAN: i64 = 1_000;
const MILLIS_SCALE: i64 = 1_000_000;

/// Source of a total order over write versions.
pub trait VersionSource: Send + Sync + 'static {
    fn next_id(&self) -> Version;
}

pub type Clock = fn() -> i64;

fn wallclock_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct IdGenerator {
    node_id: NodeId,
    counter: AtomicU32,
    clock: Clock,
}

impl IdGenerator {
    pub fn new(node_id: NodeId) -> Result<Self> {
        Self::with_clock(node_id, wallclock_millis)
    }

    pub fn with_clock(node_id: NodeId, clock: Clock) -> Result<Self> {
        if i64::from(node_id) >= NODE_SPAN {
            return Err(Error::Config(format!(
                "node id {node_id} out of range, must be below {NODE_SPAN}"
            )));
        }
        Ok(Self {
            node_id,
            counter: AtomicU32::new(0),
            clock,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Advance the counter, wrapping to 0 when it reaches 1000.
    fn increase_count(&self) -> u32 {
        let prev = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((c + 1) % COUNTER_SPAN)
            })
            .unwrap_or_else(|c| c);
        (prev + 1) % COUNTER_SPAN
    }
}

impl VersionSource for IdGenerator {
    fn next_id(&self) -> Version {
        let millis = (self.clock)();
        millis * MILLIS_SCALE + i64::from(self.node_id) * NODE_SPAN + i64::from(self.increase_count())
    }
}

/// Split an id into `(millis, node_id, counter)`.
pub fn decompose(id: Version) -> (i64, i64, i64) {
    (
        id / MILLIS_SCALE,
        (id % MILLIS_SCALE) / NODE_SPAN,
        id % NODE_SPAN,
    )
}
