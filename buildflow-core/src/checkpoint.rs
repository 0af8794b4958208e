//! Position tracking within the ordered data-source chain, and the rule for
//! how far a checkpoint may safely advance. A replaced worker resumes exactly
//! from the persisted checkpoint, so the checkpoint must never move past data
//! a still-running worker has not durably consumed.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::worker::WorkerStatus;

/// Offset value published for a slot that has not reported yet.
pub const UNKNOWN_OFFSET: i64 = -1;

/// Position within the ordered chain of data sources: which source, how far
/// into it, plus an opaque payload the reader threads through restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub src: u32,
    pub offset: i64,
    #[serde(default)]
    pub user_data: Bytes,
}

impl Locator {
    pub fn new(src: u32, offset: i64) -> Self {
        Locator {
            src,
            offset,
            user_data: Bytes::new(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src, self.offset)
    }
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered by source index, then offset. The opaque payload does not
/// participate in ordering.
impl Ord for Locator {
    fn cmp(&self, other: &Self) -> Ordering {
        self.src
            .cmp(&other.src)
            .then(self.offset.cmp(&other.offset))
    }
}

/// Fleet sizing for one step: worker count is the full grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetShape {
    pub partition_count: u32,
    pub parallelism: u32,
}

impl FleetShape {
    pub fn new(partition_count: u32, parallelism: u32) -> Self {
        FleetShape {
            partition_count,
            parallelism,
        }
    }

    pub fn worker_count(&self) -> usize {
        (self.partition_count * self.parallelism) as usize
    }
}

impl fmt::Display for FleetShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}x{})", self.partition_count, self.parallelism)
    }
}

/// Where reading starts for the current step and how wide the fleet fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicShape {
    pub src: u32,
    pub offset: i64,
    pub partition_count: u32,
    pub parallelism: u32,
}

impl BasicShape {
    pub fn shape(&self) -> FleetShape {
        FleetShape::new(self.partition_count, self.parallelism)
    }

    pub fn worker_count(&self) -> usize {
        self.shape().worker_count()
    }
}

/// Checkpoints are shared across tasks through one namespace keyed by
/// (cluster, topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub cluster: String,
    pub topic_id: String,
}

impl CheckpointKey {
    pub fn new(cluster: impl Into<String>, topic_id: impl Into<String>) -> Self {
        CheckpointKey {
            cluster: cluster.into(),
            topic_id: topic_id.into(),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.topic_id)
    }
}

/// Persistent checkpoint storage. Implementations must tolerate concurrent
/// access, since multiple tasks may share a checkpoint namespace.
pub trait CheckpointStore {
    /// Registers a key before first use. Failure fails task init.
    fn register(&self, key: &CheckpointKey) -> Result<()>;

    fn load(&self, key: &CheckpointKey) -> Result<Option<Locator>>;

    /// Loads a checkpoint persisted under an explicit label, used as the
    /// highest-priority start position.
    fn load_named(&self, name: &str) -> Result<Option<Locator>>;

    fn persist(&self, key: &CheckpointKey, locator: &Locator) -> Result<()>;

    fn remove(&self, key: &CheckpointKey) -> Result<()>;
}

/// Minimum offset every still-running worker has confirmed. `None` when any
/// non-finished worker has not reported a locator yet; the caller must not
/// advance in that case, or a replacement would skip that slot's data.
pub(crate) fn min_checkpoint(statuses: &[WorkerStatus]) -> Option<i64> {
    let mut min: Option<i64> = None;
    for status in statuses {
        if status.finished {
            continue;
        }
        let locator = status.current_locator.as_ref()?;
        min = Some(match min {
            Some(current) => current.min(locator.offset),
            None => locator.offset,
        });
    }
    min
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_at(offset: i64) -> WorkerStatus {
        WorkerStatus {
            current_locator: Some(Locator::new(0, offset)),
            ..Default::default()
        }
    }

    #[test]
    fn test_locator_ordering() {
        let a = Locator::new(0, 100);
        let b = Locator::new(1, 5);
        let c = Locator::new(1, 50);
        assert!(a < b);
        assert!(b < c);

        let mut with_payload = Locator::new(1, 5);
        with_payload.user_data = Bytes::from_static(b"cursor");
        assert_eq!(b.cmp(&with_payload), Ordering::Equal);
    }

    #[test]
    fn test_min_checkpoint_requires_all_reported() {
        let statuses = vec![status_at(5), WorkerStatus::default()];
        assert_eq!(min_checkpoint(&statuses), None);
    }

    #[test]
    fn test_min_checkpoint_takes_minimum() {
        let statuses = vec![status_at(12), status_at(7), status_at(9)];
        assert_eq!(min_checkpoint(&statuses), Some(7));
    }

    #[test]
    fn test_min_checkpoint_skips_finished() {
        let mut finished = status_at(2);
        finished.finished = true;
        let mut unreported_finished = WorkerStatus::default();
        unreported_finished.finished = true;
        let statuses = vec![finished, unreported_finished, status_at(8)];
        assert_eq!(min_checkpoint(&statuses), Some(8));
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(FleetShape::new(3, 3).worker_count(), 9);
        assert_eq!(FleetShape::new(2, 1).worker_count(), 2);
    }
}
