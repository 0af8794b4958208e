//! Downstream topic provisioning surface. Topic lifecycle and the broker's
//! writer-version gate are external; the orchestrator only states what must
//! exist.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One downstream topic a step writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub cluster: String,
    pub topic_id: String,
    pub partition_count: u32,
}

/// Output descriptor carried opaquely into worker targets and the persisted
/// task document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDesc {
    pub name: String,
    pub config: String,
}

/// Broker-side collaborator. Provisioning failures are transient: the tick
/// reports not-ready and the host retries next tick.
pub trait TopicProvisioner {
    fn provision(&self, topics: &[TopicSpec]) -> Result<()>;

    fn deregister(&self, topics: &[TopicSpec]) -> Result<()>;

    /// Pushes the safe-write setting and the current writer versions to the
    /// broker so stale writers are fenced before new targets go out.
    fn push_writer_versions(
        &self,
        topic: &TopicSpec,
        enabled: bool,
        major: u32,
        minors: &[u32],
    ) -> Result<()>;
}
