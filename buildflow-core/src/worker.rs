//! Worker-facing surface of the orchestrator. The orchestrator never depends
//! on a concrete worker type; every role implements [ProcessorNode] and the
//! control loop stays generic over it. Status fields are written by the
//! heartbeat transport between ticks, targets are read by the placement
//! layer.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Locator;
use crate::topics::OutputDesc;
use crate::writer_version::SlotVersion;

/// Slot a worker occupies in the fleet grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub partition: u16,
    pub replica: u16,
}

impl WorkerSlot {
    /// Slots are laid out partition-major: index = partition * parallelism +
    /// replica.
    pub fn from_index(index: usize, parallelism: u32) -> Self {
        let parallelism = parallelism.max(1) as usize;
        WorkerSlot {
            partition: (index / parallelism) as u16,
            replica: (index % parallelism) as u16,
        }
    }

    pub fn index(&self, parallelism: u32) -> usize {
        self.partition as usize * parallelism.max(1) as usize + self.replica as usize
    }
}

/// Observed per-worker report, refreshed by the heartbeat transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStatus {
    pub finished: bool,
    pub current_locator: Option<Locator>,
    /// Physical identity of the process occupying the slot. Empty until the
    /// transport has observed it.
    pub identity: String,
    pub suspended: bool,
    /// Fatal error reported by the worker, surfaced and aggregated by the
    /// control loop.
    pub last_error: Option<String>,
}

/// Free-form parameter bag carried alongside a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetParameters {
    pub clusters: Vec<String>,
    #[serde(default)]
    pub batch_mask: Option<String>,
    #[serde(default)]
    pub output: Option<OutputDesc>,
    #[serde(default)]
    pub raw_query: Option<String>,
    #[serde(default)]
    pub is_tablet: bool,
    /// Under safe write a worker must not seed its progress from downstream
    /// counters; it would race the fencing bump.
    #[serde(default)]
    pub disable_counter_sync: bool,
    #[serde(default)]
    pub writer_version: Option<SlotVersion>,
}

/// Assignment pushed to one worker: where to read from and how to behave
/// until the next reassignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTarget {
    pub config_path: String,
    /// Serialized description of the current data source, forwarded verbatim.
    pub source_description: String,
    pub start_locator: Locator,
    pub parameters: TargetParameters,
    #[serde(default)]
    pub stop_timestamp: Option<i64>,
}

/// Capability surface the orchestrator needs from a worker, whatever the
/// concrete role.
pub trait ProcessorNode {
    /// Creates a fresh, not-yet-reported handle for a slot.
    fn create(slot: WorkerSlot) -> Self
    where
        Self: Sized;

    fn slot(&self) -> WorkerSlot;

    fn status(&self) -> &WorkerStatus;

    fn set_target(&mut self, target: WorkerTarget);

    fn target(&self) -> Option<&WorkerTarget>;

    /// A worker may only start writing once marked ready; under safe write
    /// that waits for its identity to be observed.
    fn set_ready(&mut self, ready: bool);

    fn is_ready(&self) -> bool;

    fn request_suspend(&mut self);

    fn suspend_requested(&self) -> bool;
}

/// Default processor-role worker handle.
#[derive(Debug, Clone, Default)]
pub struct ProcessorWorker {
    slot: WorkerSlot,
    status: WorkerStatus,
    target: Option<WorkerTarget>,
    ready: bool,
    suspend_requested: bool,
}

impl ProcessorWorker {
    /// Called by the heartbeat transport with the latest observed report.
    pub fn report(&mut self, status: WorkerStatus) {
        self.status = status;
    }
}

impl ProcessorNode for ProcessorWorker {
    fn create(slot: WorkerSlot) -> Self {
        ProcessorWorker {
            slot,
            ..Default::default()
        }
    }

    fn slot(&self) -> WorkerSlot {
        self.slot
    }

    fn status(&self) -> &WorkerStatus {
        &self.status
    }

    fn set_target(&mut self, target: WorkerTarget) {
        self.target = Some(target);
    }

    fn target(&self) -> Option<&WorkerTarget> {
        self.target.as_ref()
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn request_suspend(&mut self) {
        self.suspend_requested = true;
    }

    fn suspend_requested(&self) -> bool {
        self.suspend_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_index_round_trip() {
        for index in 0..9 {
            let slot = WorkerSlot::from_index(index, 3);
            assert_eq!(slot.index(3), index);
        }
        let slot = WorkerSlot::from_index(7, 3);
        assert_eq!(slot.partition, 2);
        assert_eq!(slot.replica, 1);
    }

    #[test]
    fn test_worker_report_replaces_status() {
        let mut worker = ProcessorWorker::create(WorkerSlot::from_index(0, 1));
        assert!(!worker.status().finished);
        worker.report(WorkerStatus {
            finished: true,
            identity: "host-1:2181".to_string(),
            ..Default::default()
        });
        assert!(worker.status().finished);
        assert_eq!(worker.status().identity, "host-1:2181");
    }
}
