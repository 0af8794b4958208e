//! Per-stage orchestrator for a distributed, multi-phase document build
//! pipeline. A [ProcessorTask] runs inside a controller process and manages a
//! fleet of worker processes that read an ordered chain of data sources
//! (bulk snapshots followed by a tailing change-log) and write transformed
//! output to downstream topics. Each host tick executes one control-loop
//! pass: refresh the status index, reconcile the fleet shape, drive the
//! safe-write version protocol, recompute worker targets, persist the
//! checkpoint, and advance along the chain once every worker finished.
//!
//! Document transformation, topic plumbing, and checkpoint storage are
//! external; they plug in through the traits in [checkpoint], [topics],
//! [config], and [scale].

pub mod error;

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod scale;
pub mod source;
pub mod target_info;
pub mod task;
pub mod topics;
pub mod updater;
pub mod worker;
pub mod writer_version;

pub use crate::checkpoint::{
    BasicShape, CheckpointKey, CheckpointStore, FleetShape, Locator, UNKNOWN_OFFSET,
};
pub use crate::config::{BuildStep, ConfigLoader, ControlConfig, ProcessorConfig, RuleConfig};
pub use crate::error::{Error, Result};
pub use crate::metrics::ProcessorMetrics;
pub use crate::source::{DataSourceChain, DataSourceDesc, SourceKind};
pub use crate::task::{Collaborators, InitParams, ProcessorTask, TaskDoc, TaskState, TaskStatusReport};
pub use crate::topics::{OutputDesc, TopicProvisioner, TopicSpec};
pub use crate::worker::{ProcessorNode, ProcessorWorker, WorkerSlot, WorkerStatus, WorkerTarget};
pub use crate::writer_version::{SlotVersion, VersionUpdate, WriterVersion};
