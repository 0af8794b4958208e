//! The per-stage orchestrator. One [ProcessorTask] owns the desired-state
//! computation for one stage of a build: it reconciles the worker fleet
//! against the configured shape, drives the safe-write protocol, walks the
//! data-source chain, and persists checkpoints. The host scheduler invokes
//! [ProcessorTask::run] synchronously, at most once concurrently per task;
//! everything that cannot complete this tick is reported as not-finished and
//! retried on the next one.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::checkpoint::{
    BasicShape, CheckpointKey, CheckpointStore, FleetShape, Locator, UNKNOWN_OFFSET,
};
use crate::config::{BuildStep, ConfigLoader, ControlConfig, ProcessorConfig, RuleConfig};
use crate::error::{Error, Result};
use crate::metrics::{FreshnessReporter, ProcessorMetrics};
use crate::scale::{AdaptiveScaler, ScaleContext, SlowNodeDetector};
use crate::source::DataSourceChain;
use crate::target_info::TargetInfos;
use crate::topics::{OutputDesc, TopicProvisioner, TopicSpec};
use crate::updater::NodesUpdater;
use crate::worker::{ProcessorNode, WorkerSlot, WorkerStatus};
use crate::writer_version::{VersionUpdate, WriterVersion};

/// Lifecycle of a task. Running and the suspend states flip back and forth;
/// Stopped and Finished are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Suspending,
    Suspended,
    Stopped,
    Finished,
}

/// Constructor-injected collaborators. Everything the task touches outside
/// its own state goes through these.
pub struct Collaborators {
    pub checkpoints: Box<dyn CheckpointStore>,
    pub topics: Box<dyn TopicProvisioner>,
    pub configs: Box<dyn ConfigLoader>,
    pub scaler: Box<dyn AdaptiveScaler>,
    pub slow_nodes: Box<dyn SlowNodeDetector>,
    pub metrics: Option<ProcessorMetrics>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("has_metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything init needs besides tunables and collaborators.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub task_id: String,
    pub config_path: String,
    pub clusters: Vec<String>,
    pub chain: DataSourceChain,
    pub step: BuildStep,
    /// Highest-priority start position: a checkpoint persisted under an
    /// explicit label.
    pub start_checkpoint_name: Option<String>,
    /// Caller-supplied `(src, offset)`, used when neither a named nor a
    /// per-cluster checkpoint exists.
    pub start: Option<(u32, i64)>,
    pub output: Option<OutputDesc>,
}

/// Structured status for the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub state: TaskState,
    pub step: BuildStep,
    pub src: u32,
    pub offset: i64,
    pub target_shape: FleetShape,
    pub running_shape: Option<FleetShape>,
    pub checkpoint: i64,
    pub suspend_reason: Option<String>,
    pub worker_errors: Vec<String>,
}

/// Persisted form of a task. One document per task instance; destroyed when
/// the task is terminal and no longer scheduled. The two protocol payloads
/// carry their own format tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDoc {
    pub task_id: String,
    pub config_path: String,
    pub step: BuildStep,
    pub chain: DataSourceChain,
    pub clusters: Vec<String>,
    pub target_shape: FleetShape,
    #[serde(default)]
    pub running_shape: Option<FleetShape>,
    pub src: u32,
    pub offset: i64,
    pub state: TaskState,
    #[serde(default)]
    pub switch_timestamp: Option<i64>,
    #[serde(default)]
    pub scheduled_commit_timestamp: Option<i64>,
    #[serde(default)]
    pub suspend_timestamp: Option<i64>,
    #[serde(default)]
    pub stop_timestamp: Option<i64>,
    #[serde(default)]
    pub suspend_reason: Option<String>,
    #[serde(default)]
    pub schema_ids: BTreeMap<String, String>,
    #[serde(default)]
    pub output: Option<OutputDesc>,
    /// Documents written before rule configs were persisted lack this block;
    /// it is synthesized from the running shape on load.
    #[serde(default)]
    pub rule: Option<RuleConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    /// Absent means no update pending.
    #[serde(default)]
    pub pending_writer_update: Option<VersionUpdate>,
    #[serde(default)]
    pub forced_switch_done: bool,
    #[serde(default)]
    pub finish_requested: bool,
    #[serde(default = "unknown_offset")]
    pub checkpoint: i64,
    pub target_infos: String,
    pub writer_version: String,
}

fn unknown_offset() -> i64 {
    UNKNOWN_OFFSET
}

#[derive(Debug)]
pub struct ProcessorTask {
    config: ProcessorConfig,
    task_id: String,
    state: TaskState,
    step: BuildStep,
    config_path: String,
    clusters: Vec<String>,
    rule: RuleConfig,
    control: ControlConfig,
    chain: DataSourceChain,
    src: u32,
    offset: i64,
    target_shape: FleetShape,
    running_shape: Option<FleetShape>,
    schema_ids: BTreeMap<String, String>,
    output: Option<OutputDesc>,
    target_infos: TargetInfos,
    writer_version: WriterVersion,
    pending_version_update: Option<VersionUpdate>,
    pending_rescale: Option<FleetShape>,
    /// Safe-write setting the broker last saw; a differing control flag is a
    /// flag flip that must be pushed before targets change.
    applied_safe_write: bool,
    updater: NodesUpdater,
    persisted_checkpoint: i64,
    switch_timestamp: Option<i64>,
    scheduled_commit_timestamp: Option<i64>,
    suspend_timestamp: Option<i64>,
    stop_timestamp: Option<i64>,
    suspend_reason: Option<String>,
    finish_requested: bool,
    forced_switch_done: bool,
    rescale_timestamp: Option<i64>,
    topics_provisioned: bool,
    ran_this_tick: bool,
    had_workers: bool,
    backup_statuses: Vec<WorkerStatus>,
    worker_errors: Vec<String>,
    freshness: FreshnessReporter,
    deps: Collaborators,
}

impl ProcessorTask {
    pub fn init(
        params: InitParams,
        config: ProcessorConfig,
        deps: Collaborators,
    ) -> Result<Self> {
        if params.chain.is_empty() {
            return Err(Error::Config("data source chain is empty".to_string()));
        }
        let (rule, control, schema_ids) =
            load_cluster_configs(deps.configs.as_ref(), &params.config_path, &params.clusters)?;

        let output_topic = params
            .output
            .as_ref()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| params.task_id.clone());
        let start = resolve_start(&params, &deps, &output_topic)?;

        for cluster in &params.clusters {
            deps.checkpoints
                .register(&CheckpointKey::new(cluster.clone(), output_topic.clone()))?;
        }

        let target_shape = rule.shape_for(start.src, &config);
        let updater = NodesUpdater::new(
            params.config_path.clone(),
            params.clusters.clone(),
            params.output.clone(),
            control.batch_mask.clone(),
            control.raw_query.clone(),
            control.is_tablet,
            control.need_safe_write,
            config.checkpoint_interval,
        );
        let freshness = FreshnessReporter::new(
            config.freshness_report_interval,
            config.lag_alert_threshold,
            config.alert_interval,
        );

        let mut task = ProcessorTask {
            task_id: params.task_id,
            state: TaskState::Running,
            step: params.step,
            config_path: params.config_path,
            clusters: params.clusters,
            applied_safe_write: control.need_safe_write,
            rule,
            control,
            chain: params.chain,
            src: start.src,
            offset: start.offset,
            target_shape,
            running_shape: None,
            schema_ids,
            output: params.output,
            target_infos: TargetInfos::default(),
            writer_version: WriterVersion::default(),
            pending_version_update: None,
            pending_rescale: None,
            updater,
            persisted_checkpoint: UNKNOWN_OFFSET,
            switch_timestamp: None,
            scheduled_commit_timestamp: None,
            suspend_timestamp: None,
            stop_timestamp: None,
            suspend_reason: None,
            finish_requested: false,
            forced_switch_done: false,
            rescale_timestamp: None,
            topics_provisioned: false,
            ran_this_tick: false,
            had_workers: false,
            backup_statuses: Vec::new(),
            worker_errors: Vec::new(),
            freshness,
            config,
            deps,
        };

        // provisioning failures are transient; the first tick retries
        if let Err(e) = task.provision_step_topics() {
            warn!(task_id = %task.task_id, error = %e, "topic provisioning deferred to first tick");
        }
        info!(
            task_id = %task.task_id,
            src = task.src,
            offset = task.offset,
            shape = %task.target_shape,
            "processor task initialized"
        );
        Ok(task)
    }

    /// Marks a host tick boundary. Outside batch mode a second `run` within
    /// the same tick is refused.
    pub fn begin_tick(&mut self) {
        self.ran_this_tick = false;
    }

    /// One control-loop pass. `Ok(true)` means the task reached a terminal
    /// state; `Ok(false)` is the steady "not finished yet, call again next
    /// tick" answer.
    pub fn run<N: ProcessorNode>(&mut self, workers: &mut Vec<N>) -> Result<bool> {
        match self.state {
            TaskState::Finished | TaskState::Stopped => return Ok(true),
            TaskState::Suspended => return Ok(false),
            TaskState::Suspending => {
                self.confirm_suspend(workers);
                return Ok(false);
            }
            TaskState::Running => {}
        }
        if self.ran_this_tick && !self.config.batch_mode {
            return Ok(false);
        }

        if self.step == BuildStep::Incremental && !self.chain.has_tailing() {
            error!(task_id = %self.task_id, "incremental step without a tailing source");
            return Ok(false);
        }
        let Some(source) = self.chain.get(self.src).cloned() else {
            warn!(task_id = %self.task_id, src = self.src, "source index past the chain end");
            return Ok(false);
        };

        if !self.topics_provisioned {
            if let Err(e) = self.provision_step_topics() {
                warn!(task_id = %self.task_id, error = %e, "topics not ready");
                return Ok(false);
            }
        }

        // refresh the status index; remember the last live reports so a full
        // fleet loss can be recovered from
        let mut statuses: Vec<WorkerStatus> =
            workers.iter().map(|w| w.status().clone()).collect();
        if !statuses.is_empty() {
            self.had_workers = true;
            self.backup_statuses = statuses.clone();
        }

        let proposal = {
            let ctx = ScaleContext {
                shape: self.target_shape,
                src: self.src,
                source_kind: source.kind,
                statuses: &statuses,
                last_rescale_timestamp: self.rescale_timestamp,
            };
            self.deps.scaler.propose(&ctx)
        };
        if let Some(proposed) = proposal {
            let clamped = FleetShape::new(
                proposed.partition_count.clamp(1, self.config.max_partition_count),
                proposed.parallelism.clamp(1, self.config.max_parallelism),
            );
            if clamped != self.target_shape {
                self.pending_rescale = Some(clamped);
            }
        }

        // reconcile fleet shape; the pending rescale is consumed here, at
        // most once per tick
        if let Some(shape) = self.pending_rescale.take() {
            self.target_shape = shape;
        }
        if workers.len() != self.target_shape.worker_count()
            || self.running_shape != Some(self.target_shape)
        {
            self.reshape_fleet(workers);
            statuses = workers.iter().map(|w| w.status().clone()).collect();
        }

        // a safe-write flag flip must reach the broker before anything else
        if self.control.need_safe_write != self.applied_safe_write {
            self.writer_version
                .force_update_major_version(self.target_shape.worker_count());
            if let Err(e) = self.push_writer_versions() {
                warn!(task_id = %self.task_id, error = %e, "safe-write setting push failed");
                return Ok(false);
            }
            self.applied_safe_write = self.control.need_safe_write;
            self.updater.set_need_safe_write(self.control.need_safe_write);
            self.pending_version_update = None;
        }

        if let Some(update) = self.writer_version.update(
            &statuses,
            self.target_shape.partition_count,
            self.target_shape.parallelism,
        ) {
            self.pending_version_update = Some(update);
        }
        if self.applied_safe_write {
            // targets are withheld until the bump is durably applied
            if let Some(update) = self.pending_version_update.take() {
                if let Err(e) = self.push_writer_versions() {
                    warn!(task_id = %self.task_id, error = %e, "writer version push failed");
                    self.pending_version_update = Some(update);
                    return Ok(false);
                }
                info!(
                    task_id = %self.task_id,
                    major = update.major,
                    slots = update.slots.len(),
                    "writer version update applied"
                );
                return Ok(false);
            }
        } else {
            self.pending_version_update = None;
        }

        {
            let ctx = ScaleContext {
                shape: self.target_shape,
                src: self.src,
                source_kind: source.kind,
                statuses: &statuses,
                last_rescale_timestamp: self.rescale_timestamp,
            };
            self.deps.slow_nodes.observe(&ctx);
        }

        let basic = BasicShape {
            src: self.src,
            offset: self.offset,
            partition_count: self.target_shape.partition_count,
            parallelism: self.target_shape.parallelism,
        };
        self.updater.update(
            workers,
            &self.writer_version,
            &basic,
            &source,
            &mut self.target_infos,
        );

        self.worker_errors = statuses
            .iter()
            .filter_map(|s| s.last_error.clone())
            .collect();
        if !self.worker_errors.is_empty() {
            error!(
                task_id = %self.task_id,
                errors = ?self.worker_errors,
                "workers reported fatal errors"
            );
        }

        let checkpoint = self.updater.checkpoint();
        if checkpoint > self.persisted_checkpoint {
            if let Err(e) = self.persist_checkpoint(checkpoint) {
                warn!(task_id = %self.task_id, error = %e, "checkpoint persistence failed");
                return Ok(false);
            }
        }
        if source.is_tailing() && checkpoint > 0 {
            let lag_ms = (Utc::now().timestamp_millis() - checkpoint).max(0);
            self.freshness.report(
                &self.task_id,
                Duration::from_millis(lag_ms as u64),
                self.deps.metrics.as_ref(),
            );
        }

        self.ran_this_tick = true;

        if !self.updater.is_all_processors_finished() {
            return Ok(false);
        }

        info!(task_id = %self.task_id, src = self.src, "all processors finished");
        workers.clear();
        self.running_shape = None;

        if !self.fully_complete() {
            self.switch_to_next_source();
            return Ok(false);
        }

        // deferred switch offset becomes the final position
        if let Some(commit) = self.scheduled_commit_timestamp.take() {
            if commit > self.offset {
                self.offset = commit;
            }
        }
        let final_offset = self.offset.max(self.updater.checkpoint());
        if let Err(e) = self.persist_checkpoint(final_offset) {
            warn!(task_id = %self.task_id, error = %e, "final checkpoint persistence failed");
            return Ok(false);
        }
        if let Err(e) = self.deps.topics.deregister(&self.step_topics()) {
            warn!(task_id = %self.task_id, error = %e, "topic deregistration failed");
            return Ok(false);
        }
        // a completed scheduled switch is a finished build, even though it
        // stopped the workers at the commit point
        self.state = if self.stop_timestamp.is_some() && !self.finish_requested && !self.forced_switch_done
        {
            TaskState::Stopped
        } else {
            TaskState::Finished
        };
        info!(task_id = %self.task_id, state = ?self.state, "task complete");
        Ok(true)
    }

    /// Records suspend intent. Without `force` the fleet is drained first and
    /// the state becomes Suspended only once every worker acknowledged or
    /// finished.
    pub fn suspend_task(&mut self, force: bool, reason: Option<&str>) -> bool {
        match self.state {
            TaskState::Running | TaskState::Suspending => {}
            TaskState::Suspended => return true,
            TaskState::Stopped | TaskState::Finished => return false,
        }
        self.suspend_reason = reason.map(str::to_string);
        if force {
            self.state = TaskState::Suspended;
            self.suspend_timestamp = Some(Utc::now().timestamp_millis());
        } else {
            self.state = TaskState::Suspending;
        }
        info!(task_id = %self.task_id, force, reason = ?self.suspend_reason, "suspend requested");
        true
    }

    pub fn resume(&mut self) -> bool {
        match self.state {
            TaskState::Suspending | TaskState::Suspended => {
                self.state = TaskState::Running;
                self.suspend_reason = None;
                self.suspend_timestamp = None;
                info!(task_id = %self.task_id, "task resumed");
                true
            }
            TaskState::Running | TaskState::Stopped | TaskState::Finished => false,
        }
    }

    /// Records stop intent: workers stop at `timestamp` and the task ends up
    /// Stopped once they drained.
    pub fn stop(&mut self, timestamp: i64) {
        self.stop_timestamp = Some(timestamp);
        self.updater.set_stop_timestamp(Some(timestamp));
        info!(task_id = %self.task_id, timestamp, "stop requested");
    }

    /// Like stop, but the task ends up Finished.
    pub fn finish(&mut self, end_time: i64) -> bool {
        match self.state {
            TaskState::Stopped | TaskState::Finished => false,
            _ => {
                self.finish_requested = true;
                self.stop_timestamp = Some(end_time);
                self.updater.set_stop_timestamp(Some(end_time));
                info!(task_id = %self.task_id, end_time, "finish requested");
                true
            }
        }
    }

    /// Schedules the build switch: legal only on the last tailing source of a
    /// non-incremental step, and only once. Workers stop at the commit point,
    /// which trails now by the sync interval so downstream tailers observe
    /// the switch consistently.
    pub fn switch_build(&mut self) -> bool {
        if self.state != TaskState::Running {
            return false;
        }
        if self.step == BuildStep::Incremental {
            return false;
        }
        if !(self.chain.is_last(self.src) && self.chain.is_tailing(self.src)) {
            return false;
        }
        if self.forced_switch_done {
            return false;
        }
        self.forced_switch_done = true;
        let now = Utc::now().timestamp_millis();
        let commit = now + self.config.switch_sync_interval.as_millis() as i64;
        self.scheduled_commit_timestamp = Some(commit);
        self.switch_timestamp = Some(now);
        self.stop_timestamp = Some(commit);
        self.updater.set_stop_timestamp(Some(commit));
        info!(task_id = %self.task_id, commit, "build switch scheduled");
        true
    }

    /// Re-reads configuration from `config_path` (all managed clusters must
    /// share it). A no-op when nothing changed; rejected without mutation
    /// when the change is illegal for the current source.
    pub fn update_config(&mut self, config_path: &str) -> Result<bool> {
        let (rule, control, schema_ids) =
            load_cluster_configs(self.deps.configs.as_ref(), config_path, &self.clusters)?;
        if config_path == self.config_path && rule == self.rule && control == self.control {
            return Ok(true);
        }
        self.validate_config_update(&rule)?;

        info!(task_id = %self.task_id, config_path, "applying config update");
        self.config_path = config_path.to_string();
        self.rule = rule;
        self.control = control;
        self.schema_ids = schema_ids;
        self.target_shape = self.rule.shape_for(self.src, &self.config);

        // rebuild the updater from the new control config, carrying over the
        // live checkpoint and stop intent; the safe-write flag follows only
        // after the next tick pushed it
        let checkpoint = self.updater.checkpoint();
        let mut updater = NodesUpdater::new(
            self.config_path.clone(),
            self.clusters.clone(),
            self.output.clone(),
            self.control.batch_mask.clone(),
            self.control.raw_query.clone(),
            self.control.is_tablet,
            self.applied_safe_write,
            self.config.checkpoint_interval,
        );
        updater.set_checkpoint(checkpoint);
        updater.set_stop_timestamp(self.stop_timestamp);
        self.updater = updater;
        Ok(true)
    }

    /// Legality of a rule change, probed against a disposable copy of the
    /// live updater state.
    fn validate_config_update(&self, new_rule: &RuleConfig) -> Result<()> {
        let probe = self.updater.clone();
        let current = self.rule.shape_for(self.src, &self.config);
        let proposed = new_rule.shape_for(self.src, &self.config);
        if self.chain.is_tailing(self.src) && proposed.partition_count != current.partition_count {
            return Err(Error::ConfigUpdate(format!(
                "partition count {} -> {} while reading a tailing source",
                current.partition_count, proposed.partition_count
            )));
        }
        if new_rule.incremental_start_timestamp != self.rule.incremental_start_timestamp
            && proposed == current
        {
            return Err(Error::ConfigUpdate(
                "incremental start timestamp changed without a shape change".to_string(),
            ));
        }
        drop(probe);
        Ok(())
    }

    pub fn is_tablet(&self) -> bool {
        self.control.is_tablet
    }

    pub fn task_identifier(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn status_report(&self) -> TaskStatusReport {
        TaskStatusReport {
            task_id: self.task_id.clone(),
            state: self.state,
            step: self.step,
            src: self.src,
            offset: self.offset,
            target_shape: self.target_shape,
            running_shape: self.running_shape,
            checkpoint: self.updater.checkpoint(),
            suspend_reason: self.suspend_reason.clone(),
            worker_errors: self.worker_errors.clone(),
        }
    }

    pub fn to_doc(&self) -> Result<TaskDoc> {
        Ok(TaskDoc {
            task_id: self.task_id.clone(),
            config_path: self.config_path.clone(),
            step: self.step,
            chain: self.chain.clone(),
            clusters: self.clusters.clone(),
            target_shape: self.target_shape,
            running_shape: self.running_shape,
            src: self.src,
            offset: self.offset,
            state: self.state,
            switch_timestamp: self.switch_timestamp,
            scheduled_commit_timestamp: self.scheduled_commit_timestamp,
            suspend_timestamp: self.suspend_timestamp,
            stop_timestamp: self.stop_timestamp,
            suspend_reason: self.suspend_reason.clone(),
            schema_ids: self.schema_ids.clone(),
            output: self.output.clone(),
            rule: Some(self.rule.clone()),
            control: self.control.clone(),
            pending_writer_update: self.pending_version_update.clone(),
            forced_switch_done: self.forced_switch_done,
            finish_requested: self.finish_requested,
            checkpoint: self.persisted_checkpoint,
            target_infos: self.target_infos.to_payload()?,
            writer_version: self.writer_version.to_payload()?,
        })
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(&self.to_doc()?).map_err(|e| Error::Task(e.to_string()))
    }

    pub fn restore(doc: TaskDoc, config: ProcessorConfig, deps: Collaborators) -> Result<Self> {
        let target_infos = TargetInfos::from_payload(&doc.target_infos)?;
        let writer_version = WriterVersion::from_payload(&doc.writer_version)?;
        let rule = doc.rule.unwrap_or_else(|| {
            let shape = doc.running_shape.unwrap_or(doc.target_shape);
            RuleConfig::new(shape.partition_count, shape.parallelism)
        });

        let mut updater = NodesUpdater::new(
            doc.config_path.clone(),
            doc.clusters.clone(),
            doc.output.clone(),
            doc.control.batch_mask.clone(),
            doc.control.raw_query.clone(),
            doc.control.is_tablet,
            doc.control.need_safe_write,
            config.checkpoint_interval,
        );
        updater.set_checkpoint(doc.checkpoint);
        updater.set_stop_timestamp(doc.stop_timestamp);
        let freshness = FreshnessReporter::new(
            config.freshness_report_interval,
            config.lag_alert_threshold,
            config.alert_interval,
        );

        Ok(ProcessorTask {
            task_id: doc.task_id,
            state: doc.state,
            step: doc.step,
            config_path: doc.config_path,
            clusters: doc.clusters,
            applied_safe_write: doc.control.need_safe_write,
            rule,
            control: doc.control,
            chain: doc.chain,
            src: doc.src,
            offset: doc.offset,
            target_shape: doc.target_shape,
            // the restored process has no live fleet yet
            running_shape: None,
            schema_ids: doc.schema_ids,
            output: doc.output,
            target_infos,
            writer_version,
            pending_version_update: doc.pending_writer_update,
            pending_rescale: None,
            updater,
            persisted_checkpoint: doc.checkpoint,
            switch_timestamp: doc.switch_timestamp,
            scheduled_commit_timestamp: doc.scheduled_commit_timestamp,
            suspend_timestamp: doc.suspend_timestamp,
            stop_timestamp: doc.stop_timestamp,
            suspend_reason: doc.suspend_reason,
            finish_requested: doc.finish_requested,
            forced_switch_done: doc.forced_switch_done,
            rescale_timestamp: None,
            topics_provisioned: false,
            ran_this_tick: false,
            had_workers: false,
            backup_statuses: Vec::new(),
            worker_errors: Vec::new(),
            freshness,
            config,
            deps,
        })
    }

    pub fn deserialize(payload: &str, config: ProcessorConfig, deps: Collaborators) -> Result<Self> {
        let doc: TaskDoc = serde_json::from_str(payload)
            .map_err(|e| Error::Task(format!("task document: {e}")))?;
        Self::restore(doc, config, deps)
    }

    fn reshape_fleet<N: ProcessorNode>(&mut self, workers: &mut Vec<N>) {
        let shape = self.target_shape;
        self.deps.scaler.reset();
        self.deps.slow_nodes.reset();
        self.rescale_timestamp = Some(Utc::now().timestamp_millis());
        let no_live_nodes = workers.is_empty();
        workers.clear();
        for i in 0..shape.worker_count() {
            let mut worker = N::create(WorkerSlot::from_index(i, shape.parallelism));
            // under safe write a fresh worker may not write until its
            // identity has been observed
            worker.set_ready(!self.control.need_safe_write);
            workers.push(worker);
        }
        if no_live_nodes && !self.backup_statuses.is_empty() {
            // fold the last observed progress back in so losing the whole
            // fleet does not restart the step from its base offset
            let candidates: Vec<Option<Locator>> = self
                .backup_statuses
                .iter()
                .map(|s| s.current_locator.clone())
                .collect();
            let basic = BasicShape {
                src: self.src,
                offset: self.offset,
                partition_count: shape.partition_count,
                parallelism: shape.parallelism,
            };
            self.target_infos.update(&basic, &candidates);
        }
        self.running_shape = Some(shape);
        if let Some(metrics) = &self.deps.metrics {
            metrics
                .rescale
                .get_or_create(&ProcessorMetrics::task_labels(&self.task_id))
                .inc();
        }
        info!(task_id = %self.task_id, shape = %shape, "fleet recreated");
    }

    fn confirm_suspend<N: ProcessorNode>(&mut self, workers: &mut Vec<N>) {
        if workers.is_empty() {
            if self.had_workers {
                // zero live workers cannot acknowledge a suspend; bring the
                // fleet back instead of declaring a false one
                self.reshape_fleet(workers);
                return;
            }
            self.state = TaskState::Suspended;
            self.suspend_timestamp = Some(Utc::now().timestamp_millis());
            return;
        }
        for worker in workers.iter_mut() {
            let status = worker.status();
            if !status.suspended && !status.finished && !worker.suspend_requested() {
                worker.request_suspend();
            }
        }
        let all_acknowledged = workers
            .iter()
            .all(|w| w.status().suspended || w.status().finished);
        if all_acknowledged {
            self.state = TaskState::Suspended;
            self.suspend_timestamp = Some(Utc::now().timestamp_millis());
            info!(task_id = %self.task_id, reason = ?self.suspend_reason, "task suspended");
        }
    }

    fn fully_complete(&self) -> bool {
        if self.forced_switch_done {
            return true;
        }
        if self.chain.is_last(self.src) {
            return true;
        }
        if self.step == BuildStep::Full && self.control.skip_tailing_source {
            let remaining_all_tailing =
                (self.src + 1..self.chain.len() as u32).all(|i| self.chain.is_tailing(i));
            if remaining_all_tailing {
                return true;
            }
        }
        false
    }

    fn switch_to_next_source(&mut self) {
        self.src += 1;
        self.offset = 0;
        self.scheduled_commit_timestamp = None;
        let entering_final_tailing = self.step == BuildStep::Full
            && self.chain.is_last(self.src)
            && self.chain.is_tailing(self.src);
        if entering_final_tailing {
            if let Some(start) = self.rule.incremental_start_timestamp {
                self.offset = start;
                self.scheduled_commit_timestamp =
                    Some(start + self.config.switch_sync_interval.as_millis() as i64);
            }
        }
        self.switch_timestamp = Some(Utc::now().timestamp_millis());
        self.rescale_timestamp = None;
        self.pending_rescale = None;
        self.deps.scaler.reset();
        self.deps.slow_nodes.reset();
        self.target_shape = self.rule.shape_for(self.src, &self.config);
        self.persisted_checkpoint = UNKNOWN_OFFSET;
        self.updater.set_checkpoint(UNKNOWN_OFFSET);
        self.topics_provisioned = false;
        self.had_workers = false;
        self.backup_statuses.clear();
        if let Err(e) = self.provision_step_topics() {
            warn!(task_id = %self.task_id, error = %e, "topic provisioning deferred");
        }
        info!(
            task_id = %self.task_id,
            src = self.src,
            offset = self.offset,
            shape = %self.target_shape,
            "switched to next data source"
        );
    }

    fn output_topic_name(&self) -> String {
        self.output
            .as_ref()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| self.task_id.clone())
    }

    fn step_topics(&self) -> Vec<TopicSpec> {
        let name = self.output_topic_name();
        self.clusters
            .iter()
            .map(|cluster| TopicSpec {
                cluster: cluster.clone(),
                topic_id: format!("{}-{}", name, self.src),
                partition_count: self.target_shape.partition_count,
            })
            .collect()
    }

    fn provision_step_topics(&mut self) -> Result<()> {
        self.deps.topics.provision(&self.step_topics())?;
        self.topics_provisioned = true;
        Ok(())
    }

    fn push_writer_versions(&self) -> Result<()> {
        for topic in self.step_topics() {
            self.deps.topics.push_writer_versions(
                &topic,
                self.control.need_safe_write,
                self.writer_version.major(),
                self.writer_version.minors(),
            )?;
        }
        Ok(())
    }

    fn persist_checkpoint(&mut self, checkpoint: i64) -> Result<()> {
        let locator = Locator::new(self.src, checkpoint);
        for cluster in &self.clusters {
            let key = CheckpointKey::new(cluster.clone(), self.output_topic_name());
            self.deps.checkpoints.persist(&key, &locator)?;
        }
        self.persisted_checkpoint = checkpoint;
        if let Some(metrics) = &self.deps.metrics {
            metrics
                .checkpoint_offset
                .get_or_create(&ProcessorMetrics::task_labels(&self.task_id))
                .set(checkpoint);
        }
        Ok(())
    }
}

fn load_cluster_configs(
    configs: &dyn ConfigLoader,
    config_path: &str,
    clusters: &[String],
) -> Result<(RuleConfig, ControlConfig, BTreeMap<String, String>)> {
    let mut iter = clusters.iter();
    let Some(first) = iter.next() else {
        return Err(Error::Config("no clusters configured".to_string()));
    };
    let rule = configs.load_rule_config(config_path, first)?;
    let control = configs.load_control_config(config_path, first)?;
    let mut schema_ids = BTreeMap::new();
    schema_ids.insert(
        first.clone(),
        configs.resolve_schema_id(config_path, first)?,
    );
    for cluster in iter {
        if configs.load_rule_config(config_path, cluster)? != rule {
            return Err(Error::Config(format!(
                "cluster {cluster} disagrees on rule config"
            )));
        }
        if configs.load_control_config(config_path, cluster)? != control {
            return Err(Error::Config(format!(
                "cluster {cluster} disagrees on control config"
            )));
        }
        schema_ids.insert(
            cluster.clone(),
            configs.resolve_schema_id(config_path, cluster)?,
        );
    }
    Ok((rule, control, schema_ids))
}

fn resolve_start(
    params: &InitParams,
    deps: &Collaborators,
    output_topic: &str,
) -> Result<Locator> {
    if let Some(name) = &params.start_checkpoint_name {
        if let Some(locator) = deps.checkpoints.load_named(name)? {
            info!(name = %name, locator = %locator, "starting from named checkpoint");
            return Ok(locator);
        }
        warn!(name = %name, "named checkpoint not found, falling back");
    }
    let mut persisted: Option<Locator> = None;
    for cluster in &params.clusters {
        let key = CheckpointKey::new(cluster.clone(), output_topic);
        if let Some(locator) = deps.checkpoints.load(&key)? {
            persisted = Some(match persisted {
                Some(existing) => existing.min(locator),
                None => locator,
            });
        }
    }
    if let Some(locator) = persisted {
        info!(locator = %locator, "starting from persisted checkpoint");
        return Ok(locator);
    }
    if let Some((src, offset)) = params.start {
        return Ok(Locator::new(src, offset));
    }
    let offset = if params.chain.is_tailing(0) {
        Utc::now().timestamp_millis()
    } else {
        0
    };
    Ok(Locator::new(0, offset))
}
