//! Desired-state computation for the fleet: folds observed worker reports
//! into authoritative per-slot targets and pushes the next assignment to
//! every worker. Owned by the task; cloneable so a speculative copy can
//! validate a config update without touching live state.

use std::time::{Duration, Instant};

use crate::checkpoint::{BasicShape, Locator, UNKNOWN_OFFSET, min_checkpoint};
use crate::source::DataSourceDesc;
use crate::target_info::TargetInfos;
use crate::topics::OutputDesc;
use crate::worker::{ProcessorNode, TargetParameters, WorkerStatus, WorkerTarget};
use crate::writer_version::WriterVersion;

/// Finished-predicate over the fleet. An empty fleet is not finished.
pub(crate) fn all_processors_finished(statuses: &[WorkerStatus]) -> bool {
    !statuses.is_empty() && statuses.iter().all(|s| s.finished)
}

#[derive(Debug, Clone)]
pub struct NodesUpdater {
    config_path: String,
    clusters: Vec<String>,
    output: Option<OutputDesc>,
    batch_mask: Option<String>,
    raw_query: Option<String>,
    stop_timestamp: Option<i64>,
    is_tablet: bool,
    need_safe_write: bool,
    checkpoint_interval: Duration,
    checkpoint: i64,
    last_checkpoint_at: Option<Instant>,
    all_finished: bool,
}

impl NodesUpdater {
    pub(crate) fn new(
        config_path: String,
        clusters: Vec<String>,
        output: Option<OutputDesc>,
        batch_mask: Option<String>,
        raw_query: Option<String>,
        is_tablet: bool,
        need_safe_write: bool,
        checkpoint_interval: Duration,
    ) -> Self {
        NodesUpdater {
            config_path,
            clusters,
            output,
            batch_mask,
            raw_query,
            stop_timestamp: None,
            is_tablet,
            need_safe_write,
            checkpoint_interval,
            checkpoint: UNKNOWN_OFFSET,
            last_checkpoint_at: None,
            all_finished: false,
        }
    }

    /// One pass of target computation.
    ///
    /// Tailing sources feed consumable checkpoints back, so the safe input
    /// offset is recomputed first (rate-limited, forward-only). When every
    /// worker already finished, target regeneration is skipped. Otherwise
    /// each worker's reported locator is folded through the progress cache
    /// and the resulting authoritative target is pushed back to the worker,
    /// carrying the writer version pair when safe write is on.
    pub fn update<N: ProcessorNode>(
        &mut self,
        workers: &mut [N],
        writer_version: &WriterVersion,
        basic: &BasicShape,
        source: &DataSourceDesc,
        target_infos: &mut TargetInfos,
    ) {
        let statuses: Vec<WorkerStatus> = workers.iter().map(|w| w.status().clone()).collect();

        if source.supports_checkpoint() {
            self.refresh_checkpoint(&statuses);
        }

        self.all_finished = all_processors_finished(&statuses);
        if self.all_finished {
            return;
        }

        let candidates: Vec<Option<Locator>> = statuses
            .iter()
            .map(|s| s.current_locator.clone())
            .collect();
        target_infos.update(basic, &candidates);

        for (i, worker) in workers.iter_mut().enumerate() {
            // a worker must not start writing before its identity is known,
            // or a later restart cannot be detected
            let ready = !self.need_safe_write || !worker.status().identity.is_empty();
            worker.set_ready(ready);

            let (offset, user_data) = target_infos
                .get(i)
                .map(|t| (t.offset, t.user_data.clone()))
                .unwrap_or((basic.offset, bytes::Bytes::new()));

            worker.set_target(WorkerTarget {
                config_path: self.config_path.clone(),
                source_description: source.description.clone(),
                start_locator: Locator {
                    src: basic.src,
                    offset,
                    user_data,
                },
                parameters: TargetParameters {
                    clusters: self.clusters.clone(),
                    batch_mask: self.batch_mask.clone(),
                    output: self.output.clone(),
                    raw_query: self.raw_query.clone(),
                    is_tablet: self.is_tablet,
                    disable_counter_sync: self.need_safe_write,
                    writer_version: if self.need_safe_write {
                        Some(writer_version.slot_version(i))
                    } else {
                        None
                    },
                },
                stop_timestamp: self.stop_timestamp,
            });
        }
    }

    fn refresh_checkpoint(&mut self, statuses: &[WorkerStatus]) {
        let now = Instant::now();
        let due = self
            .last_checkpoint_at
            .is_none_or(|at| now.duration_since(at) >= self.checkpoint_interval);
        if !due {
            return;
        }
        self.last_checkpoint_at = Some(now);
        if let Some(derived) = min_checkpoint(statuses) {
            // forward-only
            if derived > self.checkpoint {
                self.checkpoint = derived;
            }
        }
    }

    pub fn checkpoint(&self) -> i64 {
        self.checkpoint
    }

    pub(crate) fn set_checkpoint(&mut self, checkpoint: i64) {
        self.checkpoint = checkpoint;
    }

    pub fn is_all_processors_finished(&self) -> bool {
        self.all_finished
    }

    pub(crate) fn set_stop_timestamp(&mut self, stop_timestamp: Option<i64>) {
        self.stop_timestamp = stop_timestamp;
    }

    pub(crate) fn need_safe_write(&self) -> bool {
        self.need_safe_write
    }

    pub(crate) fn set_need_safe_write(&mut self, need_safe_write: bool) {
        self.need_safe_write = need_safe_write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;
    use crate::worker::{ProcessorWorker, WorkerSlot};

    fn updater(need_safe_write: bool) -> NodesUpdater {
        NodesUpdater::new(
            "zfs://config/root".to_string(),
            vec!["daily".to_string()],
            None,
            None,
            None,
            false,
            need_safe_write,
            Duration::ZERO,
        )
    }

    fn snapshot_source() -> DataSourceDesc {
        DataSourceDesc {
            name: "full-dump".to_string(),
            kind: SourceKind::Snapshot,
            description: "hdfs://dump".to_string(),
        }
    }

    fn tailing_source() -> DataSourceDesc {
        DataSourceDesc {
            name: "changelog".to_string(),
            kind: SourceKind::Tailing,
            description: "broker://changelog".to_string(),
        }
    }

    fn fleet(count: usize, parallelism: u32) -> Vec<ProcessorWorker> {
        (0..count)
            .map(|i| ProcessorWorker::create(WorkerSlot::from_index(i, parallelism)))
            .collect()
    }

    fn report_locator(worker: &mut ProcessorWorker, src: u32, offset: i64) {
        worker.report(WorkerStatus {
            current_locator: Some(Locator::new(src, offset)),
            ..Default::default()
        });
    }

    fn basic(src: u32, offset: i64, partition_count: u32, parallelism: u32) -> BasicShape {
        BasicShape {
            src,
            offset,
            partition_count,
            parallelism,
        }
    }

    // shape (2,1); worker0 at checkpoint 5, worker1 unreported: published
    // start offsets are 5 and -1
    #[test]
    fn test_partial_reports_publish_known_and_unknown_offsets() {
        let mut updater = updater(false);
        let mut workers = fleet(2, 1);
        report_locator(&mut workers[0], 0, 5);

        let mut infos = TargetInfos::default();
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, UNKNOWN_OFFSET, 2, 1),
            &snapshot_source(),
            &mut infos,
        );

        assert_eq!(workers[0].target().unwrap().start_locator.offset, 5);
        assert_eq!(
            workers[1].target().unwrap().start_locator.offset,
            UNKNOWN_OFFSET
        );
    }

    // src 0 -> 1 with offset 10: both workers restart from 10
    #[test]
    fn test_source_switch_resets_start_offsets() {
        let mut updater = updater(false);
        let mut workers = fleet(2, 1);
        report_locator(&mut workers[0], 0, 5);
        let mut infos = TargetInfos::default();

        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, UNKNOWN_OFFSET, 2, 1),
            &snapshot_source(),
            &mut infos,
        );
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(1, 10, 2, 1),
            &tailing_source(),
            &mut infos,
        );

        for worker in &workers {
            let locator = &worker.target().unwrap().start_locator;
            assert_eq!(locator.src, 1);
            assert_eq!(locator.offset, 10);
        }
    }

    // (2,1) -> (3,3): nine target descriptors at the new offset
    #[test]
    fn test_reshape_generates_full_grid_of_targets() {
        let mut updater = updater(false);
        let mut infos = TargetInfos::default();

        let mut workers = fleet(2, 1);
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 2, 1),
            &snapshot_source(),
            &mut infos,
        );

        let mut workers = fleet(9, 3);
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 77, 3, 3),
            &snapshot_source(),
            &mut infos,
        );

        assert_eq!(workers.len(), 9);
        for worker in &workers {
            assert_eq!(worker.target().unwrap().start_locator.offset, 77);
        }
    }

    #[test]
    fn test_readiness_gated_on_identity_under_safe_write() {
        let mut updater = updater(true);
        let mut workers = fleet(2, 1);
        workers[0].report(WorkerStatus {
            identity: "host-0:1445".to_string(),
            current_locator: Some(Locator::new(0, 3)),
            ..Default::default()
        });
        // worker1 has a locator but no identity yet
        report_locator(&mut workers[1], 0, 4);

        let mut infos = TargetInfos::default();
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 2, 1),
            &snapshot_source(),
            &mut infos,
        );

        assert!(workers[0].is_ready());
        assert!(!workers[1].is_ready());
    }

    #[test]
    fn test_safe_write_targets_carry_versions() {
        let mut updater = updater(true);
        let mut version = WriterVersion::default();
        version.force_update_major_version(2);

        let mut workers = fleet(2, 1);
        let mut infos = TargetInfos::default();
        updater.update(
            &mut workers,
            &version,
            &basic(0, 0, 2, 1),
            &snapshot_source(),
            &mut infos,
        );

        for worker in &workers {
            let params = &worker.target().unwrap().parameters;
            assert!(params.disable_counter_sync);
            let slot = params.writer_version.unwrap();
            assert_eq!(slot.major, 1);
            assert_eq!(slot.minor, 1);
        }
    }

    #[test]
    fn test_checkpoint_forward_only() {
        let mut updater = updater(false);
        let mut workers = fleet(2, 1);
        report_locator(&mut workers[0], 0, 30);
        report_locator(&mut workers[1], 0, 40);
        let mut infos = TargetInfos::default();

        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 2, 1),
            &tailing_source(),
            &mut infos,
        );
        assert_eq!(updater.checkpoint(), 30);

        // one worker reports a smaller offset later; checkpoint holds
        report_locator(&mut workers[0], 0, 20);
        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 2, 1),
            &tailing_source(),
            &mut infos,
        );
        assert_eq!(updater.checkpoint(), 30);
    }

    #[test]
    fn test_checkpoint_unknown_until_all_report() {
        let mut updater = updater(false);
        let mut workers = fleet(2, 1);
        report_locator(&mut workers[0], 0, 30);
        let mut infos = TargetInfos::default();

        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 2, 1),
            &tailing_source(),
            &mut infos,
        );
        assert_eq!(updater.checkpoint(), UNKNOWN_OFFSET);
    }

    #[test]
    fn test_finished_fleet_skips_target_regeneration() {
        let mut updater = updater(false);
        let mut workers = fleet(1, 1);
        workers[0].report(WorkerStatus {
            finished: true,
            ..Default::default()
        });
        let mut infos = TargetInfos::default();

        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 1, 1),
            &snapshot_source(),
            &mut infos,
        );

        assert!(updater.is_all_processors_finished());
        assert!(workers[0].target().is_none());
    }

    #[test]
    fn test_stop_timestamp_reaches_targets() {
        let mut updater = updater(false);
        updater.set_stop_timestamp(Some(1_700_000_000_000));
        let mut workers = fleet(1, 1);
        let mut infos = TargetInfos::default();

        updater.update(
            &mut workers,
            &WriterVersion::default(),
            &basic(0, 0, 1, 1),
            &snapshot_source(),
            &mut infos,
        );

        assert_eq!(
            workers[0].target().unwrap().stop_timestamp,
            Some(1_700_000_000_000)
        );
    }
}
