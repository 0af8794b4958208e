//! Control-loop metrics and freshness reporting. Metrics are registered into
//! a caller-owned registry; the task works fine without one.

use std::time::{Duration, Instant};

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::{info, warn};

const TASK_LABEL: &str = "task";

const CHECKPOINT_OFFSET: &str = "checkpoint_offset";
const FRESHNESS_LAG_SECONDS: &str = "freshness_lag_seconds";
const RESCALE_TOTAL: &str = "rescale";

#[derive(Clone)]
pub struct ProcessorMetrics {
    pub checkpoint_offset: Family<Vec<(String, String)>, Gauge>,
    pub freshness_lag_seconds: Family<Vec<(String, String)>, Gauge>,
    pub rescale: Family<Vec<(String, String)>, Counter>,
}

impl ProcessorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = ProcessorMetrics {
            checkpoint_offset: Family::default(),
            freshness_lag_seconds: Family::default(),
            rescale: Family::default(),
        };
        registry.register(
            CHECKPOINT_OFFSET,
            "Last persisted checkpoint offset",
            metrics.checkpoint_offset.clone(),
        );
        registry.register(
            FRESHNESS_LAG_SECONDS,
            "Lag between now and the checkpointed position",
            metrics.freshness_lag_seconds.clone(),
        );
        registry.register(
            RESCALE_TOTAL,
            "Fleet reshapes",
            metrics.rescale.clone(),
        );
        metrics
    }

    pub(crate) fn task_labels(task_id: &str) -> Vec<(String, String)> {
        vec![(TASK_LABEL.to_string(), task_id.to_string())]
    }
}

/// Rate-limited freshness reporting with lag alerting. Reports are spaced at
/// least `report_interval` apart; an alert fires when the lag exceeds
/// `alert_threshold` and no alert went out within `alert_interval`.
#[derive(Debug, Clone)]
pub(crate) struct FreshnessReporter {
    report_interval: Duration,
    alert_threshold: Duration,
    alert_interval: Duration,
    last_report: Option<Instant>,
    last_alert: Option<Instant>,
}

impl FreshnessReporter {
    pub(crate) fn new(
        report_interval: Duration,
        alert_threshold: Duration,
        alert_interval: Duration,
    ) -> Self {
        FreshnessReporter {
            report_interval,
            alert_threshold,
            alert_interval,
            last_report: None,
            last_alert: None,
        }
    }

    pub(crate) fn report(
        &mut self,
        task_id: &str,
        lag: Duration,
        metrics: Option<&ProcessorMetrics>,
    ) {
        let now = Instant::now();
        let due = self
            .last_report
            .is_none_or(|at| now.duration_since(at) >= self.report_interval);
        if !due {
            return;
        }
        self.last_report = Some(now);

        if let Some(metrics) = metrics {
            metrics
                .freshness_lag_seconds
                .get_or_create(&ProcessorMetrics::task_labels(task_id))
                .set(lag.as_secs() as i64);
        }
        info!(task_id = %task_id, lag_secs = lag.as_secs(), "freshness");

        if lag > self.alert_threshold {
            let alert_due = self
                .last_alert
                .is_none_or(|at| now.duration_since(at) >= self.alert_interval);
            if alert_due {
                self.last_alert = Some(now);
                warn!(
                    task_id = %task_id,
                    lag_secs = lag.as_secs(),
                    "freshness lag over threshold"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_is_rate_limited() {
        let mut reporter = FreshnessReporter::new(
            Duration::from_secs(3600),
            Duration::from_secs(1800),
            Duration::from_secs(600),
        );
        reporter.report("t1", Duration::from_secs(1), None);
        let first = reporter.last_report;
        assert!(first.is_some());
        reporter.report("t1", Duration::from_secs(2), None);
        assert_eq!(reporter.last_report, first);
    }

    #[test]
    fn test_alert_fires_over_threshold() {
        let mut reporter = FreshnessReporter::new(
            Duration::ZERO,
            Duration::from_secs(1800),
            Duration::from_secs(600),
        );
        reporter.report("t1", Duration::from_secs(60), None);
        assert!(reporter.last_alert.is_none());
        reporter.report("t1", Duration::from_secs(3600), None);
        assert!(reporter.last_alert.is_some());
    }

    #[test]
    fn test_metrics_register() {
        let mut registry = Registry::default();
        let metrics = ProcessorMetrics::new(&mut registry);
        metrics
            .checkpoint_offset
            .get_or_create(&ProcessorMetrics::task_labels("t1"))
            .set(42);
    }
}
