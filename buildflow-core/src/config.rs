//! Orchestrator configuration. Tunables the surrounding system once spread
//! across its environment live in one explicit struct handed to the
//! constructor; rule and control configuration are loaded per cluster through
//! the [ConfigLoader] collaborator and must agree across clusters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::FleetShape;
use crate::error::Result;

const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 5;
const DEFAULT_FRESHNESS_REPORT_INTERVAL_SECS: u64 = 5;
const DEFAULT_LAG_ALERT_THRESHOLD_SECS: u64 = 30 * 60;
const DEFAULT_ALERT_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_SWITCH_SYNC_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_MAX_PARTITION_COUNT: u32 = 256;
const DEFAULT_MAX_PARALLELISM: u32 = 16;

/// Control-loop tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Minimum spacing between safe-checkpoint recomputations.
    pub checkpoint_interval: Duration,
    /// Minimum spacing between freshness reports.
    pub freshness_report_interval: Duration,
    /// Lag beyond which an alert is raised.
    pub lag_alert_threshold: Duration,
    /// Minimum spacing between two lag alerts.
    pub alert_interval: Duration,
    /// Delay between scheduling a source switch and its commit point, so
    /// downstream tailers observe the switch consistently.
    pub switch_sync_interval: Duration,
    pub max_partition_count: u32,
    pub max_parallelism: u32,
    /// Batch mode allows several control-loop passes within one host tick.
    pub batch_mode: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_INTERVAL_SECS),
            freshness_report_interval: Duration::from_secs(DEFAULT_FRESHNESS_REPORT_INTERVAL_SECS),
            lag_alert_threshold: Duration::from_secs(DEFAULT_LAG_ALERT_THRESHOLD_SECS),
            alert_interval: Duration::from_secs(DEFAULT_ALERT_INTERVAL_SECS),
            switch_sync_interval: Duration::from_secs(DEFAULT_SWITCH_SYNC_INTERVAL_SECS),
            max_partition_count: DEFAULT_MAX_PARTITION_COUNT,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            batch_mode: false,
        }
    }
}

/// Stage of the surrounding build this task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStep {
    /// Snapshot sources first, optionally ending on the tailing source.
    Full,
    /// Tailing source only.
    Incremental,
}

/// Shape override for one source index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOverride {
    pub src: u32,
    pub partition_count: u32,
    pub parallelism: u32,
}

/// Processing rule for the managed clusters: fleet sizing, per-source
/// overrides, and where the incremental phase of a full build starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub partition_count: u32,
    pub parallelism: u32,
    #[serde(default)]
    pub source_overrides: Vec<SourceOverride>,
    /// Start timestamp (epoch millis) for the final tailing source of a full
    /// build.
    #[serde(default)]
    pub incremental_start_timestamp: Option<i64>,
}

impl RuleConfig {
    pub fn new(partition_count: u32, parallelism: u32) -> Self {
        RuleConfig {
            partition_count,
            parallelism,
            source_overrides: Vec::new(),
            incremental_start_timestamp: None,
        }
    }

    /// Shape for a source index, honoring any per-source override and the
    /// configured caps.
    pub fn shape_for(&self, src: u32, config: &ProcessorConfig) -> FleetShape {
        let (partition_count, parallelism) = self
            .source_overrides
            .iter()
            .find(|o| o.src == src)
            .map(|o| (o.partition_count, o.parallelism))
            .unwrap_or((self.partition_count, self.parallelism));
        FleetShape::new(
            partition_count.clamp(1, config.max_partition_count),
            parallelism.clamp(1, config.max_parallelism),
        )
    }
}

/// Per-task policy flags from control configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub need_safe_write: bool,
    #[serde(default)]
    pub is_tablet: bool,
    /// A full build may declare itself done without draining the trailing
    /// tailing source.
    #[serde(default)]
    pub skip_tailing_source: bool,
    #[serde(default)]
    pub batch_mask: Option<String>,
    #[serde(default)]
    pub raw_query: Option<String>,
}

/// Loads rule/control configuration and schema ids for one cluster from a
/// config root.
pub trait ConfigLoader {
    fn load_rule_config(&self, config_path: &str, cluster: &str) -> Result<RuleConfig>;

    fn load_control_config(&self, config_path: &str, cluster: &str) -> Result<ControlConfig>;

    fn resolve_schema_id(&self, config_path: &str, cluster: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_for_uses_override() {
        let mut rule = RuleConfig::new(4, 2);
        rule.source_overrides.push(SourceOverride {
            src: 1,
            partition_count: 8,
            parallelism: 1,
        });
        let config = ProcessorConfig::default();
        assert_eq!(rule.shape_for(0, &config), FleetShape::new(4, 2));
        assert_eq!(rule.shape_for(1, &config), FleetShape::new(8, 1));
    }

    #[test]
    fn test_shape_for_clamps_to_caps() {
        let rule = RuleConfig::new(100_000, 0);
        let config = ProcessorConfig::default();
        let shape = rule.shape_for(0, &config);
        assert_eq!(shape.partition_count, DEFAULT_MAX_PARTITION_COUNT);
        assert_eq!(shape.parallelism, 1);
    }
}
