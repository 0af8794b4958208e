//! Per-tick hooks external to the core contract: adaptive scaling may
//! propose a new fleet shape, slow-node detection only observes. Both lose
//! their accumulated state on rescale and source switch.

use crate::checkpoint::FleetShape;
use crate::source::SourceKind;
use crate::worker::WorkerStatus;

/// Snapshot handed to the hooks each tick.
pub struct ScaleContext<'a> {
    pub shape: FleetShape,
    pub src: u32,
    pub source_kind: SourceKind,
    pub statuses: &'a [WorkerStatus],
    /// When the fleet was last recreated (epoch millis); hooks re-baseline
    /// from here.
    pub last_rescale_timestamp: Option<i64>,
}

pub trait AdaptiveScaler {
    /// May propose a new fleet shape for the current source.
    fn propose(&mut self, ctx: &ScaleContext<'_>) -> Option<FleetShape>;

    /// Drops accumulated state after a rescale or source switch.
    fn reset(&mut self);
}

pub trait SlowNodeDetector {
    fn observe(&mut self, ctx: &ScaleContext<'_>);

    fn reset(&mut self);
}

/// Keeps whatever shape the rule configuration chose.
#[derive(Debug, Default)]
pub struct NoopScaler;

impl AdaptiveScaler for NoopScaler {
    fn propose(&mut self, _ctx: &ScaleContext<'_>) -> Option<FleetShape> {
        None
    }

    fn reset(&mut self) {}
}

#[derive(Debug, Default)]
pub struct NoopSlowNodeDetector;

impl SlowNodeDetector for NoopSlowNodeDetector {
    fn observe(&mut self, _ctx: &ScaleContext<'_>) {}

    fn reset(&mut self) {}
}
