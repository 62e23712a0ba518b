//! Epoch orchestration: train/eval passes, metric aggregation, validation
//! tracking and checkpoint gating.
//!
//! One run is `Init -> {TrainEpoch -> EvalEpoch}* -> Terminal`. The
//! orchestrator owns the [`ValidationHistory`]; the checkpoint policy reads
//! it once per epoch to decide whether the current model state becomes the
//! new best checkpoint, independently of the periodic snapshots.

pub mod checkpoint;
pub mod history;
pub mod orchestrator;
pub mod sink;

pub use checkpoint::{CheckpointDecision, CheckpointPolicy, CheckpointSelector, CheckpointStore};
pub use history::ValidationHistory;
pub use orchestrator::{EpochOrchestrator, RunReport};
pub use sink::{NullSink, SinkError, SvgChartSink, TrainingSink};

/// Epoch-level aggregation of per-batch results.
///
/// `loss` is the arithmetic mean of batch losses; `per_class_overlap` the
/// elementwise mean of batch Dice vectors; `total_overlap` the mean over
/// classes of the per-class figures.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub loss: f64,
    pub per_class_overlap: Vec<f64>,
    pub total_overlap: f64,
}
