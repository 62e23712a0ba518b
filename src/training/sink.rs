//! Progress sinks: where epoch curves go.
//!
//! Sinks return a `Result` instead of throwing. The orchestrator logs a
//! failure and moves on, so a broken chart backend can never abort an
//! epoch.

use std::path::PathBuf;

use thiserror::Error;

use super::EpochSummary;
use crate::utils::charts::{write_line_chart, Series};

/// Errors a sink may report. Callers discard these after logging.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("chart rendering failed: {0}")]
    Render(#[from] std::io::Error),
}

/// Receives per-batch and per-epoch progress records.
pub trait TrainingSink {
    fn record_batch(
        &mut self,
        training: bool,
        epoch_idx: usize,
        batch_idx: usize,
        loss: f64,
    ) -> Result<(), SinkError>;

    fn record_epoch(
        &mut self,
        training: bool,
        epoch_idx: usize,
        summary: &EpochSummary,
    ) -> Result<(), SinkError>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TrainingSink for NullSink {
    fn record_batch(&mut self, _: bool, _: usize, _: usize, _: f64) -> Result<(), SinkError> {
        Ok(())
    }

    fn record_epoch(&mut self, _: bool, _: usize, _: &EpochSummary) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Maintains SVG training curves in the run directory: one loss chart, one
/// total-overlap chart and one chart per class, each with a training and a
/// validation series.
pub struct SvgChartSink {
    output_dir: PathBuf,
    loss: [Series; 2],
    total: [Series; 2],
    per_class: Vec<[Series; 2]>,
}

impl SvgChartSink {
    pub fn new(output_dir: impl Into<PathBuf>, num_classes: usize) -> Self {
        let pair = |name: &str| {
            [
                Series::new(format!("training_{name}")),
                Series::new(format!("validation_{name}")),
            ]
        };
        Self {
            output_dir: output_dir.into(),
            loss: pair("loss"),
            total: pair("dice"),
            per_class: (0..num_classes).map(|_| pair("dice")).collect(),
        }
    }

    fn render(&self) -> Result<(), SinkError> {
        write_line_chart(
            "loss",
            "epoch",
            "loss",
            &self.loss,
            &self.output_dir.join("loss.svg"),
        )?;
        write_line_chart(
            "metrics_total_dice",
            "epoch",
            "dice",
            &self.total,
            &self.output_dir.join("metrics_total_dice.svg"),
        )?;
        for (class_idx, series) in self.per_class.iter().enumerate() {
            write_line_chart(
                &format!("metrics_dice_class_{class_idx}"),
                "epoch",
                "dice",
                series,
                &self
                    .output_dir
                    .join(format!("metrics_dice_class_{class_idx}.svg")),
            )?;
        }
        Ok(())
    }
}

impl TrainingSink for SvgChartSink {
    fn record_batch(&mut self, _: bool, _: usize, _: usize, _: f64) -> Result<(), SinkError> {
        // Batch-level points would swamp the charts; epochs are enough.
        Ok(())
    }

    fn record_epoch(
        &mut self,
        training: bool,
        epoch_idx: usize,
        summary: &EpochSummary,
    ) -> Result<(), SinkError> {
        let slot = usize::from(!training);
        let x = epoch_idx as f64;
        self.loss[slot].push(x, summary.loss);
        self.total[slot].push(x, summary.total_overlap);
        for (class_idx, series) in self.per_class.iter_mut().enumerate() {
            if let Some(&dice) = summary.per_class_overlap.get(class_idx) {
                series[slot].push(x, dice);
            }
        }
        self.render()
    }
}
