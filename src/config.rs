//! Run configuration.
//!
//! All knobs for a training run live in [`TrainingConfig`]; the effective
//! configuration is snapshotted into the run directory as JSON so a run can
//! always be reproduced from its artifacts.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PixelClError, Result};
use crate::loss::LossKind;
use crate::model::NetworkKind;

/// Configuration for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of output classes (background included).
    pub num_classes: usize,

    /// Fixed (height, width) every batch tensor is cropped to.
    pub cropping_size: (usize, usize),

    /// Anatomical class whose label masks are being trained against.
    pub class_name: String,

    /// Network calling convention to drive.
    pub network: NetworkKind,

    /// Loss calling convention to drive.
    pub loss: LossKind,

    /// Smoothing strength for the confidence-smoothed loss.
    pub smoothing_epsilon: f32,

    /// Whether training batches carry confidence maps from an earlier
    /// noise-detection pass.
    pub load_confidence_maps: bool,

    /// Number of (train, eval) epoch pairs to run.
    pub num_epochs: usize,

    pub batch_size: usize,

    /// Initial learning rate; decayed by `lr_gamma` every `lr_step_size`
    /// completed epoch pairs.
    pub learning_rate: f64,
    pub lr_step_size: usize,
    pub lr_gamma: f64,

    /// Periodic checkpoint interval in epochs (epoch 0 included).
    pub save_epochs: usize,

    /// Seed for the training-subset shuffle.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            cropping_size: (112, 112),
            class_name: "lung".to_string(),
            network: NetworkKind::Segmenter,
            loss: LossKind::CrossEntropy,
            smoothing_epsilon: 0.1,
            load_confidence_maps: false,
            num_epochs: 100,
            batch_size: 4,
            learning_rate: 1e-3,
            lr_step_size: 50,
            lr_gamma: 0.1,
            save_epochs: 10,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(PixelClError::config(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.num_epochs == 0 {
            return Err(PixelClError::config("num_epochs must be positive"));
        }
        if self.batch_size == 0 {
            return Err(PixelClError::config("batch_size must be positive"));
        }
        if self.save_epochs == 0 {
            return Err(PixelClError::config("save_epochs must be positive"));
        }
        if self.lr_step_size == 0 {
            return Err(PixelClError::config("lr_step_size must be positive"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PixelClError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.loss == LossKind::AttentionWeighted && self.network != NetworkKind::AttentionSegmenter {
            return Err(PixelClError::config(
                "the attention-weighted loss requires the attention segmenter network",
            ));
        }
        if self.loss == LossKind::ConfidenceSmoothed && !self.load_confidence_maps {
            return Err(PixelClError::config(
                "the confidence-smoothed loss requires load_confidence_maps",
            ));
        }
        Ok(())
    }

    /// Snapshot the effective configuration into the run directory.
    pub fn snapshot(&self, run_dir: &Path) -> Result<()> {
        fs::create_dir_all(run_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(run_dir.join("config.json"), json)?;
        Ok(())
    }

    /// Load a previously snapshotted configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
