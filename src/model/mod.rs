//! Model and optimizer seams.
//!
//! The segmentation network itself is a collaborator: the orchestrator only
//! needs a forward pass that yields per-pixel class scores (plus, for
//! label-guided architectures, attention weights), gradient propagation and
//! a parameter step. Calling conventions are a closed sum type, so the
//! orchestrator pattern-matches on [`ModelOutput`] instead of branching on
//! network name strings.

pub mod linear;

use std::path::Path;
use std::str::FromStr;

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::dataset::PixelBatch;
use crate::error::{PixelClError, Result};

pub use linear::{LabelAttentionModel, LinearPixelModel};

/// The finite set of supported network calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Plain forward: `batch -> scores`.
    Segmenter,
    /// Label-guided forward: `batch -> (scores, attention weights)`.
    AttentionSegmenter,
}

impl FromStr for NetworkKind {
    type Err = PixelClError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "segmenter" => Ok(NetworkKind::Segmenter),
            "attention_segmenter" => Ok(NetworkKind::AttentionSegmenter),
            other => Err(PixelClError::config(format!(
                "unknown network '{other}' (expected 'segmenter' or 'attention_segmenter')"
            ))),
        }
    }
}

/// Result of one forward pass.
///
/// `scores` are raw (pre-softmax) per-pixel class scores, shape
/// `[batch, num_classes, height, width]`; `weights` are per-pixel attention
/// weights, shape `[batch, height, width]`.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Plain {
        scores: Array4<f32>,
    },
    WithAttention {
        scores: Array4<f32>,
        weights: Array3<f32>,
    },
}

impl ModelOutput {
    pub fn scores(&self) -> &Array4<f32> {
        match self {
            ModelOutput::Plain { scores } => scores,
            ModelOutput::WithAttention { scores, .. } => scores,
        }
    }
}

/// Seam between the orchestrator and the network.
///
/// Gradient bookkeeping is internal to the implementation: `backward`
/// accumulates parameter gradients from the loss gradient w.r.t. the
/// scores, `apply_step` consumes them. Evaluation passes never call either.
pub trait TrainableModel {
    fn network(&self) -> NetworkKind;

    /// Switch between training and evaluation behavior (dropout-style
    /// differences live behind this seam).
    fn set_training(&mut self, training: bool);

    fn forward(&mut self, batch: &PixelBatch) -> Result<ModelOutput>;

    /// Accumulate parameter gradients given `dLoss/dScores`.
    fn backward(&mut self, grad_scores: &Array4<f32>) -> Result<()>;

    fn zero_grad(&mut self);

    fn apply_step(&mut self, learning_rate: f64);

    fn save(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;
}

/// Optimizer seam. One `step` applies exactly one parameter update.
pub trait Optimizer {
    fn zero_grad(&mut self, model: &mut dyn TrainableModel);

    fn step(&mut self, learning_rate: f64, model: &mut dyn TrainableModel) -> Result<()>;
}

/// Plain stochastic gradient descent.
#[derive(Debug, Default)]
pub struct Sgd;

impl Optimizer for Sgd {
    fn zero_grad(&mut self, model: &mut dyn TrainableModel) {
        model.zero_grad();
    }

    fn step(&mut self, learning_rate: f64, model: &mut dyn TrainableModel) -> Result<()> {
        model.apply_step(learning_rate);
        Ok(())
    }
}

/// Build the configured network.
pub fn build_model(kind: NetworkKind, num_classes: usize) -> Box<dyn TrainableModel> {
    match kind {
        NetworkKind::Segmenter => Box::new(LinearPixelModel::new(num_classes)),
        NetworkKind::AttentionSegmenter => Box::new(LabelAttentionModel::new(num_classes)),
    }
}
