//! Loss seam.
//!
//! A loss is a pluggable scorer: it receives a [`LossCall`] variant carrying
//! exactly the inputs its calling convention needs and returns a scalar plus
//! the gradient w.r.t. the raw scores. The orchestrator builds the call by
//! pattern-matching the loss kind against the model output, so an
//! unsupported pairing is a configuration error, not a silent branch.

use std::str::FromStr;

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{PixelClError, Result};
use crate::utils::metrics::softmax_channels;

/// The finite set of supported loss calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Plain per-pixel cross entropy.
    CrossEntropy,
    /// Cross entropy with targets smoothed on pixels a confidence map
    /// flags as suspect.
    ConfidenceSmoothed,
    /// Cross entropy weighted by model-produced attention weights.
    AttentionWeighted,
}

impl FromStr for LossKind {
    type Err = PixelClError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross_entropy" => Ok(LossKind::CrossEntropy),
            "confidence_smoothed" => Ok(LossKind::ConfidenceSmoothed),
            "attention_weighted" => Ok(LossKind::AttentionWeighted),
            other => Err(PixelClError::config(format!(
                "unknown loss '{other}' (expected 'cross_entropy', \
                 'confidence_smoothed' or 'attention_weighted')"
            ))),
        }
    }
}

/// One loss invocation, inputs bound per calling convention.
#[derive(Debug)]
pub enum LossCall<'a> {
    CrossEntropy {
        scores: &'a Array4<f32>,
        labels: &'a Array3<u8>,
    },
    ConfidenceSmoothed {
        scores: &'a Array4<f32>,
        labels: &'a Array3<u8>,
        confidence: &'a Array3<f32>,
    },
    AttentionWeighted {
        scores: &'a Array4<f32>,
        labels: &'a Array3<u8>,
        weights: &'a Array3<f32>,
    },
}

/// Scalar loss plus `dLoss/dScores`.
#[derive(Debug)]
pub struct LossScore {
    pub value: f64,
    pub grad_scores: Array4<f32>,
}

pub trait LossFunction {
    fn kind(&self) -> LossKind;

    fn compute(&self, call: LossCall<'_>) -> Result<LossScore>;
}

/// Build the configured loss.
pub fn build_loss(kind: LossKind, smoothing_epsilon: f32) -> Box<dyn LossFunction> {
    match kind {
        LossKind::CrossEntropy => Box::new(CrossEntropyLoss),
        LossKind::ConfidenceSmoothed => Box::new(ConfidenceSmoothedLoss {
            epsilon: smoothing_epsilon,
        }),
        LossKind::AttentionWeighted => Box::new(AttentionWeightedLoss),
    }
}

fn check_shapes(scores: &Array4<f32>, labels: &Array3<u8>) -> Result<()> {
    let (batch, classes, height, width) = scores.dim();
    if labels.dim() != (batch, height, width) {
        return Err(PixelClError::shape(format!(
            "label shape {:?} does not match score shape {:?}",
            labels.shape(),
            scores.shape()
        )));
    }
    for &label in labels.iter() {
        if label as usize >= classes {
            return Err(PixelClError::shape(format!(
                "label value {label} out of range for {classes} classes"
            )));
        }
    }
    Ok(())
}

/// Mean per-pixel negative log likelihood of the observed labels.
pub struct CrossEntropyLoss;

impl LossFunction for CrossEntropyLoss {
    fn kind(&self) -> LossKind {
        LossKind::CrossEntropy
    }

    fn compute(&self, call: LossCall<'_>) -> Result<LossScore> {
        let (scores, labels) = match call {
            LossCall::CrossEntropy { scores, labels } => (scores, labels),
            other => {
                return Err(PixelClError::config(format!(
                    "cross-entropy loss received a mismatched call: {other:?}"
                )))
            }
        };
        check_shapes(scores, labels)?;

        let probs = softmax_channels(scores);
        let (batch, _, height, width) = scores.dim();
        let count = (batch * height * width) as f64;

        let mut value = 0.0f64;
        let mut grad = probs.clone();
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let label = labels[[b, row, col]] as usize;
                    let p = probs[[b, label, row, col]].max(1e-12);
                    value -= (p as f64).ln();
                    grad[[b, label, row, col]] -= 1.0;
                }
            }
        }
        let scale = 1.0 / count as f32;
        grad.mapv_inplace(|g| g * scale);

        Ok(LossScore {
            value: value / count,
            grad_scores: grad,
        })
    }
}

/// Cross entropy against targets that are label-smoothed only on pixels the
/// confidence map flags as suspect; clean pixels keep a one-hot target.
pub struct ConfidenceSmoothedLoss {
    pub epsilon: f32,
}

impl LossFunction for ConfidenceSmoothedLoss {
    fn kind(&self) -> LossKind {
        LossKind::ConfidenceSmoothed
    }

    fn compute(&self, call: LossCall<'_>) -> Result<LossScore> {
        let (scores, labels, confidence) = match call {
            LossCall::ConfidenceSmoothed {
                scores,
                labels,
                confidence,
            } => (scores, labels, confidence),
            other => {
                return Err(PixelClError::config(format!(
                    "confidence-smoothed loss received a mismatched call: {other:?}"
                )))
            }
        };
        check_shapes(scores, labels)?;
        let (batch, classes, height, width) = scores.dim();
        if confidence.dim() != (batch, height, width) {
            return Err(PixelClError::shape(format!(
                "confidence-map shape {:?} does not match score shape {:?}",
                confidence.shape(),
                scores.shape()
            )));
        }

        let probs = softmax_channels(scores);
        let count = (batch * height * width) as f64;
        let off_target = self.epsilon / (classes as f32 - 1.0);

        let mut value = 0.0f64;
        let mut grad = Array4::<f32>::zeros(scores.raw_dim());
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let label = labels[[b, row, col]] as usize;
                    let suspect = confidence[[b, row, col]] > 0.5;
                    for k in 0..classes {
                        let target = match (suspect, k == label) {
                            (false, true) => 1.0,
                            (false, false) => 0.0,
                            (true, true) => 1.0 - self.epsilon,
                            (true, false) => off_target,
                        };
                        let p = probs[[b, k, row, col]];
                        if target > 0.0 {
                            value -= target as f64 * (p.max(1e-12) as f64).ln();
                        }
                        grad[[b, k, row, col]] = (p - target) / count as f32;
                    }
                }
            }
        }

        Ok(LossScore {
            value: value / count,
            grad_scores: grad,
        })
    }
}

/// Cross entropy where each pixel's contribution is scaled by its attention
/// weight; normalized by the total weight.
pub struct AttentionWeightedLoss;

impl LossFunction for AttentionWeightedLoss {
    fn kind(&self) -> LossKind {
        LossKind::AttentionWeighted
    }

    fn compute(&self, call: LossCall<'_>) -> Result<LossScore> {
        let (scores, labels, weights) = match call {
            LossCall::AttentionWeighted {
                scores,
                labels,
                weights,
            } => (scores, labels, weights),
            other => {
                return Err(PixelClError::config(format!(
                    "attention-weighted loss received a mismatched call: {other:?}"
                )))
            }
        };
        check_shapes(scores, labels)?;
        let (batch, classes, height, width) = scores.dim();
        if weights.dim() != (batch, height, width) {
            return Err(PixelClError::shape(format!(
                "attention-weight shape {:?} does not match score shape {:?}",
                weights.shape(),
                scores.shape()
            )));
        }

        let probs = softmax_channels(scores);
        // Guards the all-zero-weight batch.
        let total_weight: f64 = weights.iter().map(|&w| w as f64).sum::<f64>() + 1e-8;

        let mut value = 0.0f64;
        let mut grad = Array4::<f32>::zeros(scores.raw_dim());
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let label = labels[[b, row, col]] as usize;
                    let weight = weights[[b, row, col]];
                    let p = probs[[b, label, row, col]].max(1e-12);
                    value -= weight as f64 * (p as f64).ln();
                    for k in 0..classes {
                        let target = if k == label { 1.0 } else { 0.0 };
                        grad[[b, k, row, col]] =
                            weight * (probs[[b, k, row, col]] - target) / total_weight as f32;
                    }
                }
            }
        }

        Ok(LossScore {
            value: value / total_weight,
            grad_scores: grad,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    fn uniform_scores(batch: usize, classes: usize, side: usize) -> Array4<f32> {
        Array4::<f32>::zeros((batch, classes, side, side))
    }

    #[test]
    fn loss_kind_parses() {
        assert_eq!(
            "cross_entropy".parse::<LossKind>().unwrap(),
            LossKind::CrossEntropy
        );
        assert!("dice".parse::<LossKind>().is_err());
    }

    #[test]
    fn uniform_scores_give_log_k_loss() {
        let scores = uniform_scores(1, 2, 4);
        let labels = Array3::<u8>::zeros((1, 4, 4));
        let score = CrossEntropyLoss
            .compute(LossCall::CrossEntropy {
                scores: &scores,
                labels: &labels,
            })
            .unwrap();
        assert!((score.value - (2.0f64).ln()).abs() < 1e-6);
    }

    #[test]
    fn gradient_sums_to_zero_per_pixel() {
        let mut scores = uniform_scores(1, 3, 2);
        scores[[0, 1, 0, 0]] = 2.0;
        let labels = Array3::<u8>::zeros((1, 2, 2));
        let score = CrossEntropyLoss
            .compute(LossCall::CrossEntropy {
                scores: &scores,
                labels: &labels,
            })
            .unwrap();
        for row in 0..2 {
            for col in 0..2 {
                let sum: f32 = (0..3).map(|k| score.grad_scores[[0, k, row, col]]).sum();
                assert!(sum.abs() < 1e-6);
            }
        }
    }

    #[test]
    fn smoothing_only_touches_suspect_pixels() {
        let scores = uniform_scores(1, 2, 2);
        let labels = Array3::<u8>::zeros((1, 2, 2));
        let clean = Array3::<f32>::zeros((1, 2, 2));
        let mut suspect = Array3::<f32>::zeros((1, 2, 2));
        suspect.fill(1.0);

        let loss = ConfidenceSmoothedLoss { epsilon: 0.2 };
        let clean_value = loss
            .compute(LossCall::ConfidenceSmoothed {
                scores: &scores,
                labels: &labels,
                confidence: &clean,
            })
            .unwrap()
            .value;
        let suspect_value = loss
            .compute(LossCall::ConfidenceSmoothed {
                scores: &scores,
                labels: &labels,
                confidence: &suspect,
            })
            .unwrap()
            .value;
        // Uniform predictions: smoothing cannot change the cross entropy.
        assert!((clean_value - suspect_value).abs() < 1e-6);

        let plain = CrossEntropyLoss
            .compute(LossCall::CrossEntropy {
                scores: &scores,
                labels: &labels,
            })
            .unwrap()
            .value;
        assert!((clean_value - plain).abs() < 1e-6);
    }

    #[test]
    fn zero_weights_zero_the_loss() {
        let scores = uniform_scores(1, 2, 2);
        let labels = Array3::<u8>::zeros((1, 2, 2));
        let weights = Array3::<f32>::zeros((1, 2, 2));
        let score = AttentionWeightedLoss
            .compute(LossCall::AttentionWeighted {
                scores: &scores,
                labels: &labels,
                weights: &weights,
            })
            .unwrap();
        assert!(score.value.abs() < 1e-6);
    }

    #[test]
    fn mismatched_call_is_a_configuration_error() {
        let scores = uniform_scores(1, 2, 2);
        let labels = Array3::<u8>::zeros((1, 2, 2));
        let result = CrossEntropyLoss.compute(LossCall::AttentionWeighted {
            scores: &scores,
            labels: &labels,
            weights: &Array3::<f32>::zeros((1, 2, 2)),
        });
        assert!(matches!(result, Err(PixelClError::Configuration(_))));
    }
}
