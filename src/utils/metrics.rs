//! Per-class overlap metrics.

use ndarray::{Array3, Array4};

use crate::error::{PixelClError, Result};

/// Numerically stable softmax over the class axis of `[B, K, H, W]` scores.
pub fn softmax_channels(scores: &Array4<f32>) -> Array4<f32> {
    let (batch, classes, height, width) = scores.dim();
    let mut probs = Array4::<f32>::zeros(scores.raw_dim());
    for b in 0..batch {
        for row in 0..height {
            for col in 0..width {
                let mut max = f32::NEG_INFINITY;
                for k in 0..classes {
                    max = max.max(scores[[b, k, row, col]]);
                }
                let mut denom = 0.0f32;
                for k in 0..classes {
                    let e = (scores[[b, k, row, col]] - max).exp();
                    probs[[b, k, row, col]] = e;
                    denom += e;
                }
                for k in 0..classes {
                    probs[[b, k, row, col]] /= denom;
                }
            }
        }
    }
    probs
}

/// Metrics collaborator seam: post-process raw scores and produce one
/// overlap value per class.
pub trait BatchScorer {
    fn score_batch(
        &self,
        scores: &Array4<f32>,
        labels: &Array3<u8>,
    ) -> Result<(Array3<u8>, Vec<f64>)>;
}

/// Dice overlap between predicted and reference pixel regions.
pub struct OverlapMetrics {
    num_classes: usize,
}

impl BatchScorer for OverlapMetrics {
    fn score_batch(
        &self,
        scores: &Array4<f32>,
        labels: &Array3<u8>,
    ) -> Result<(Array3<u8>, Vec<f64>)> {
        OverlapMetrics::score_batch(self, scores, labels)
    }
}

impl OverlapMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Post-process raw scores into an argmax label map and score it
    /// against the reference labels, one Dice coefficient per class.
    pub fn score_batch(
        &self,
        scores: &Array4<f32>,
        labels: &Array3<u8>,
    ) -> Result<(Array3<u8>, Vec<f64>)> {
        let (batch, classes, height, width) = scores.dim();
        if classes != self.num_classes {
            return Err(PixelClError::shape(format!(
                "scores carry {classes} classes, metrics configured for {}",
                self.num_classes
            )));
        }
        if labels.dim() != (batch, height, width) {
            return Err(PixelClError::shape(format!(
                "label shape {:?} does not match score shape {:?}",
                labels.shape(),
                scores.shape()
            )));
        }

        let mut predicted = Array3::<u8>::zeros((batch, height, width));
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let mut best = 0usize;
                    let mut best_score = scores[[b, 0, row, col]];
                    for k in 1..classes {
                        let s = scores[[b, k, row, col]];
                        if s > best_score {
                            best = k;
                            best_score = s;
                        }
                    }
                    predicted[[b, row, col]] = best as u8;
                }
            }
        }

        let dice = self.dice_per_class(&predicted, labels);
        Ok((predicted, dice))
    }

    fn dice_per_class(&self, predicted: &Array3<u8>, labels: &Array3<u8>) -> Vec<f64> {
        let mut intersection = vec![0usize; self.num_classes];
        let mut predicted_count = vec![0usize; self.num_classes];
        let mut label_count = vec![0usize; self.num_classes];

        for (&p, &l) in predicted.iter().zip(labels.iter()) {
            let p = p as usize;
            let l = l as usize;
            predicted_count[p] += 1;
            label_count[l] += 1;
            if p == l {
                intersection[p] += 1;
            }
        }

        (0..self.num_classes)
            .map(|k| {
                let denom = predicted_count[k] + label_count[k];
                if denom == 0 {
                    // Class absent from both prediction and reference.
                    1.0
                } else {
                    2.0 * intersection[k] as f64 / denom as f64
                }
            })
            .collect()
    }
}
