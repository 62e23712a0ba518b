//! Confident joint estimation.
//!
//! Two flavors of the same K×K count matrix between observed and
//! latent-true labels:
//!
//! - the *confident* joint gates each assignment on per-class probability
//!   thresholds (pixels meeting no threshold are excluded, not marked);
//! - the *argmax* joint counts plain argmax membership.
//!
//! Both go through the same calibration so their row sums match the
//! observed per-label counts and the total mass equals the pixel count.

use ndarray::Array2;

use crate::error::{PixelClError, Result};

pub struct JointEstimator {
    num_classes: usize,
}

impl JointEstimator {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn check_inputs(&self, labels: &[u8], probs: &Array2<f32>) -> Result<()> {
        if labels.is_empty() {
            return Err(PixelClError::shape("no pixels to estimate from"));
        }
        if probs.nrows() != labels.len() {
            return Err(PixelClError::shape(format!(
                "{} labels but {} probability rows",
                labels.len(),
                probs.nrows()
            )));
        }
        if probs.ncols() != self.num_classes {
            return Err(PixelClError::shape(format!(
                "probability vectors have width {}, expected {}",
                probs.ncols(),
                self.num_classes
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= self.num_classes) {
            return Err(PixelClError::shape(format!(
                "label value {bad} out of range for {} classes",
                self.num_classes
            )));
        }
        Ok(())
    }

    /// Observed count of each label value.
    pub fn label_counts(&self, labels: &[u8]) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes];
        for &label in labels {
            counts[label as usize] += 1;
        }
        counts
    }

    /// Per-class confidence thresholds: the mean predicted probability of
    /// class `k` over the pixels observed as `k`. A class nobody is
    /// labeled with gets `+inf`, making it unreachable for confident
    /// assignment.
    pub fn thresholds(&self, labels: &[u8], probs: &Array2<f32>) -> Result<Vec<f64>> {
        self.check_inputs(labels, probs)?;

        let mut sums = vec![0.0f64; self.num_classes];
        let counts = self.label_counts(labels);
        for (pixel, &label) in labels.iter().enumerate() {
            sums[label as usize] += probs[[pixel, label as usize]] as f64;
        }

        Ok(sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &count)| {
                if count == 0 {
                    f64::INFINITY
                } else {
                    sum / count as f64
                }
            })
            .collect())
    }

    /// Threshold-gated joint: each pixel contributes one count at
    /// `(observed, candidate)` where the candidate is the highest-probability
    /// class meeting its own threshold.
    pub fn confident_joint(&self, labels: &[u8], probs: &Array2<f32>) -> Result<Array2<f64>> {
        let thresholds = self.thresholds(labels, probs)?;
        let k = self.num_classes;

        let mut counts = Array2::<f64>::zeros((k, k));
        for (pixel, &label) in labels.iter().enumerate() {
            let mut candidate: Option<usize> = None;
            let mut candidate_prob = f64::NEG_INFINITY;
            for class in 0..k {
                let p = probs[[pixel, class]] as f64;
                if p >= thresholds[class] && p > candidate_prob {
                    candidate = Some(class);
                    candidate_prob = p;
                }
            }
            if let Some(class) = candidate {
                counts[[label as usize, class]] += 1.0;
            }
        }

        Ok(self.calibrate(counts, &self.label_counts(labels)))
    }

    /// Plain argmax joint: every pixel contributes at
    /// `(observed, argmax class)`, no thresholding.
    pub fn argmax_joint(&self, labels: &[u8], probs: &Array2<f32>) -> Result<Array2<f64>> {
        self.check_inputs(labels, probs)?;
        let k = self.num_classes;

        let mut counts = Array2::<f64>::zeros((k, k));
        for (pixel, &label) in labels.iter().enumerate() {
            let mut best = 0usize;
            let mut best_prob = probs[[pixel, 0]];
            for class in 1..k {
                let p = probs[[pixel, class]];
                if p > best_prob {
                    best = class;
                    best_prob = p;
                }
            }
            counts[[label as usize, best]] += 1.0;
        }

        Ok(self.calibrate(counts, &self.label_counts(labels)))
    }

    /// Two-pass proportional fitting: rows are scaled to the observed
    /// per-label counts (rows with no confident mass put their whole count
    /// on the diagonal), then total mass is renormalized to the pixel
    /// count. Row marginals are exact after this.
    fn calibrate(&self, mut counts: Array2<f64>, label_counts: &[usize]) -> Array2<f64> {
        let k = self.num_classes;
        let total: usize = label_counts.iter().sum();

        for i in 0..k {
            let row_sum: f64 = (0..k).map(|j| counts[[i, j]]).sum();
            if row_sum == 0.0 {
                if label_counts[i] > 0 {
                    counts[[i, i]] = label_counts[i] as f64;
                }
                continue;
            }
            let factor = label_counts[i] as f64 / row_sum;
            for j in 0..k {
                counts[[i, j]] *= factor;
            }
        }

        let mass: f64 = counts.iter().sum();
        if mass > 0.0 {
            let factor = total as f64 / mass;
            counts.mapv_inplace(|c| c * factor);
        }
        counts
    }
}
