//! Reference per-pixel linear models.
//!
//! These are intentionally small: a per-pixel affine map from intensity to
//! class scores with a closed-form gradient. They exist so the pipeline can
//! be driven end to end and so every seam has a concrete, deterministic
//! implementation; production networks plug in behind [`TrainableModel`]
//! the same way.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Array3, Array4};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ModelOutput, NetworkKind, TrainableModel};
use crate::dataset::PixelBatch;
use crate::error::{PixelClError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct LinearRecord {
    num_classes: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

/// Per-pixel affine classifier: `score[k] = weight[k] * intensity + bias[k]`.
#[derive(Debug, Clone)]
pub struct LinearPixelModel {
    num_classes: usize,
    weight: Array1<f32>,
    bias: Array1<f32>,
    grad_weight: Array1<f32>,
    grad_bias: Array1<f32>,
    last_input: Option<Array4<f32>>,
    training: bool,
}

impl LinearPixelModel {
    pub fn new(num_classes: usize) -> Self {
        // Deterministic spread so argmax is not degenerate before training.
        let weight =
            Array1::from_iter((0..num_classes).map(|k| (k + 1) as f32 / num_classes as f32));
        Self {
            num_classes,
            weight,
            bias: Array1::zeros(num_classes),
            grad_weight: Array1::zeros(num_classes),
            grad_bias: Array1::zeros(num_classes),
            last_input: None,
            training: false,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn check_input(&self, images: &Array4<f32>) -> Result<()> {
        if images.shape()[1] != 1 {
            return Err(PixelClError::shape(format!(
                "expected single-channel images, got {} channels",
                images.shape()[1]
            )));
        }
        Ok(())
    }

    fn compute_scores(&self, images: &Array4<f32>) -> Array4<f32> {
        let (batch, _, height, width) = images.dim();
        let classes = self.num_classes;
        let mut scores = Array4::<f32>::zeros((batch, classes, height, width));
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let x = images[[b, 0, row, col]];
                    for k in 0..classes {
                        scores[[b, k, row, col]] = self.weight[k] * x + self.bias[k];
                    }
                }
            }
        }
        scores
    }
}

impl TrainableModel for LinearPixelModel {
    fn network(&self) -> NetworkKind {
        NetworkKind::Segmenter
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn forward(&mut self, batch: &PixelBatch) -> Result<ModelOutput> {
        self.check_input(&batch.images)?;
        let scores = self.compute_scores(&batch.images);
        // The input is only needed for the gradient pass.
        self.last_input = self.training.then(|| batch.images.clone());
        Ok(ModelOutput::Plain { scores })
    }

    fn backward(&mut self, grad_scores: &Array4<f32>) -> Result<()> {
        let input = self.last_input.as_ref().ok_or_else(|| {
            PixelClError::shape("backward called before any forward pass")
        })?;
        let (batch, classes, height, width) = grad_scores.dim();
        if classes != self.num_classes || input.shape()[0] != batch {
            return Err(PixelClError::shape(format!(
                "gradient shape {:?} does not match the last forward pass",
                grad_scores.shape()
            )));
        }

        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let x = input[[b, 0, row, col]];
                    for k in 0..classes {
                        let g = grad_scores[[b, k, row, col]];
                        self.grad_weight[k] += g * x;
                        self.grad_bias[k] += g;
                    }
                }
            }
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.grad_weight.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    fn apply_step(&mut self, learning_rate: f64) {
        let lr = learning_rate as f32;
        for k in 0..self.num_classes {
            self.weight[k] -= lr * self.grad_weight[k];
            self.bias[k] -= lr * self.grad_bias[k];
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let record = LinearRecord {
            num_classes: self.num_classes,
            weight: self.weight.to_vec(),
            bias: self.bias.to_vec(),
        };
        fs::write(path, serde_json::to_string_pretty(&record)?)?;
        info!("model state saved to {:?}", path);
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let record: LinearRecord = serde_json::from_str(&fs::read_to_string(path)?)?;
        if record.num_classes != self.num_classes {
            return Err(PixelClError::Checkpoint(format!(
                "checkpoint has {} classes, model expects {}",
                record.num_classes, self.num_classes
            )));
        }
        self.weight = Array1::from_vec(record.weight);
        self.bias = Array1::from_vec(record.bias);
        info!("model state loaded from {:?}", path);
        Ok(())
    }
}

/// Label-guided variant: the same affine scores plus per-pixel attention
/// weights, the weight being the softmax probability assigned to the pixel's
/// observed label.
#[derive(Debug, Clone)]
pub struct LabelAttentionModel {
    inner: LinearPixelModel,
}

impl LabelAttentionModel {
    pub fn new(num_classes: usize) -> Self {
        Self {
            inner: LinearPixelModel::new(num_classes),
        }
    }

    fn attention_weights(scores: &Array4<f32>, labels: &Array3<u8>) -> Array3<f32> {
        let (batch, classes, height, width) = scores.dim();
        let mut weights = Array3::<f32>::zeros((batch, height, width));
        for b in 0..batch {
            for row in 0..height {
                for col in 0..width {
                    let mut max = f32::NEG_INFINITY;
                    for k in 0..classes {
                        max = max.max(scores[[b, k, row, col]]);
                    }
                    let mut denom = 0.0f32;
                    for k in 0..classes {
                        denom += (scores[[b, k, row, col]] - max).exp();
                    }
                    let label = labels[[b, row, col]] as usize;
                    weights[[b, row, col]] =
                        (scores[[b, label, row, col]] - max).exp() / denom;
                }
            }
        }
        weights
    }
}

impl TrainableModel for LabelAttentionModel {
    fn network(&self) -> NetworkKind {
        NetworkKind::AttentionSegmenter
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn forward(&mut self, batch: &PixelBatch) -> Result<ModelOutput> {
        let output = self.inner.forward(batch)?;
        let scores = match output {
            ModelOutput::Plain { scores } => scores,
            ModelOutput::WithAttention { scores, .. } => scores,
        };
        let weights = Self::attention_weights(&scores, &batch.labels);
        Ok(ModelOutput::WithAttention { scores, weights })
    }

    fn backward(&mut self, grad_scores: &Array4<f32>) -> Result<()> {
        self.inner.backward(grad_scores)
    }

    fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    fn apply_step(&mut self, learning_rate: f64) {
        self.inner.apply_step(learning_rate);
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.inner.save(path)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.inner.load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn test_batch(batch: usize, height: usize, width: usize) -> PixelBatch {
        let mut images = Array4::<f32>::zeros((batch, 1, height, width));
        images.fill(0.5);
        PixelBatch {
            images,
            labels: Array3::<u8>::ones((batch, height, width)),
            confidence: None,
            filenames: (0..batch).map(|i| format!("{i}.png")).collect(),
        }
    }

    #[test]
    fn forward_produces_expected_shape() {
        let mut model = LinearPixelModel::new(2);
        let batch = test_batch(3, 4, 5);
        let output = model.forward(&batch).unwrap();
        assert_eq!(output.scores().shape(), &[3, 2, 4, 5]);
    }

    #[test]
    fn gradient_step_moves_parameters() {
        let mut model = LinearPixelModel::new(2);
        model.set_training(true);
        let batch = test_batch(1, 2, 2);
        model.forward(&batch).unwrap();

        let grad = Array4::<f32>::ones((1, 2, 2, 2));
        model.zero_grad();
        model.backward(&grad).unwrap();
        let before = model.bias[0];
        model.apply_step(0.1);
        assert!(model.bias[0] < before);
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");

        let mut model = LinearPixelModel::new(2);
        model.set_training(true);
        let batch = test_batch(1, 2, 2);
        model.forward(&batch).unwrap();
        model.zero_grad();
        model.backward(&Array4::<f32>::ones((1, 2, 2, 2))).unwrap();
        model.apply_step(0.5);
        model.save(&path).unwrap();

        let mut restored = LinearPixelModel::new(2);
        restored.load(&path).unwrap();
        assert_eq!(restored.weight, model.weight);
        assert_eq!(restored.bias, model.bias);
    }

    #[test]
    fn attention_weights_are_label_probabilities() {
        let mut model = LabelAttentionModel::new(2);
        let batch = test_batch(1, 2, 2);
        match model.forward(&batch).unwrap() {
            ModelOutput::WithAttention { weights, .. } => {
                for &w in weights.iter() {
                    assert!(w > 0.0 && w < 1.0);
                }
            }
            ModelOutput::Plain { .. } => panic!("expected attention output"),
        }
    }
}
