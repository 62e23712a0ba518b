//! Dataset access for noisy-label segmentation training.
//!
//! The pipeline never looks inside augmentation or sampling logic; it only
//! consumes fixed-size batches from a [`BatchSource`]. The on-disk layout
//! handled by [`loader`] is:
//!
//! ```text
//! {root}/{subset}/images/*.png                    grayscale inputs
//! {root}/{subset}/{class}-labels/*.png            per-pixel label masks
//! {root}/{subset}/{class}-confident-maps*/*.png   optional confidence maps
//! ```
//!
//! Pixels are flattened in channel-last raster order per image, images in
//! batch iteration order; the confident-learning pass relies on that order
//! to reassemble per-image maps.

pub mod loader;

use std::str::FromStr;

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::error::{PixelClError, Result};

pub use loader::{DiskBatches, NoisyPixelDataset};

/// Which partition of the dataset a pass runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subset {
    Training,
    Validation,
}

impl Subset {
    /// Directory name under the data root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Subset::Training => "training",
            Subset::Validation => "validation",
        }
    }
}

impl FromStr for Subset {
    type Err = PixelClError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "training" => Ok(Subset::Training),
            "validation" => Ok(Subset::Validation),
            other => Err(PixelClError::config(format!(
                "unknown dataset subset '{other}' (expected 'training' or 'validation')"
            ))),
        }
    }
}

/// One fixed-size batch of pixel-level samples.
///
/// `images` is `[batch, 1, height, width]`, `labels` is `[batch, height,
/// width]` with values in `0..num_classes`. `confidence` carries the
/// confidence maps from an earlier noise-detection pass when the run is
/// configured to load them.
#[derive(Debug, Clone)]
pub struct PixelBatch {
    pub images: Array4<f32>,
    pub labels: Array3<u8>,
    pub confidence: Option<Array3<f32>>,
    pub filenames: Vec<String>,
}

impl PixelBatch {
    pub fn len(&self) -> usize {
        self.labels.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sequential source of batches for one epoch.
///
/// `reset` rewinds to the start of the pass (reshuffling when the source is
/// a shuffled training subset); the orchestrator consumes batches strictly
/// in the order produced.
pub trait BatchSource {
    fn reset(&mut self);

    /// The next batch, `None` when the pass is exhausted.
    fn next_batch(&mut self) -> Result<Option<PixelBatch>>;

    /// Number of batches per full pass.
    fn num_batches(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_parses_known_names() {
        assert_eq!("training".parse::<Subset>().unwrap(), Subset::Training);
        assert_eq!("validation".parse::<Subset>().unwrap(), Subset::Validation);
    }

    #[test]
    fn subset_rejects_unknown_names() {
        assert!(matches!(
            "test".parse::<Subset>(),
            Err(PixelClError::Configuration(_))
        ));
    }
}
