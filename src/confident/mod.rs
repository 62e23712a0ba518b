//! Confident-learning noise detection.
//!
//! Given the noisy labels and predicted probability vectors accumulated
//! over one full dataset pass, this module estimates which pixels are
//! likely mislabeled:
//!
//! 1. [`joint`] estimates a K×K joint count matrix between observed and
//!    latent-true labels, calibrated against the observed label marginals.
//! 2. [`prune`] turns a joint into a per-pixel boolean noise decision under
//!    one of several pruning policies.
//! 3. [`maps`] reshapes the flat decisions back into per-image confidence
//!    maps and persists them as single-channel masks.
//! 4. [`generate`] drives the whole pass for the two cross-trained
//!    sub-models and every requested policy.

pub mod generate;
pub mod joint;
pub mod maps;
pub mod prune;

pub use generate::{run_detection, DetectOptions};
pub use joint::JointEstimator;
pub use maps::{assemble, write_maps};
pub use prune::{NoiseMask, PruneMethod, Pruner};
