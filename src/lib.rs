//! # pixel_cl
//!
//! Pixel-level confident learning: train a segmentation classifier on
//! noisily labeled images, then use its predictions to detect which pixel
//! labels are likely wrong and emit per-pixel confidence maps that a later
//! training run can use to down-weight or exclude suspect labels.
//!
//! ## Modules
//!
//! - `confident`: confident joint estimation, pruning policies and
//!   confidence-map assembly
//! - `training`: the epoch orchestrator, validation history, checkpoint
//!   policy and progress sinks
//! - `model` / `loss`: the collaborator seams (plus small reference
//!   implementations) the orchestrator drives
//! - `dataset`: fixed-size batch access over the on-disk layout
//! - `config`, `error`, `utils`: run configuration, error types, logging,
//!   metrics and chart rendering
//!
//! ## The feedback loop
//!
//! ```rust,ignore
//! use pixel_cl::confident::{run_detection, DetectOptions};
//!
//! // 1. train the two sub-models (CLI `train`)
//! // 2. detect noise with each model on the other's partition:
//! run_detection(&options)?;
//! // 3. retrain on `all/` with the written confidence maps loaded
//! ```

pub mod confident;
pub mod config;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod model;
pub mod training;
pub mod utils;

pub use config::TrainingConfig;
pub use confident::{JointEstimator, NoiseMask, PruneMethod, Pruner};
pub use dataset::{BatchSource, PixelBatch, Subset};
pub use error::{PixelClError, Result};
pub use loss::{LossFunction, LossKind};
pub use model::{ModelOutput, NetworkKind, TrainableModel};
pub use training::{
    CheckpointPolicy, CheckpointSelector, CheckpointStore, EpochOrchestrator, ValidationHistory,
};

/// Default number of output classes (background plus one structure).
pub const DEFAULT_NUM_CLASSES: usize = 2;

/// Default per-pixel cropping size.
pub const DEFAULT_CROPPING_SIZE: (usize, usize) = (112, 112);

/// Version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
