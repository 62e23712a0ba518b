//! Checkpoint persistence and the save-gating policy.
//!
//! Two independent triggers fire at epoch end: a periodic snapshot every
//! `save_epochs` epochs (epoch 0 included), and a best-on-validation
//! snapshot whenever the evaluation epoch produced the best score seen so
//! far. Best checkpoints supersede each other: the store deletes every
//! stale best file before writing the new one, so at most one exists.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::history::ValidationHistory;
use crate::error::{PixelClError, Result};
use crate::model::TrainableModel;

const PERIODIC_PREFIX: &str = "model_epoch_";
const BEST_PREFIX: &str = "model_best_on_validation_epoch_";
const EXTENSION: &str = "ckpt";

/// Which checkpoint a loading caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSelector {
    Epoch(usize),
    /// Highest periodic epoch index present.
    Latest,
    /// The distinguished best-on-validation file.
    Best,
}

impl CheckpointSelector {
    /// CLI convention: a negative epoch index selects the best checkpoint.
    pub fn from_epoch_arg(epoch: i64) -> Self {
        if epoch < 0 {
            CheckpointSelector::Best
        } else {
            CheckpointSelector::Epoch(epoch as usize)
        }
    }
}

/// Filesystem layout of one run's checkpoints.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open an existing checkpoint directory; missing directories are fatal
    /// (no silent fallback to fresh initialization when checkpoints are
    /// expected).
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(PixelClError::Checkpoint(format!(
                "checkpoint directory {dir:?} does not exist"
            )));
        }
        Ok(Self { dir })
    }

    /// Create (if needed) and open the checkpoint directory for a new run.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn periodic_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{PERIODIC_PREFIX}{epoch}.{EXTENSION}"))
    }

    pub fn best_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{BEST_PREFIX}{epoch}.{EXTENSION}"))
    }

    /// Every checkpoint file in the store, split into (periodic epochs,
    /// best files). A `.ckpt` file that matches neither naming pattern is
    /// an error: the store refuses to guess what it is.
    fn scan(&self) -> Result<(Vec<(usize, PathBuf)>, Vec<(usize, PathBuf)>)> {
        let mut periodic = Vec::new();
        let mut best = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(EXTENSION)
            {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            // Best first: its prefix embeds the periodic prefix's words.
            if let Some(rest) = stem.strip_prefix(BEST_PREFIX) {
                let epoch = parse_epoch(rest, &path)?;
                best.push((epoch, path));
            } else if let Some(rest) = stem.strip_prefix(PERIODIC_PREFIX) {
                let epoch = parse_epoch(rest, &path)?;
                periodic.push((epoch, path));
            } else {
                return Err(PixelClError::Checkpoint(format!(
                    "unrecognized checkpoint filename {path:?}"
                )));
            }
        }

        periodic.sort_by_key(|&(epoch, _)| epoch);
        best.sort_by_key(|&(epoch, _)| epoch);
        Ok((periodic, best))
    }

    /// Highest periodic epoch present, `None` for an empty store.
    pub fn latest_epoch(&self) -> Result<Option<usize>> {
        let (periodic, _) = self.scan()?;
        Ok(periodic.last().map(|&(epoch, _)| epoch))
    }

    /// Resolve a selector to a concrete checkpoint path.
    pub fn resolve(&self, selector: CheckpointSelector) -> Result<PathBuf> {
        match selector {
            CheckpointSelector::Epoch(epoch) => {
                let path = self.periodic_path(epoch);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(PixelClError::Checkpoint(format!(
                        "no checkpoint for epoch {epoch} in {:?}",
                        self.dir
                    )))
                }
            }
            CheckpointSelector::Latest => {
                let (periodic, _) = self.scan()?;
                periodic.into_iter().last().map(|(_, path)| path).ok_or_else(|| {
                    PixelClError::Checkpoint(format!("no periodic checkpoints in {:?}", self.dir))
                })
            }
            CheckpointSelector::Best => {
                let (_, best) = self.scan()?;
                best.into_iter().last().map(|(_, path)| path).ok_or_else(|| {
                    PixelClError::Checkpoint(format!(
                        "no best-on-validation checkpoint in {:?}",
                        self.dir
                    ))
                })
            }
        }
    }

    pub fn save_periodic(&self, model: &dyn TrainableModel, epoch: usize) -> Result<PathBuf> {
        let path = self.periodic_path(epoch);
        model.save(&path)?;
        Ok(path)
    }

    /// Persist the new best checkpoint, superseding any earlier one.
    pub fn save_best(&self, model: &dyn TrainableModel, epoch: usize) -> Result<PathBuf> {
        let (_, stale) = self.scan()?;
        for (_, path) in stale {
            fs::remove_file(&path)?;
        }
        let path = self.best_path(epoch);
        model.save(&path)?;
        info!("best-on-validation checkpoint now {:?}", path);
        Ok(path)
    }
}

fn parse_epoch(text: &str, path: &Path) -> Result<usize> {
    text.parse().map_err(|_| {
        PixelClError::Checkpoint(format!("unparsable epoch index in {path:?}"))
    })
}

/// Decides, once per epoch, which snapshots to write.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    save_epochs: usize,
}

/// Outcome of one epoch-end evaluation; the triggers are independent and
/// may both fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointDecision {
    pub periodic: bool,
    pub best: bool,
}

impl CheckpointPolicy {
    pub fn new(save_epochs: usize) -> Self {
        Self { save_epochs }
    }

    pub fn on_epoch_end(&self, epoch_idx: usize, history: &ValidationHistory) -> CheckpointDecision {
        CheckpointDecision {
            periodic: epoch_idx % self.save_epochs == 0,
            best: history.latest_is_best(),
        }
    }
}
