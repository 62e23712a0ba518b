//! Full noise-detection pass over the two cross-trained sub-models.
//!
//! Sub-model 1 was trained on the `sub-1` partition, so it scores `sub-2`,
//! and vice versa; each pass writes the confidence maps for its partition's
//! images, and together they cover the whole dataset under
//! `{root}/all/{subset}`.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::info;

use super::maps::write_maps;
use super::prune::{PruneMethod, Pruner};
use crate::dataset::{BatchSource, DiskBatches, NoisyPixelDataset, Subset};
use crate::error::{PixelClError, Result};
use crate::model::{build_model, NetworkKind};
use crate::training::checkpoint::{CheckpointSelector, CheckpointStore};
use crate::utils::metrics::softmax_channels;

/// Everything one detection run needs.
pub struct DetectOptions {
    pub data_root: PathBuf,
    /// Run directory of sub-model 1 (contains `ckpt/`).
    pub model_dir: PathBuf,
    /// Run directory of sub-model 2; derived from `model_dir` by the
    /// `sub_1` -> `sub_2` naming convention when not given.
    pub model_sub_2_dir: Option<PathBuf>,
    pub class_name: String,
    pub methods: Vec<PruneMethod>,
    pub subset: Subset,
    pub batch_size: usize,
    pub checkpoint: CheckpointSelector,
    pub network: NetworkKind,
    pub num_classes: usize,
    pub cropping_size: (usize, usize),
}

/// One fully materialized evaluation pass.
struct AccumulatedPass {
    labels: Vec<u8>,
    probs: Array2<f32>,
    shapes: Vec<(usize, usize)>,
    filenames: Vec<String>,
}

/// Run estimation + pruning for both sub-models and every requested
/// method, writing one confidence map per source image.
pub fn run_detection(options: &DetectOptions) -> Result<()> {
    if options.methods.is_empty() {
        return Err(PixelClError::config("no pruning methods requested"));
    }

    for model_idx in [1usize, 2] {
        info!("scoring partition of sub model {model_idx}");
        let pass = accumulate_pass(options, model_idx)?;
        for &method in &options.methods {
            detect_and_write(options, &pass, method)?;
        }
    }
    Ok(())
}

fn sub_2_model_dir(options: &DetectOptions) -> PathBuf {
    if let Some(dir) = &options.model_sub_2_dir {
        return dir.clone();
    }
    let name = options
        .model_dir
        .file_name()
        .map(|n| n.to_string_lossy().replace("sub_1", "sub_2"))
        .unwrap_or_default();
    match options.model_dir.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn accumulate_pass(options: &DetectOptions, model_idx: usize) -> Result<AccumulatedPass> {
    // Each model scores the partition the *other* one was trained on.
    let (data_dir, model_dir) = if model_idx == 1 {
        (options.data_root.join("sub-2"), options.model_dir.clone())
    } else {
        (options.data_root.join("sub-1"), sub_2_model_dir(options))
    };

    let store = CheckpointStore::open(model_dir.join("ckpt"))?;
    let checkpoint = store.resolve(options.checkpoint)?;
    let mut model = build_model(options.network, options.num_classes);
    model.load(&checkpoint)?;
    model.set_training(false);

    let dataset = NoisyPixelDataset::load(
        &data_dir,
        options.subset,
        &options.class_name,
        options.num_classes,
        options.cropping_size,
        None,
    )?;
    let mut batches = DiskBatches::new(dataset, options.batch_size, false, 0);

    let classes = options.num_classes;
    let mut labels: Vec<u8> = Vec::new();
    let mut flat_probs: Vec<f32> = Vec::new();
    let mut shapes: Vec<(usize, usize)> = Vec::new();
    let mut filenames: Vec<String> = Vec::new();

    while let Some(batch) = batches.next_batch()? {
        let output = model.forward(&batch)?;
        let probs = softmax_channels(output.scores());
        let (batch_len, _, height, width) = probs.dim();

        // Channel-last raster order per image, images in iteration order.
        for b in 0..batch_len {
            for row in 0..height {
                for col in 0..width {
                    labels.push(batch.labels[[b, row, col]]);
                    for k in 0..classes {
                        flat_probs.push(probs[[b, k, row, col]]);
                    }
                }
            }
            shapes.push((height, width));
        }
        filenames.extend(batch.filenames.iter().cloned());
    }

    let rows = labels.len();
    let probs = Array2::from_shape_vec((rows, classes), flat_probs)
        .map_err(|err| PixelClError::shape(err.to_string()))?;

    info!(
        "accumulated {} pixels over {} images from {:?}",
        rows,
        filenames.len(),
        data_dir
    );
    Ok(AccumulatedPass {
        labels,
        probs,
        shapes,
        filenames,
    })
}

fn detect_and_write(
    options: &DetectOptions,
    pass: &AccumulatedPass,
    method: PruneMethod,
) -> Result<()> {
    let pruner = Pruner::new(options.num_classes);
    let mask = pruner.prune(&pass.labels, &pass.probs, method)?;

    let output_dir = confidence_map_dir(
        &options.data_root,
        options.subset,
        &options.class_name,
        method,
    );
    info!(
        "method {method}: {} of {} pixels flagged as noise",
        mask.count_noisy(),
        mask.len()
    );
    write_maps(&mask, &pass.shapes, &pass.filenames, &output_dir)
}

/// `{root}/all/{subset}/{class}-confident-maps`, method-qualified for
/// everything but the default policy.
pub fn confidence_map_dir(
    data_root: &Path,
    subset: Subset,
    class_name: &str,
    method: PruneMethod,
) -> PathBuf {
    let dir_name = match method.dir_suffix() {
        None => format!("{class_name}-confident-maps"),
        Some(suffix) => format!("{class_name}-confident-maps-{suffix}"),
    };
    data_root.join("all").join(subset.dir_name()).join(dir_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearPixelModel;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn write_gray(path: &Path, size: u32, value: u8) {
        GrayImage::from_pixel(size, size, Luma([value]))
            .save(path)
            .unwrap();
    }

    fn build_partition(root: &Path, partition: &str, names: &[&str]) {
        let images = root.join(partition).join("training/images");
        let labels = root.join(partition).join("training/lung-labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        for name in names {
            write_gray(&images.join(name), 4, 120);
            write_gray(&labels.join(name), 4, 255);
        }
    }

    fn build_model_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        let store = CheckpointStore::create(dir.join("ckpt")).unwrap();
        let model = LinearPixelModel::new(2);
        store.save_best(&model, 3).unwrap();
        dir
    }

    #[test]
    fn detection_writes_maps_for_both_partitions() {
        let dir = TempDir::new().unwrap();
        let data_root = dir.path().join("data");
        build_partition(&data_root, "sub-1", &["a.png", "b.png"]);
        build_partition(&data_root, "sub-2", &["c.png", "d.png"]);
        let model_dir = build_model_dir(dir.path(), "run_sub_1");
        build_model_dir(dir.path(), "run_sub_2");

        let options = DetectOptions {
            data_root: data_root.clone(),
            model_dir,
            model_sub_2_dir: None,
            class_name: "lung".to_string(),
            methods: vec![PruneMethod::Both, PruneMethod::Union],
            subset: Subset::Training,
            batch_size: 2,
            checkpoint: CheckpointSelector::Best,
            network: NetworkKind::Segmenter,
            num_classes: 2,
            cropping_size: (4, 4),
        };

        run_detection(&options).unwrap();

        let default_dir = data_root.join("all/training/lung-confident-maps");
        let union_dir = data_root.join("all/training/lung-confident-maps-union");
        for name in ["a.png", "b.png", "c.png", "d.png"] {
            assert!(default_dir.join(name).exists(), "{name} missing");
            assert!(union_dir.join(name).exists(), "{name} missing in union dir");
        }
    }

    #[test]
    fn missing_checkpoints_fail_fast() {
        let dir = TempDir::new().unwrap();
        let data_root = dir.path().join("data");
        build_partition(&data_root, "sub-2", &["a.png"]);

        let options = DetectOptions {
            data_root,
            model_dir: dir.path().join("missing_run"),
            model_sub_2_dir: None,
            class_name: "lung".to_string(),
            methods: vec![PruneMethod::Both],
            subset: Subset::Training,
            batch_size: 1,
            checkpoint: CheckpointSelector::Best,
            network: NetworkKind::Segmenter,
            num_classes: 2,
            cropping_size: (4, 4),
        };
        assert!(matches!(
            run_detection(&options),
            Err(PixelClError::Checkpoint(_))
        ));
    }

    #[test]
    fn sub_2_model_dir_follows_the_naming_convention() {
        let options = DetectOptions {
            data_root: PathBuf::from("/data"),
            model_dir: PathBuf::from("/models/jrst_sub_1_lung_ce"),
            model_sub_2_dir: None,
            class_name: "lung".to_string(),
            methods: vec![PruneMethod::Both],
            subset: Subset::Training,
            batch_size: 1,
            checkpoint: CheckpointSelector::Best,
            network: NetworkKind::Segmenter,
            num_classes: 2,
            cropping_size: (4, 4),
        };
        assert_eq!(
            sub_2_model_dir(&options),
            PathBuf::from("/models/jrst_sub_2_lung_ce")
        );
    }
}
