//! On-disk dataset of images, noisy label masks and confidence maps.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use ndarray::{s, Array2, Array3, Array4};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use super::{BatchSource, PixelBatch, Subset};
use crate::error::{PixelClError, Result};

/// One decoded sample.
struct Sample {
    image: Array2<f32>,
    labels: Array2<u8>,
    confidence: Option<Array2<f32>>,
    filename: String,
}

/// Dataset rooted at `{root}/{subset}` with per-class label masks.
pub struct NoisyPixelDataset {
    image_paths: Vec<PathBuf>,
    labels_dir: PathBuf,
    confidence_dir: Option<PathBuf>,
    num_classes: usize,
    cropping_size: (usize, usize),
}

impl NoisyPixelDataset {
    /// Scan `{root}/{subset}` for images and their `{class_name}-labels`
    /// masks. When `confidence_dir_name` is given, every image must also
    /// have a same-named confidence map under that directory.
    pub fn load(
        root: &Path,
        subset: Subset,
        class_name: &str,
        num_classes: usize,
        cropping_size: (usize, usize),
        confidence_dir_name: Option<&str>,
    ) -> Result<Self> {
        let subset_dir = root.join(subset.dir_name());
        let images_dir = subset_dir.join("images");
        let labels_dir = subset_dir.join(format!("{class_name}-labels"));

        if !images_dir.is_dir() {
            return Err(PixelClError::Dataset {
                path: images_dir,
                message: "image directory not found".to_string(),
            });
        }
        if !labels_dir.is_dir() {
            return Err(PixelClError::Dataset {
                path: labels_dir,
                message: "label directory not found".to_string(),
            });
        }

        let mut image_paths: Vec<PathBuf> = fs::read_dir(&images_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("png"))
                    .unwrap_or(false)
            })
            .collect();
        // Stable scan order; shuffling is the batch source's business.
        image_paths.sort();

        if image_paths.is_empty() {
            return Err(PixelClError::Dataset {
                path: images_dir,
                message: "no .png images found".to_string(),
            });
        }

        let confidence_dir = confidence_dir_name.map(|name| subset_dir.join(name));
        if let Some(dir) = &confidence_dir {
            if !dir.is_dir() {
                return Err(PixelClError::Dataset {
                    path: dir.clone(),
                    message: "confidence-map directory not found".to_string(),
                });
            }
        }

        info!(
            "loaded {} samples from {:?} ({})",
            image_paths.len(),
            subset_dir,
            subset.dir_name()
        );

        Ok(Self {
            image_paths,
            labels_dir,
            confidence_dir,
            num_classes,
            cropping_size,
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn cropping_size(&self) -> (usize, usize) {
        self.cropping_size
    }

    fn filename(&self, index: usize) -> String {
        self.image_paths[index]
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Decode one sample, resizing to the configured cropping size.
    fn get(&self, index: usize) -> Result<Sample> {
        let path = &self.image_paths[index];
        let filename = self.filename(index);
        let (height, width) = self.cropping_size;

        let image = load_gray(path, height, width)?;
        let image = image.mapv(|v| v as f32 / 255.0);

        let label_path = self.labels_dir.join(&filename);
        let raw_labels = load_gray(&label_path, height, width)?;
        let mut labels = Array2::<u8>::zeros((height, width));
        for ((row, col), &value) in raw_labels.indexed_iter() {
            labels[[row, col]] = self.decode_label(value, &label_path)?;
        }

        let confidence = match &self.confidence_dir {
            Some(dir) => {
                let map_path = dir.join(&filename);
                let raw = load_gray(&map_path, height, width)?;
                Some(raw.mapv(|v| if v > 127 { 1.0f32 } else { 0.0 }))
            }
            None => None,
        };

        Ok(Sample {
            image,
            labels,
            confidence,
            filename,
        })
    }

    /// Byte-valued masks use 0/255 for binary classes; multi-class masks
    /// store the class index directly.
    fn decode_label(&self, value: u8, path: &Path) -> Result<u8> {
        if self.num_classes == 2 {
            return Ok(u8::from(value > 127));
        }
        if (value as usize) < self.num_classes {
            Ok(value)
        } else {
            Err(PixelClError::Dataset {
                path: path.to_path_buf(),
                message: format!(
                    "label value {value} out of range for {} classes",
                    self.num_classes
                ),
            })
        }
    }
}

fn load_gray(path: &Path, height: usize, width: usize) -> Result<Array2<u8>> {
    let image = image::open(path)
        .map_err(|err| PixelClError::Dataset {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_luma8();

    let mut array = Array2::<u8>::zeros((height, width));
    for row in 0..height {
        for col in 0..width {
            array[[row, col]] = image.get_pixel(col as u32, row as u32)[0];
        }
    }
    Ok(array)
}

/// Batch iterator over a [`NoisyPixelDataset`].
///
/// Training sources shuffle the sample order on every `reset` with a seeded
/// generator; evaluation sources keep the stable scan order so accumulated
/// predictions line up with filenames.
pub struct DiskBatches {
    dataset: NoisyPixelDataset,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    rng: ChaCha8Rng,
}

impl DiskBatches {
    pub fn new(dataset: NoisyPixelDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut batches = Self {
            dataset,
            batch_size,
            order,
            cursor: 0,
            shuffle,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        if shuffle {
            batches.order.shuffle(&mut batches.rng);
        }
        batches
    }

    pub fn dataset(&self) -> &NoisyPixelDataset {
        &self.dataset
    }
}

impl BatchSource for DiskBatches {
    fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn next_batch(&mut self) -> Result<Option<PixelBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let (height, width) = self.dataset.cropping_size();
        let batch_len = indices.len();
        let mut images = Array4::<f32>::zeros((batch_len, 1, height, width));
        let mut labels = Array3::<u8>::zeros((batch_len, height, width));
        let mut confidence: Option<Array3<f32>> = None;
        let mut filenames = Vec::with_capacity(batch_len);

        for (slot, &index) in indices.iter().enumerate() {
            let sample = self.dataset.get(index)?;
            images.slice_mut(s![slot, 0, .., ..]).assign(&sample.image);
            labels.slice_mut(s![slot, .., ..]).assign(&sample.labels);
            if let Some(map) = &sample.confidence {
                let store = confidence
                    .get_or_insert_with(|| Array3::<f32>::zeros((batch_len, height, width)));
                store.slice_mut(s![slot, .., ..]).assign(map);
            }
            filenames.push(sample.filename);
        }

        debug!("built batch of {} samples", batch_len);
        Ok(Some(PixelBatch {
            images,
            labels,
            confidence,
            filenames,
        }))
    }

    fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}
