//! Reassembling flat noise decisions into per-image confidence maps.

use std::fs;
use std::path::Path;

use image::GrayImage;
use tracing::info;

use super::prune::NoiseMask;
use crate::error::{PixelClError, Result};

/// Slice the flat mask back into one single-channel image per source image.
///
/// Pixels were flattened row-major per image, images concatenated in
/// accumulation order; `shapes` and `filenames` must follow that same
/// order. Flagged pixels encode as 255, clean ones as 0.
pub fn assemble(
    mask: &NoiseMask,
    shapes: &[(usize, usize)],
    filenames: &[String],
) -> Result<Vec<(String, GrayImage)>> {
    if shapes.len() != filenames.len() {
        return Err(PixelClError::shape(format!(
            "{} image shapes but {} filenames",
            shapes.len(),
            filenames.len()
        )));
    }
    let expected: usize = shapes.iter().map(|&(h, w)| h * w).sum();
    if expected != mask.len() {
        return Err(PixelClError::shape(format!(
            "mask has {} pixels, image shapes account for {expected}",
            mask.len()
        )));
    }

    let flags = mask.as_slice();
    let mut maps = Vec::with_capacity(shapes.len());
    let mut offset = 0usize;
    for (&(height, width), filename) in shapes.iter().zip(filenames) {
        let slice = &flags[offset..offset + height * width];
        offset += height * width;

        let mut map = GrayImage::new(width as u32, height as u32);
        for row in 0..height {
            for col in 0..width {
                let value = if slice[row * width + col] { 255u8 } else { 0 };
                map.put_pixel(col as u32, row as u32, image::Luma([value]));
            }
        }
        maps.push((filename.clone(), map));
    }

    Ok(maps)
}

/// Assemble and persist, one PNG per source image, overwriting same-named
/// outputs. The directory is created if absent.
pub fn write_maps(
    mask: &NoiseMask,
    shapes: &[(usize, usize)],
    filenames: &[String],
    output_dir: &Path,
) -> Result<()> {
    let maps = assemble(mask, shapes, filenames)?;
    fs::create_dir_all(output_dir)?;
    for (filename, map) in &maps {
        map.save(output_dir.join(filename))?;
    }
    info!("wrote {} confidence maps to {:?}", maps.len(), output_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn assembles_in_raster_order() {
        let mask = NoiseMask::from_vec(vec![true, false, false, true]);
        let shapes = vec![(2, 2)];
        let filenames = vec!["img.png".to_string()];

        let maps = assemble(&mask, &shapes, &filenames).unwrap();
        assert_eq!(maps.len(), 1);
        let map = &maps[0].1;
        assert_eq!(map.get_pixel(0, 0)[0], 255);
        assert_eq!(map.get_pixel(1, 0)[0], 0);
        assert_eq!(map.get_pixel(0, 1)[0], 0);
        assert_eq!(map.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let flags = vec![true, false, true, false, false, true, true, false];
        let mask = NoiseMask::from_vec(flags.clone());
        let shapes = vec![(2, 2), (2, 2)];
        let filenames = vec!["a.png".to_string(), "b.png".to_string()];

        write_maps(&mask, &shapes, &filenames, dir.path()).unwrap();

        let mut recovered = Vec::new();
        for (filename, &(height, width)) in filenames.iter().zip(&shapes) {
            let map = image::open(dir.path().join(filename)).unwrap().to_luma8();
            for row in 0..height {
                for col in 0..width {
                    recovered.push(map.get_pixel(col as u32, row as u32)[0] == 255);
                }
            }
        }
        assert_eq!(recovered, flags);
    }

    #[test]
    fn overwrites_existing_outputs() {
        let dir = TempDir::new().unwrap();
        let shapes = vec![(1, 1)];
        let filenames = vec!["x.png".to_string()];

        write_maps(
            &NoiseMask::from_vec(vec![false]),
            &shapes,
            &filenames,
            dir.path(),
        )
        .unwrap();
        write_maps(
            &NoiseMask::from_vec(vec![true]),
            &shapes,
            &filenames,
            dir.path(),
        )
        .unwrap();

        let map = image::open(dir.path().join("x.png")).unwrap().to_luma8();
        assert_eq!(map.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn pixel_count_mismatch_is_rejected() {
        let mask = NoiseMask::from_vec(vec![true; 3]);
        let shapes = vec![(2, 2)];
        let filenames = vec!["img.png".to_string()];
        assert!(matches!(
            assemble(&mask, &shapes, &filenames),
            Err(PixelClError::DataShape(_))
        ));
    }
}
