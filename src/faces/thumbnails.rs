use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::path::{Path, PathBuf};

use crate::db::BoundingBox;

/// `face_{stem}_{index}_{random8}.jpg`; the random suffix keeps re-indexing
/// from overwriting thumbnails that are still referenced.
pub fn thumbnail_file_name(stem: &str, index: usize) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("face_{}_{}_{}.jpg", stem, index, &id[..8])
}

/// Crop `bbox` out of `img`, shrink it to fit `size` and write it as JPEG.
pub fn save_face_thumbnail(
    img: &DynamicImage,
    bbox: &BoundingBox,
    dir: &Path,
    stem: &str,
    index: usize,
    size: u32,
) -> Result<PathBuf> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        anyhow::bail!("Empty image");
    }

    let x = bbox.left.clamp(0, width as i32 - 1) as u32;
    let y = bbox.top.clamp(0, height as i32 - 1) as u32;
    let w = (bbox.right.min(width as i32) - x as i32).max(1) as u32;
    let h = (bbox.bottom.min(height as i32) - y as i32).max(1) as u32;

    let face = img.crop_imm(x, y, w, h).thumbnail(size, size);
    let path = dir.join(thumbnail_file_name(stem, index));

    DynamicImage::ImageRgb8(face.to_rgb8())
        .save_with_format(&path, ImageFormat::Jpeg)
        .with_context(|| format!("Failed to write thumbnail {}", path.display()))?;

    Ok(path)
}
