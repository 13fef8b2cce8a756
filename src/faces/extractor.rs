//! Per-photo extraction: capture date, GPS, tags and faces.
//!
//! [`Extractor::extract`] never fails; anything that goes wrong is logged and
//! reported as `None`, which the index task counts as an error for that item.
//! In production the extractor runs inside `extract-worker` processes, see
//! [`super::worker`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::detector::FaceModel;
use super::thumbnails::save_face_thumbnail;
use crate::db::BoundingBox;
use crate::scanner::{read_exif, resolve_capture_date, CaptureDate, GpsCoordinates};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    /// `None` when the thumbnail could not be written.
    pub thumbnail_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub date: CaptureDate,
    pub gps: Option<GpsCoordinates>,
    pub tags: Vec<Tag>,
    pub faces: Vec<ExtractedFace>,
}

pub struct Extractor {
    model: Arc<dyn FaceModel>,
    thumbnail_size: u32,
}

impl Extractor {
    pub fn new(model: Arc<dyn FaceModel>, thumbnail_size: u32) -> Self {
        Self {
            model,
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    pub fn extract(&self, path: &Path, thumbnail_dir: &Path) -> Option<ExtractionResult> {
        match self.try_extract(path, thumbnail_dir) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Extraction failed");
                None
            }
        }
    }

    fn try_extract(&self, path: &Path, thumbnail_dir: &Path) -> Result<ExtractionResult> {
        let exif = read_exif(path)?;
        let date = resolve_capture_date(path, exif.date_original);

        let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
        let detected = self.model.detect(&img).context("Face detection failed")?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo".to_string());

        let dir_ready = if detected.is_empty() {
            false
        } else {
            match std::fs::create_dir_all(thumbnail_dir) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(dir = %thumbnail_dir.display(), error = %e, "Cannot create thumbnail directory");
                    false
                }
            }
        };

        let faces = detected
            .into_iter()
            .enumerate()
            .map(|(index, face)| {
                let thumbnail_path = if dir_ready {
                    save_face_thumbnail(&img, &face.bbox, thumbnail_dir, &stem, index, self.thumbnail_size)
                        .map_err(|e| {
                            tracing::warn!(path = %path.display(), index, error = %format!("{e:#}"), "Face thumbnail not saved");
                        })
                        .ok()
                } else {
                    None
                };
                ExtractedFace {
                    bbox: face.bbox,
                    embedding: face.embedding,
                    thumbnail_path,
                }
            })
            .collect();

        Ok(ExtractionResult {
            date,
            gps: exif.gps,
            tags: exif
                .tags
                .into_iter()
                .map(|(name, value)| Tag { name, value })
                .collect(),
            faces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::detector::test_support::{BrokenFaceModel, StubFaceModel};
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_image(path: &Path, colour: [u8; 3]) {
        RgbImage::from_pixel(40, 40, Rgb(colour)).save(path).unwrap();
    }

    #[test]
    fn test_extracts_faces_and_thumbnails() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("IMG_20190704_120000.png");
        write_image(&photo, [10, 20, 30]);
        let thumbs = dir.path().join("thumbs");

        let extractor = Extractor::new(Arc::new(StubFaceModel), 150);
        let result = extractor.extract(&photo, &thumbs).unwrap();

        assert_eq!(result.date.year, Some(2019));
        assert_eq!(result.faces.len(), 1);
        assert_eq!(result.faces[0].embedding, vec![10.0, 20.0, 30.0]);
        let thumb = result.faces[0].thumbnail_path.as_ref().unwrap();
        assert!(thumb.starts_with(&thumbs));
        assert!(thumb.exists());
    }

    #[test]
    fn test_no_faces_no_thumbnail_dir() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("dark.png");
        write_image(&photo, [0, 0, 0]);
        let thumbs = dir.path().join("thumbs");

        let extractor = Extractor::new(Arc::new(StubFaceModel), 150);
        let result = extractor.extract(&photo, &thumbs).unwrap();
        assert!(result.faces.is_empty());
        assert!(!thumbs.exists());
    }

    #[test]
    fn test_thumbnail_failure_keeps_face() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("p.png");
        write_image(&photo, [1, 2, 3]);
        // A file where the directory should be
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();

        let extractor = Extractor::new(Arc::new(StubFaceModel), 150);
        let result = extractor.extract(&photo, &blocked).unwrap();
        assert_eq!(result.faces.len(), 1);
        assert!(result.faces[0].thumbnail_path.is_none());
    }

    #[test]
    fn test_failures_map_to_none() {
        let dir = tempdir().unwrap();
        let corrupt = dir.path().join("corrupt.jpg");
        std::fs::write(&corrupt, b"not an image").unwrap();
        let good = dir.path().join("good.png");
        write_image(&good, [5, 5, 5]);

        let stub = Extractor::new(Arc::new(StubFaceModel), 150);
        assert!(stub.extract(&corrupt, dir.path()).is_none());
        assert!(stub.extract(&dir.path().join("missing.jpg"), dir.path()).is_none());

        let broken = Extractor::new(Arc::new(BrokenFaceModel), 150);
        assert!(broken.extract(&good, dir.path()).is_none());
    }
}
