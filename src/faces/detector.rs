//! Face detection and embedding.
//!
//! [`FaceModel`] is the black box the extractor talks to. [`OnnxFaceModel`]
//! implements it with UltraFace for detection and ArcFace for 512-d
//! embeddings; both models are fetched on first use.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::config::FacesConfig;
use crate::db::BoundingBox;

/// A detected face with bounding box and embedding
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Anything that can find faces in an image and embed them.
pub trait FaceModel: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

const DETECTION_MODEL: (&str, &str) = (
    "ultraface-320.onnx",
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
);
const EMBEDDING_MODEL: (&str, &str) = (
    "arcface-resnet100.onnx",
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx",
);

const NMS_THRESHOLD: f32 = 0.3;

pub struct OnnxFaceModel {
    models_dir: PathBuf,
    confidence_threshold: f32,
    intra_threads: usize,
    detection: OnceLock<Mutex<Session>>,
    embedding: OnceLock<Mutex<Session>>,
}

impl OnnxFaceModel {
    pub fn new(config: &FacesConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            confidence_threshold: config.detection_confidence,
            intra_threads: config.intra_threads.max(1),
            detection: OnceLock::new(),
            embedding: OnceLock::new(),
        }
    }

    /// Download both models if they are missing, without loading them.
    pub fn fetch_models(&self) -> Result<()> {
        for (filename, url) in [DETECTION_MODEL, EMBEDDING_MODEL] {
            ensure_model(&self.models_dir, filename, url)?;
        }
        Ok(())
    }

    /// Download (if needed) and load both models up front.
    pub fn warm_up(&self) -> Result<()> {
        self.session(&self.detection, DETECTION_MODEL)?;
        self.session(&self.embedding, EMBEDDING_MODEL)?;
        Ok(())
    }

    fn session<'a>(&self, slot: &'a OnceLock<Mutex<Session>>, model: (&str, &str)) -> Result<&'a Mutex<Session>> {
        if let Some(session) = slot.get() {
            return Ok(session);
        }

        let path = ensure_model(&self.models_dir, model.0, model.1)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(&path)
            .with_context(|| format!("Failed to load model {}", path.display()))?;

        // A racing thread may have won; either session is equivalent.
        let _ = slot.set(Mutex::new(session));
        slot.get().ok_or_else(|| anyhow!("Model {} not initialized", model.0))
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let boxes = {
            let mut detection = self
                .session(&self.detection, DETECTION_MODEL)?
                .lock()
                .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;
            run_ultraface_detection(&mut detection, img, self.confidence_threshold)?
        };

        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut embedding_model = self
            .session(&self.embedding, EMBEDDING_MODEL)?
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, confidence) in boxes {
            if bbox.width() <= 0 || bbox.height() <= 0 {
                continue;
            }

            let crop = crop_face(img, &bbox);
            match run_arcface_embedding(&mut embedding_model, &crop) {
                Ok(embedding) => faces.push(DetectedFace {
                    bbox,
                    embedding,
                    confidence,
                }),
                Err(e) => tracing::warn!(error = %e, ?bbox, "Skipping face without embedding"),
            }
        }

        Ok(faces)
    }
}

/// Download a model file into `models_dir` if it is not there yet.
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)
        .with_context(|| format!("Failed to create models directory {}", models_dir.display()))?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model {}: {}", filename, e))?;

        // Write to a temp name first so an interrupted download is not mistaken
        // for a model next time.
        let partial = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

/// Run UltraFace and return boxes in original image pixels.
fn run_ultraface_detection(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: usize = 320;
    const INPUT_HEIGHT: usize = 240;
    const PLANE: usize = INPUT_WIDTH * INPUT_HEIGHT;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(
        INPUT_WIDTH as u32,
        INPUT_HEIGHT as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    // NCHW, (p - 127) / 128
    let mut input = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH + x as usize;
        for c in 0..3 {
            input[c * PLANE + idx] = (pixel[c] as f32 - 127.0) / 128.0;
        }
    }

    let tensor = Tensor::from_array(([1usize, 3, INPUT_HEIGHT, INPUT_WIDTH], input.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs!["input" => tensor])?;

    let (scores_shape, scores) = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?
        .try_extract_tensor::<f32>()?;
    let (_, boxes) = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?
        .try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalised x1 y1 x2 y2
    let anchors = scores_shape.get(1).copied().unwrap_or(0).max(0) as usize;
    let mut found = Vec::new();
    for i in 0..anchors {
        let (Some(&confidence), Some(coords)) = (scores.get(i * 2 + 1), boxes.get(i * 4..i * 4 + 4)) else {
            break;
        };
        if confidence <= confidence_threshold {
            continue;
        }

        let left = ((coords[0] * orig_width as f32) as i32).max(0);
        let top = ((coords[1] * orig_height as f32) as i32).max(0);
        let right = ((coords[2] * orig_width as f32) as i32).min(orig_width as i32);
        let bottom = ((coords[3] * orig_height as f32) as i32).min(orig_height as i32);

        found.push((
            BoundingBox {
                top,
                right: right.max(left + 1),
                bottom: bottom.max(top + 1),
                left,
            },
            confidence,
        ));
    }

    Ok(nms(found, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(&kept.0, &candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let left = a.left.max(b.left);
    let top = a.top.max(b.top);
    let right = a.right.min(b.right);
    let bottom = a.bottom.min(b.bottom);

    let intersection = ((right - left).max(0) * (bottom - top).max(0)) as f32;
    let union = (a.width() * a.height() + b.width() * b.height()) as f32 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face with 20% padding, clamped to the image.
pub(crate) fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let pad_x = bbox.width() / 5;
    let pad_y = bbox.height() / 5;

    let x = (bbox.left - pad_x).clamp(0, img_width.saturating_sub(1) as i32) as u32;
    let y = (bbox.top - pad_y).clamp(0, img_height.saturating_sub(1) as i32) as u32;
    let w = ((bbox.width() + pad_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height() + pad_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace on a face crop; the result is L2-normalised.
fn run_arcface_embedding(session: &mut Session, face: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: usize = 112;
    const PLANE: usize = INPUT_SIZE * INPUT_SIZE;

    let resized = face.resize_exact(
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let mut input = vec![0.0f32; 3 * PLANE];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE + x as usize;
        for c in 0..3 {
            input[c * PLANE + idx] = (pixel[c] as f32 - 127.5) / 127.5;
        }
    }

    let tensor = Tensor::from_array(([1usize, 3, INPUT_SIZE, INPUT_SIZE], input.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs!["data" => tensor])?;

    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_, data) = output.try_extract_tensor::<f32>()?;

    let norm: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        Ok(data.iter().map(|x| x / norm).collect())
    } else {
        Err(anyhow!("Model returned an all-zero embedding"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(left: i32, top: i32, size: i32) -> BoundingBox {
        BoundingBox {
            top,
            right: left + size,
            bottom: top + size,
            left,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0, 0, 10);
        assert!((iou(&a, &a) - 1.0).abs() < 0.001);
        assert!(iou(&a, &bbox(20, 20, 10)).abs() < 0.001);
        // Half overlap horizontally: 50 / 150
        let half = BoundingBox {
            top: 0,
            right: 15,
            bottom: 10,
            left: 5,
        };
        assert!((iou(&a, &half) - 1.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                (bbox(0, 0, 10), 0.8),
                (bbox(1, 1, 10), 0.9),
                (bbox(50, 50, 10), 0.75),
            ],
            NMS_THRESHOLD,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].0, bbox(50, 50, 10));
    }

    #[test]
    fn test_crop_face_stays_inside_image() {
        let img = DynamicImage::new_rgb8(40, 30);
        let crop = crop_face(&img, &bbox(30, 20, 20));
        // Padded origin is (26, 16); the crop is clamped to the image edge.
        assert_eq!(crop.dimensions(), (14, 14));
    }
}
