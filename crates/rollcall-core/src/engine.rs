//! Recognition engine contract and the ONNX implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::{BoundingBox, Detection};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("malformed engine output: {0}")]
    Malformed(String),
}

/// Detects faces and produces one embedding per face.
///
/// Not assumed reentrant: callers hold it behind `&mut` on a single thread.
pub trait RecognitionEngine: Send {
    /// Every face on the frame, in frame pixel coordinates.
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EngineError>;

    /// The largest face on the frame, if any. Used by enrollment.
    fn detect_largest(&mut self, image: &RgbImage) -> Result<Option<Detection>, EngineError>;
}

/// YuNet detection followed by FaceNet embedding of each face crop.
pub struct OnnxEngine {
    detector: FaceDetector,
    embedder: FaceEmbedder,
    min_confidence: f32,
}

impl OnnxEngine {
    pub fn load(
        detector_path: &str,
        embedder_path: &str,
        min_confidence: f32,
    ) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(detector_path)?;
        let embedder = FaceEmbedder::load(embedder_path)?;
        Ok(Self {
            detector,
            embedder,
            min_confidence,
        })
    }

    fn embed_face(&mut self, image: &RgbImage, bbox: BoundingBox) -> Result<Option<Detection>, EngineError> {
        let Some((x, y, w, h)) = clamp_to_image(&bbox, image.width(), image.height()) else {
            return Ok(None);
        };
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let embedding = self.embedder.embed(&crop)?;
        Ok(Some(Detection {
            bbox,
            embedding,
            confidence: 0.0,
        }))
    }
}

impl RecognitionEngine for OnnxEngine {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
        let faces = self.detector.detect(image, self.min_confidence)?;
        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            if let Some(mut detection) = self.embed_face(image, face.bbox)? {
                detection.confidence = face.score;
                detections.push(detection);
            }
        }
        Ok(detections)
    }

    fn detect_largest(&mut self, image: &RgbImage) -> Result<Option<Detection>, EngineError> {
        let faces = self.detector.detect(image, self.min_confidence)?;
        let Some(largest) = faces
            .into_iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
        else {
            return Ok(None);
        };
        Ok(self.embed_face(image, largest.bbox)?.map(|mut d| {
            d.confidence = largest.score;
            d
        }))
    }
}

/// Integer crop rectangle of `bbox` inside a `width`×`height` image, or `None`
/// if nothing of the box lies inside the image.
pub fn clamp_to_image(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x1 = bbox.x.max(0.0).floor();
    let y1 = bbox.y.max(0.0).floor();
    let x2 = (bbox.x + bbox.width).min(width as f32).ceil();
    let y2 = (bbox.y + bbox.height).min(height as f32).ceil();
    if !(x2 > x1 && y2 > y1) {
        return None;
    }
    let (x, y) = (x1 as u32, y1 as u32);
    let w = (x2 as u32).min(width).saturating_sub(x);
    let h = (y2 as u32).min(height).saturating_sub(y);
    (w > 0 && h > 0).then_some((x, y, w, h))
}
