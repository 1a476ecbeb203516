//! YuNet face detector via ONNX Runtime.
//!
//! Runs the 2023 YuNet export (`face_detection_yunet_2023mar.onnx`) on a
//! letterboxed 640×640 BGR tensor, decodes the three anchor-free stride heads,
//! and applies NMS.

use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const YUNET_INPUT_SIZE: usize = 640;
const YUNET_NMS_THRESHOLD: f32 = 0.3;
const YUNET_STRIDES: [usize; 3] = [8, 16, 32];
/// Keep at most this many faces before NMS, highest score first.
const YUNET_TOP_K: usize = 500;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from opencv_zoo and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A scored face candidate in original-image coordinates.
#[derive(Debug, Clone)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Five-point landmarks: [right_eye, left_eye, nose, right_mouth, left_mouth].
    pub landmarks: [(f32, f32); 5],
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (cls, obj, bbox, kps).
type StrideOutputIndices = (usize, usize, usize, usize);

/// YuNet-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the YuNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded YuNet model"
        );

        let stride_indices = discover_output_indices(&output_names)?;
        tracing::debug!(?stride_indices, "YuNet output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Detect faces scoring above `min_score`, sorted by descending score.
    pub fn detect(
        &mut self,
        image: &RgbImage,
        min_score: f32,
    ) -> Result<Vec<FaceCandidate>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in YUNET_STRIDES.iter().enumerate() {
            let (cls_idx, obj_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let heads = StrideHeads {
                cls: extract(cls_idx, "cls")?,
                obj: extract(obj_idx, "obj")?,
                bbox: extract(bbox_idx, "bbox")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&heads, stride, &letterbox, min_score));
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(YUNET_TOP_K);
        Ok(nms(candidates, YUNET_NMS_THRESHOLD))
    }
}

/// Letterbox an RGB image into a 1×3×640×640 BGR float tensor (raw 0–255 values).
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let size = YUNET_INPUT_SIZE as f32;
    let scale = (size / width).min(size / height);

    let new_w = ((width * scale).round() as u32).clamp(1, YUNET_INPUT_SIZE as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, YUNET_INPUT_SIZE as u32);
    let pad_x = (YUNET_INPUT_SIZE as u32 - new_w) / 2;
    let pad_y = (YUNET_INPUT_SIZE as u32 - new_h) / 2;

    let resized = image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Triangle);

    // Padding stays zero (black), matching OpenCV's blob padding.
    let mut tensor = Array4::<f32>::zeros((1, 3, YUNET_INPUT_SIZE, YUNET_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        let [r, g, b] = pixel.0;
        tensor[[0, 0, ty, tx]] = b as f32;
        tensor[[0, 1, ty, tx]] = g as f32;
        tensor[[0, 2, ty, tx]] = r as f32;
    }

    (
        tensor,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Map output tensors to strides by name (`cls_8`, `obj_8`, `bbox_8`, `kps_8`, ...).
fn discover_output_indices(names: &[String]) -> Result<[StrideOutputIndices; 3], DetectorError> {
    let find = |prefix: &str, stride: usize| -> Result<usize, DetectorError> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target).ok_or_else(|| {
            DetectorError::InferenceFailed(format!(
                "YuNet model has no output named {target} (outputs: {names:?})"
            ))
        })
    };

    let mut indices = [(0, 0, 0, 0); 3];
    for (slot, &stride) in indices.iter_mut().zip(YUNET_STRIDES.iter()) {
        *slot = (
            find("cls", stride)?,
            find("obj", stride)?,
            find("bbox", stride)?,
            find("kps", stride)?,
        );
    }
    Ok(indices)
}

/// Raw head outputs for one stride, flattened row-major.
struct StrideHeads<'a> {
    cls: &'a [f32],
    obj: &'a [f32],
    bbox: &'a [f32],
    kps: &'a [f32],
}

/// Decode one stride level. YuNet is anchor-free with one prior per cell:
/// centre = (cell + offset) * stride, size = exp(log_size) * stride,
/// score = sqrt(cls * obj).
fn decode_stride(
    heads: &StrideHeads<'_>,
    stride: usize,
    letterbox: &LetterboxInfo,
    min_score: f32,
) -> Vec<FaceCandidate> {
    let cols = YUNET_INPUT_SIZE / stride;
    let rows = YUNET_INPUT_SIZE / stride;
    let s = stride as f32;
    let unletterbox = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut candidates = Vec::new();
    for idx in 0..rows * cols {
        let (Some(&cls), Some(&obj)) = (heads.cls.get(idx), heads.obj.get(idx)) else {
            break;
        };
        let score = (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt();
        if score < min_score {
            continue;
        }
        let Some(b) = heads.bbox.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let Some(k) = heads.kps.get(idx * 10..idx * 10 + 10) else {
            continue;
        };

        let r = (idx / cols) as f32;
        let c = (idx % cols) as f32;
        let cx = (c + b[0]) * s;
        let cy = (r + b[1]) * s;
        let w = b[2].exp() * s;
        let h = b[3].exp() * s;

        let (x1, y1) = unletterbox(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = unletterbox(cx + w / 2.0, cy + h / 2.0);

        let mut landmarks = [(0.0f32, 0.0f32); 5];
        for (n, lm) in landmarks.iter_mut().enumerate() {
            *lm = unletterbox((k[n * 2] + c) * s, (k[n * 2 + 1] + r) * s);
        }

        candidates.push(FaceCandidate {
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            score,
            landmarks,
        });
    }
    candidates
}

/// Non-Maximum Suppression over candidates sorted by descending score.
fn nms(candidates: Vec<FaceCandidate>, iou_threshold: f32) -> Vec<FaceCandidate> {
    let mut keep: Vec<FaceCandidate> = Vec::new();
    for candidate in candidates {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}
