//! FaceNet face embedder via ONNX Runtime.
//!
//! Maps a face crop to an L2-normalised embedding. The embedding dimension is
//! whatever the loaded model produces (128 or 512 for common FaceNet exports).

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; export a FaceNet model to ONNX and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Embed one face crop. The crop is resized to 160×160 internally.
    pub fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(EmbedderError::InferenceFailed("empty face crop".into()));
        }
        let input = preprocess(crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(EmbedderError::InferenceFailed("model returned an empty embedding".into()));
        }

        Ok(Embedding::new(raw.to_vec()).l2_normalized())
    }
}

/// Resize to 160×160 and standardise per image into a 1×160×160×3 NHWC tensor.
///
/// Standardisation is `(x - mean) / max(std, 1/sqrt(N))` over all N values.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(
        crop,
        FACENET_INPUT_SIZE,
        FACENET_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );

    let raw = resized.as_raw();
    let n = raw.len() as f32;
    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = raw
        .iter()
        .map(|&v| (v as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    let std_adj = variance.sqrt().max(1.0 / n.sqrt());

    let size = FACENET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &v) in pixel.0.iter().enumerate() {
            tensor[[0, y as usize, x as usize, c]] = (v as f32 - mean) / std_adj;
        }
    }
    tensor
}
