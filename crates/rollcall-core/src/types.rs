use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Multiply every coordinate by `factor`.
    ///
    /// Used to map boxes found on a downscaled frame back to original-frame space
    /// (`factor = 1 / downscale_factor`).
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector; its dimension is fixed by the embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are incomparable and are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.dim() != other.dim() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit length; a zero vector is returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

/// One registered face sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// A face found by the recognition engine on one sampled frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub confidence: f32,
}

/// Who a face was matched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLabel {
    Known {
        identity_id: String,
        display_name: String,
    },
    Unknown,
}

impl MatchLabel {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }

    pub fn identity_id(&self) -> Option<&str> {
        match self {
            Self::Known { identity_id, .. } => Some(identity_id),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for MatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known { display_name, .. } => f.write_str(display_name),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

/// A face on the overlay: where it is and who it is.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub bbox: BoundingBox,
    pub label: MatchLabel,
    /// Distance to the nearest gallery entry (infinite for an empty gallery).
    pub distance: f32,
}
