//! Frame sampling: which frames reach the recognition engine, and the overlay
//! that every other frame reuses.

use rollcall_core::{
    Detection, EngineError, Gallery, Matcher, MatchResult, RecognitionEngine,
};
use rollcall_hw::frame::downscale;
use rollcall_hw::Frame;
use std::sync::Arc;

/// Matches engine detections against a read-only gallery.
pub struct Identifier {
    matcher: Box<dyn Matcher>,
    gallery: Arc<Gallery>,
    threshold: f32,
}

impl Identifier {
    pub fn new(matcher: Box<dyn Matcher>, gallery: Arc<Gallery>, threshold: f32) -> Self {
        Self {
            matcher,
            gallery,
            threshold,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn identify(&self, detections: Vec<Detection>) -> Vec<MatchResult> {
        detections
            .into_iter()
            .map(|detection| {
                let found = self.matcher.compare(
                    &detection.embedding,
                    self.gallery.entries(),
                    self.threshold,
                );
                tracing::debug!(
                    label = %found.label,
                    distance = found.distance,
                    confidence = detection.confidence,
                    "face matched"
                );
                MatchResult {
                    bbox: detection.bbox,
                    label: found.label,
                    distance: found.distance,
                }
            })
            .collect()
    }
}

/// What [`Scheduler::step`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not a sampling frame; the previous overlay stands.
    Reused,
    /// Recognition ran and replaced the overlay.
    Sampled,
    /// Recognition failed or returned malformed output; the previous overlay stands.
    Discarded,
}

pub struct Scheduler {
    stride: u64,
    downscale_factor: f32,
    overlay: Vec<MatchResult>,
}

impl Scheduler {
    /// `stride` below 1 is treated as 1; `downscale_factor` must be in (0, 1].
    pub fn new(stride: u32, downscale_factor: f32) -> Self {
        Self {
            stride: u64::from(stride.max(1)),
            downscale_factor,
            overlay: Vec::new(),
        }
    }

    pub fn should_sample(&self, sequence: u64) -> bool {
        sequence % self.stride == 0
    }

    /// Latest match results, in original-frame coordinates.
    pub fn overlay(&self) -> &[MatchResult] {
        &self.overlay
    }

    pub fn step(
        &mut self,
        frame: &Frame,
        engine: &mut dyn RecognitionEngine,
        identifier: &Identifier,
    ) -> StepOutcome {
        if !self.should_sample(frame.sequence) {
            return StepOutcome::Reused;
        }

        match self.recognize(frame, engine, identifier) {
            Ok(results) => {
                self.overlay = results;
                StepOutcome::Sampled
            }
            Err(err) => {
                tracing::warn!(
                    sequence = frame.sequence,
                    error = %err,
                    "recognition failed, sample discarded"
                );
                StepOutcome::Discarded
            }
        }
    }

    fn recognize(
        &self,
        frame: &Frame,
        engine: &mut dyn RecognitionEngine,
        identifier: &Identifier,
    ) -> Result<Vec<MatchResult>, EngineError> {
        let detections = if self.downscale_factor < 1.0 {
            let small = downscale(&frame.image, self.downscale_factor);
            engine.detect_and_embed(&small)?
        } else {
            engine.detect_and_embed(&frame.image)?
        };

        check_output(&detections, identifier.gallery().dimension())?;

        let restore = 1.0 / self.downscale_factor;
        let detections = detections
            .into_iter()
            .map(|mut d| {
                d.bbox = d.bbox.scaled(restore);
                d
            })
            .collect();
        Ok(identifier.identify(detections))
    }
}

/// Reject detections with non-finite values or an embedding dimension the
/// gallery cannot be compared against.
fn check_output(detections: &[Detection], gallery_dim: Option<usize>) -> Result<(), EngineError> {
    for d in detections {
        let b = &d.bbox;
        if ![b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite()) {
            return Err(EngineError::Malformed(format!("non-finite box {b:?}")));
        }
        if d.embedding.dim() == 0 || !d.embedding.is_finite() {
            return Err(EngineError::Malformed("empty or non-finite embedding".into()));
        }
        if let Some(expected) = gallery_dim {
            if d.embedding.dim() != expected {
                return Err(EngineError::Malformed(format!(
                    "embedding dimension {} does not match gallery dimension {expected}",
                    d.embedding.dim()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{BoundingBox, Embedding, EuclideanMatcher, GalleryEntry, MatchLabel};
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Engine whose single "face" covers the centre quarter of the frame and
    /// whose embedding is the top-left pixel's red value on one axis.
    pub(crate) struct PixelEngine {
        pub calls: usize,
        pub failures: VecDeque<bool>,
    }

    impl PixelEngine {
        pub(crate) fn new() -> Self {
            Self {
                calls: 0,
                failures: VecDeque::new(),
            }
        }
    }

    impl RecognitionEngine for PixelEngine {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
            self.calls += 1;
            if self.failures.pop_front().unwrap_or(false) {
                return Err(EngineError::Malformed("scripted failure".into()));
            }
            let (w, h) = (image.width() as f32, image.height() as f32);
            let red = image.get_pixel(0, 0).0[0] as f32 / 100.0;
            Ok(vec![Detection {
                bbox: BoundingBox::new(w / 4.0, h / 4.0, w / 2.0, h / 2.0),
                embedding: Embedding::new(vec![red, 0.0]),
                confidence: 0.99,
            }])
        }

        fn detect_largest(&mut self, image: &RgbImage) -> Result<Option<Detection>, EngineError> {
            Ok(self.detect_and_embed(image)?.into_iter().next())
        }
    }

    pub(crate) fn alice_gallery() -> Arc<Gallery> {
        Arc::new(
            Gallery::new(vec![GalleryEntry {
                identity_id: "S001".into(),
                display_name: "Alice".into(),
                embedding: Embedding::new(vec![0.0, 0.0]),
            }])
            .unwrap(),
        )
    }

    /// Uniform frame whose red channel encodes the distance to Alice ×100.
    pub(crate) fn frame(sequence: u64, red: u8) -> Frame {
        Frame {
            image: RgbImage::from_pixel(64, 48, Rgb([red, 0, 0])),
            sequence,
            captured_at: Instant::now(),
        }
    }

    fn identifier() -> Identifier {
        Identifier::new(Box::new(EuclideanMatcher), alice_gallery(), 0.8)
    }

    #[test]
    fn test_should_sample_every_stride() {
        let scheduler = Scheduler::new(3, 1.0);
        let sampled: Vec<u64> = (0..10).filter(|s| scheduler.should_sample(*s)).collect();
        assert_eq!(sampled, vec![0, 3, 6, 9]);
        let every = Scheduler::new(0, 1.0);
        assert!((0..5).all(|s| every.should_sample(s)));
    }

    #[test]
    fn test_unoptimised_mode_matches_reference_pass() {
        let identifier = identifier();
        let reds = [10u8, 120, 15, 200, 0, 79, 80];
        let frames: Vec<Frame> = reds.iter().enumerate().map(|(i, r)| frame(i as u64, *r)).collect();

        let mut scheduler = Scheduler::new(1, 1.0);
        let mut engine = PixelEngine::new();
        let mut reference_engine = PixelEngine::new();

        for f in &frames {
            assert_eq!(scheduler.step(f, &mut engine, &identifier), StepOutcome::Sampled);
            let reference =
                identifier.identify(reference_engine.detect_and_embed(&f.image).unwrap());
            let got = scheduler.overlay();
            assert_eq!(got.len(), reference.len());
            for (a, b) in got.iter().zip(reference.iter()) {
                assert_eq!(a.bbox, b.bbox);
                assert_eq!(a.label, b.label);
            }
        }
        assert_eq!(engine.calls, frames.len());
    }

    #[test]
    fn test_skipped_frames_reuse_overlay() {
        let identifier = identifier();
        let mut scheduler = Scheduler::new(5, 1.0);
        let mut engine = PixelEngine::new();

        assert_eq!(scheduler.step(&frame(0, 10), &mut engine, &identifier), StepOutcome::Sampled);
        let first = scheduler.overlay().to_vec();
        // A frame that would be unknown is not sampled, so the label persists.
        assert_eq!(scheduler.step(&frame(1, 200), &mut engine, &identifier), StepOutcome::Reused);
        assert_eq!(scheduler.overlay()[0].label, first[0].label);
        assert_eq!(engine.calls, 1);
        assert_eq!(scheduler.step(&frame(5, 200), &mut engine, &identifier), StepOutcome::Sampled);
        assert_eq!(scheduler.overlay()[0].label, MatchLabel::Unknown);
    }

    #[test]
    fn test_boxes_rescaled_to_original_frame() {
        let identifier = identifier();
        let mut scheduler = Scheduler::new(1, 0.5);
        let mut engine = PixelEngine::new();
        scheduler.step(&frame(0, 10), &mut engine, &identifier);
        // Engine saw 32×24; box maps back to the 64×48 centre quarter.
        let bbox = scheduler.overlay()[0].bbox;
        assert!((bbox.x - 16.0).abs() < 1e-4);
        assert!((bbox.y - 12.0).abs() < 1e-4);
        assert!((bbox.width - 32.0).abs() < 1e-4);
        assert!((bbox.height - 24.0).abs() < 1e-4);
    }

    #[test]
    fn test_engine_failure_keeps_previous_overlay() {
        let identifier = identifier();
        let mut scheduler = Scheduler::new(1, 1.0);
        let mut engine = PixelEngine::new();
        engine.failures = VecDeque::from(vec![false, true]);

        assert_eq!(scheduler.step(&frame(0, 10), &mut engine, &identifier), StepOutcome::Sampled);
        assert_eq!(
            scheduler.step(&frame(1, 200), &mut engine, &identifier),
            StepOutcome::Discarded
        );
        assert!(scheduler.overlay()[0].label.is_known());
        // Next frame processes normally.
        assert_eq!(scheduler.step(&frame(2, 200), &mut engine, &identifier), StepOutcome::Sampled);
        assert!(!scheduler.overlay()[0].label.is_known());
    }

    struct WrongDimEngine;

    impl RecognitionEngine for WrongDimEngine {
        fn detect_and_embed(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
            Ok(vec![Detection {
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                embedding: Embedding::new(vec![0.0, 0.0, 0.0]),
                confidence: 0.9,
            }])
        }

        fn detect_largest(&mut self, _image: &RgbImage) -> Result<Option<Detection>, EngineError> {
            Ok(None)
        }
    }

    #[test]
    fn test_malformed_output_discarded() {
        let identifier = identifier();
        let mut scheduler = Scheduler::new(1, 1.0);
        assert_eq!(
            scheduler.step(&frame(0, 10), &mut WrongDimEngine, &identifier),
            StepOutcome::Discarded
        );
        assert!(scheduler.overlay().is_empty());
    }

    #[test]
    fn test_check_output_rejects_nan() {
        let nan = Detection {
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            embedding: Embedding::new(vec![f32::NAN, 0.0]),
            confidence: 0.9,
        };
        assert!(check_output(&[nan], None).is_err());
        assert!(check_output(&[], Some(2)).is_ok());
    }
}
