//! Nearest-neighbour identity matching against the gallery.

use crate::types::{Embedding, GalleryEntry, MatchLabel};

/// Outcome of matching one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub label: MatchLabel,
    /// Minimum distance over the gallery, reported even when unmatched.
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against the gallery.
///
/// Implementations must be deterministic for identical inputs and must treat
/// `distance < threshold` as the only match condition.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> IdentityMatch;
}

/// Exhaustive Euclidean matcher, O(N) per probe.
///
/// Ties on the minimum distance resolve to the lowest `identity_id`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> IdentityMatch {
        let mut best: Option<(&GalleryEntry, f32)> = None;

        for entry in gallery {
            let dist = probe.euclidean_distance(&entry.embedding);
            let better = match best {
                None => true,
                Some((prev, prev_dist)) => {
                    dist < prev_dist
                        || (dist == prev_dist && entry.identity_id < prev.identity_id)
                }
            };
            if better {
                best = Some((entry, dist));
            }
        }

        match best {
            Some((entry, dist)) if dist < threshold => IdentityMatch {
                label: MatchLabel::Known {
                    identity_id: entry.identity_id.clone(),
                    display_name: entry.display_name.clone(),
                },
                distance: dist,
            },
            Some((_, dist)) => IdentityMatch {
                label: MatchLabel::Unknown,
                distance: dist,
            },
            None => IdentityMatch {
                label: MatchLabel::Unknown,
                distance: f32::INFINITY,
            },
        }
    }
}
