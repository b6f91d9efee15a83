//! Gallery matching.
//!
//! A [`Matcher`] takes a probe embedding and a full gallery snapshot and
//! returns one decision. The brute-force [`EuclideanMatcher`] is the default;
//! an indexed nearest-neighbour implementation can replace it behind the
//! same trait.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Embedding, GalleryEntry, MatchResult};

/// Default maximum accepted distance for 128-d face encodings.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

#[derive(Error, Debug, PartialEq)]
#[error("tolerance must be a finite positive number, got {0}")]
pub struct InvalidTolerance(pub f32);

/// Maximum accepted distance between probe and candidate (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Tolerance(f32);

impl Tolerance {
    pub fn new(value: f32) -> Result<Self, InvalidTolerance> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(InvalidTolerance(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// Strict comparison: a distance equal to the tolerance is rejected.
    pub fn accepts(self, distance: f32) -> bool {
        distance < self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(DEFAULT_TOLERANCE)
    }
}

impl TryFrom<f32> for Tolerance {
    type Error = InvalidTolerance;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tolerance> for f32 {
    fn from(t: Tolerance) -> f32 {
        t.0
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: Tolerance) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher over the whole gallery.
///
/// Always iterates ALL gallery entries so the time taken does not leak
/// the match position. On equal distances the earlier entry wins.
/// Entries whose distance is not finite never match.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: Tolerance) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dimension() != probe.dimension() {
                tracing::warn!(
                    identity = %entry.identity_id,
                    expected = probe.dimension(),
                    actual = entry.embedding.dimension(),
                    "skipping gallery entry with foreign dimension"
                );
                continue;
            }
            let dist = probe.euclidean_distance(&entry.embedding);
            if !dist.is_finite() {
                tracing::warn!(identity = %entry.identity_id, "skipping gallery entry with non-finite distance");
                continue;
            }
            // Strict `<` keeps the first of equidistant entries.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if tolerance.accepts(best_dist) => MatchResult {
                accepted: true,
                distance: Some(best_dist),
                identity_id: Some(gallery[idx].identity_id),
            },
            Some(_) => MatchResult {
                accepted: false,
                distance: Some(best_dist),
                identity_id: None,
            },
            None => MatchResult {
                accepted: false,
                distance: None,
                identity_id: None,
            },
        }
    }
}
