//! Nearest-identity matching with a rejection threshold.

use crate::gallery::{GallerySnapshot, Identity};
use crate::types::Embedding;
use serde::Serialize;

/// Distances closer than this are treated as a tie.
pub const DEFAULT_TIE_TOLERANCE: f32 = 1e-6;

/// The best identity for one probe and how far away it is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub identity_id: String,
    pub name: String,
    pub enrollment_seq: u64,
    /// Euclidean distance; smaller is more similar.
    pub distance: f32,
}

impl MatchCandidate {
    fn new(identity: &Identity, distance: f32) -> Self {
        Self {
            identity_id: identity.id.clone(),
            name: identity.name.clone(),
            enrollment_seq: identity.enrollment_seq,
            distance,
        }
    }
}

/// Result of matching one probe against a gallery snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Best candidate is strictly below the threshold.
    Matched(MatchCandidate),
    /// Unknown face: the nearest identity is not close enough.
    Rejected { nearest: Option<MatchCandidate> },
    /// Nothing enrolled to compare against.
    EmptyGallery,
    /// Probe and gallery come from extractors of different dimension.
    DimensionMismatch { probe: usize, gallery: usize },
}

impl MatchOutcome {
    /// The accepted candidate, if any.
    pub fn accepted(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Matched(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this outcome points at configuration rather than an
    /// unrecognised face.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            MatchOutcome::EmptyGallery | MatchOutcome::DimensionMismatch { .. }
        )
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &GallerySnapshot, threshold: f32)
        -> MatchOutcome;
}

/// Best-of-N Euclidean matcher.
///
/// An identity's distance is the minimum over its own references. Every
/// identity within `tie_tolerance` of the overall minimum ties, and the one
/// enrolled first wins. Every gallery entry is visited.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tie_tolerance: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tie_tolerance: DEFAULT_TIE_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        gallery: &GallerySnapshot,
        threshold: f32,
    ) -> MatchOutcome {
        let Some(dimension) = gallery.dimension() else {
            return MatchOutcome::EmptyGallery;
        };
        if dimension != probe.dimension() {
            return MatchOutcome::DimensionMismatch {
                probe: probe.dimension(),
                gallery: dimension,
            };
        }

        // Snapshot identities are already in enrollment order.
        let distances: Vec<(&Identity, f32)> = gallery
            .identities()
            .iter()
            .filter_map(|identity| {
                identity
                    .references
                    .iter()
                    .filter_map(|r| probe.euclidean_distance(&r.embedding).ok())
                    .filter(|d| !d.is_nan())
                    .reduce(f32::min)
                    .map(|d| (identity, d))
            })
            .collect();

        // Earliest identity within tolerance of the overall minimum.
        let best = distances
            .iter()
            .map(|(_, d)| *d)
            .reduce(f32::min)
            .and_then(|min| {
                distances
                    .iter()
                    .find(|(_, d)| *d <= min + self.tie_tolerance)
                    .map(|(identity, d)| MatchCandidate::new(identity, *d))
            });

        match best {
            Some(c) if c.distance < threshold => MatchOutcome::Matched(c),
            nearest => MatchOutcome::Rejected { nearest },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::Gallery;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "test")
    }

    fn gallery(entries: &[(&str, &[&[f32]])]) -> Gallery {
        let (gallery, _) = Gallery::load(Arc::new(MemoryStore::new())).unwrap();
        for (id, refs) in entries {
            gallery.enroll_embedding(id, id, emb(refs[0]), None).unwrap();
            for r in &refs[1..] {
                gallery.add_reference_embedding(id, emb(r), None, false).unwrap();
            }
        }
        gallery
    }

    fn matched_id(outcome: &MatchOutcome) -> Option<&str> {
        outcome.accepted().map(|c| c.identity_id.as_str())
    }

    #[test]
    fn test_closer_identity_accepted_below_threshold() {
        let g = gallery(&[("A", &[&[0.0, 0.0]]), ("B", &[&[10.0, 0.0]])]);
        let probe = emb(&[1.0, 0.0]);
        let out = EuclideanMatcher::default().best_match(&probe, &g.snapshot(), 1.5);
        assert_eq!(matched_id(&out), Some("A"));
        assert!((out.accepted().unwrap().distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let g = gallery(&[("A", &[&[0.0, 0.0]]), ("B", &[&[10.0, 0.0]])]);
        let probe = emb(&[1.0, 0.0]);
        let matcher = EuclideanMatcher::default();

        let at = matcher.best_match(&probe, &g.snapshot(), 1.0);
        match at {
            MatchOutcome::Rejected { nearest: Some(c) } => assert_eq!(c.identity_id, "A"),
            other => panic!("expected rejection, got {other:?}"),
        }
        // Even a threshold that B would satisfy never forces a guess at B.
        let above_b = matcher.best_match(&probe, &g.snapshot(), 0.5);
        assert!(matches!(above_b, MatchOutcome::Rejected { .. }));
    }

    #[test]
    fn test_best_of_n_not_average() {
        // A has one far reference and one exact one; B sits in between.
        let g = gallery(&[("A", &[&[50.0, 50.0], &[1.0, 1.0]]), ("B", &[&[2.0, 2.0]])]);
        let probe = emb(&[1.0, 1.0]);
        let out = EuclideanMatcher::default().best_match(&probe, &g.snapshot(), 0.5);
        assert_eq!(matched_id(&out), Some("A"));
        assert_eq!(out.accepted().unwrap().distance, 0.0);
    }

    #[test]
    fn test_tie_goes_to_earliest_enrolled() {
        let g = gallery(&[("late", &[&[2.0, 0.0]]), ("early", &[&[0.0, 2.0]])]);
        // Enrollment order: "late" first despite its name.
        let probe = emb(&[0.0, 0.0]);
        let out = EuclideanMatcher::default().best_match(&probe, &g.snapshot(), 5.0);
        assert_eq!(matched_id(&out), Some("late"));

        let g = gallery(&[("X", &[&[1.0, 0.0]]), ("Y", &[&[1.0 - 1e-7, 0.0]])]);
        let probe = emb(&[0.0, 0.0]);
        let out = EuclideanMatcher::default().best_match(&probe, &g.snapshot(), 5.0);
        assert_eq!(matched_id(&out), Some("X"));
    }

    #[test]
    fn test_tie_chain_measured_from_overall_minimum() {
        // B and C tie; A is beyond tolerance of C though within it of B.
        let g = gallery(&[
            ("A", &[&[1.0]]),
            ("B", &[&[0.999_999_2]]),
            ("C", &[&[0.999_998_5]]),
        ]);
        let out = EuclideanMatcher::default().best_match(&emb(&[0.0]), &g.snapshot(), 5.0);
        assert_eq!(matched_id(&out), Some("B"));

        // The chosen candidate's own distance is checked against the threshold.
        let out = EuclideanMatcher::default().best_match(&emb(&[0.0]), &g.snapshot(), 0.999_999);
        match out {
            MatchOutcome::Rejected { nearest: Some(c) } => assert_eq!(c.identity_id, "B"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_clearly_closer_later_identity_wins() {
        let g = gallery(&[("first", &[&[3.0, 0.0]]), ("second", &[&[1.0, 0.0]])]);
        let out = EuclideanMatcher::default().best_match(&emb(&[0.0, 0.0]), &g.snapshot(), 5.0);
        assert_eq!(matched_id(&out), Some("second"));
    }

    #[test]
    fn test_deterministic() {
        let g = gallery(&[("A", &[&[0.0, 1.0]]), ("B", &[&[1.0, 0.0]]), ("C", &[&[0.7, 0.7]])]);
        let snapshot = g.snapshot();
        let probe = emb(&[0.6, 0.8]);
        let m = EuclideanMatcher::default();
        assert_eq!(m.best_match(&probe, &snapshot, 1.0), m.best_match(&probe, &snapshot, 1.0));
    }

    #[test]
    fn test_empty_gallery() {
        let g = gallery(&[]);
        let out = EuclideanMatcher::default().best_match(&emb(&[1.0]), &g.snapshot(), 1.0);
        assert_eq!(out, MatchOutcome::EmptyGallery);
        assert!(out.is_misconfiguration());
    }

    #[test]
    fn test_dimension_mismatch_is_no_match() {
        let g = gallery(&[("A", &[&[0.0, 0.0]])]);
        let out = EuclideanMatcher::default().best_match(&emb(&[0.0, 0.0, 0.0]), &g.snapshot(), 1.0);
        assert_eq!(out, MatchOutcome::DimensionMismatch { probe: 3, gallery: 2 });
        assert!(out.accepted().is_none());
        assert!(out.is_misconfiguration());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let out = MatchOutcome::Rejected { nearest: None };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["outcome"], "rejected");
    }
}
