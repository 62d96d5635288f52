//! Nearest-identity search over an in-memory gallery.

use crate::types::FeatureVector;
use serde::Serialize;

/// One enrolled identity as seen by a matcher.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub id: i64,
    pub name: String,
    pub features: FeatureVector,
}

/// Best gallery entry for a query vector, accepted under the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityMatch {
    pub id: i64,
    pub name: String,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Strategy for comparing a query vector against a gallery.
pub trait Matcher {
    /// The most similar entry if its similarity is at least `threshold`.
    fn compare(
        &self,
        query: &FeatureVector,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<IdentityMatch>;
}

/// Cosine similarity, full scan.
///
/// Every entry is compared. Only a strictly greater similarity replaces the
/// current best, so ties go to the earliest entry in gallery order. Entries
/// of a different dimension are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &FeatureVector,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Option<IdentityMatch> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut skipped = 0usize;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(sim) = query.similarity(&entry.features) else {
                skipped += 1;
                continue;
            };
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                query_dim = query.dimension(),
                "gallery entries with a different vector dimension were ignored"
            );
        }

        let idx = best_idx?;
        tracing::debug!(
            id = gallery[idx].id,
            similarity = best_sim,
            threshold,
            "best gallery candidate"
        );
        (best_sim >= threshold).then(|| IdentityMatch {
            id: gallery[idx].id,
            name: gallery[idx].name.clone(),
            similarity: best_sim,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::normalize(values).unwrap()
    }

    fn entry(id: i64, name: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            id,
            name: name.into(),
            features: fv(values),
        }
    }

    #[test]
    fn test_finds_last_entry() {
        let gallery = vec![
            entry(1, "decoy1", &[0.0, 1.0, 0.0]),
            entry(2, "decoy2", &[0.0, 0.0, 1.0]),
            entry(3, "match", &[1.0, 0.0, 0.0]),
        ];
        let m = CosineMatcher
            .compare(&fv(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .unwrap();
        assert_eq!(m.id, 3);
        assert_eq!(m.name, "match");
        assert!((m.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold() {
        let gallery = vec![entry(1, "other", &[0.0, 1.0, 0.0])];
        assert!(CosineMatcher
            .compare(&fv(&[1.0, 0.0, 0.0]), &gallery, 0.5)
            .is_none());
    }

    #[test]
    fn test_empty_gallery() {
        assert!(CosineMatcher.compare(&fv(&[1.0, 0.0]), &[], -1.0).is_none());
    }

    #[test]
    fn test_opposite_vector_rejected() {
        let gallery = vec![entry(1, "Alice", &[0.3, -0.2, 0.9])];
        assert!(CosineMatcher
            .compare(&fv(&[-0.3, 0.2, -0.9]), &gallery, 0.6)
            .is_none());
    }

    #[test]
    fn test_threshold_inclusive() {
        let gallery = vec![entry(7, "exact", &[1.0, 0.0])];
        let m = CosineMatcher.compare(&fv(&[1.0, 0.0]), &gallery, 1.0);
        assert_eq!(m.map(|m| m.id), Some(7));
    }

    #[test]
    fn test_tie_goes_to_first_entry() {
        let gallery = vec![
            entry(4, "first", &[1.0, 1.0]),
            entry(9, "second", &[2.0, 2.0]),
        ];
        let m = CosineMatcher.compare(&fv(&[1.0, 1.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.id, 4);
    }

    #[test]
    fn test_dimension_mismatch_skipped() {
        let gallery = vec![
            entry(1, "wide", &[1.0, 0.0, 0.0]),
            entry(2, "narrow", &[0.8, 0.6]),
        ];
        let m = CosineMatcher.compare(&fv(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(m.id, 2);
    }
}
