use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::shared::embedding::Embedding;

use super::gallery_source::{GalleryLoadError, KnownFace};

#[derive(Clone, Debug, PartialEq)]
pub struct GalleryEntry {
    pub student_id: String,
    pub name: String,
    pub embedding: Embedding,
    pub loaded_at: Instant,
}

/// Immutable snapshot of known identities.
///
/// Never mutated after construction; a refresh builds a new `Gallery` and
/// swaps it in whole.
#[derive(Debug)]
pub struct Gallery {
    entries: BTreeMap<String, GalleryEntry>,
    loaded_at: Instant,
    ttl: Duration,
    dimension: usize,
}

impl Gallery {
    /// Normalizes and validates `faces`.
    ///
    /// Zero-norm or non-finite embeddings are skipped with a warning. All
    /// remaining embeddings must share one dimension; a mismatch rejects the
    /// whole load. A later duplicate of a student ID replaces the earlier one.
    pub fn build(
        faces: Vec<KnownFace>,
        loaded_at: Instant,
        ttl: Duration,
    ) -> Result<Self, GalleryLoadError> {
        let mut entries = BTreeMap::new();
        let mut dimension = None;

        for face in faces {
            let Some(embedding) = Embedding::normalized(face.embedding) else {
                log::warn!("Skipping degenerate embedding for {}", face.student_id);
                continue;
            };
            let expected = *dimension.get_or_insert(embedding.dimension());
            if embedding.dimension() != expected {
                return Err(GalleryLoadError::DimensionMismatch {
                    student_id: face.student_id,
                    expected,
                    found: embedding.dimension(),
                });
            }
            let name = face.name.unwrap_or_else(|| face.student_id.clone());
            let entry = GalleryEntry {
                student_id: face.student_id.clone(),
                name,
                embedding,
                loaded_at,
            };
            if entries.insert(face.student_id.clone(), entry).is_some() {
                log::warn!("Duplicate gallery entry for {}; keeping the last", face.student_id);
            }
        }

        match dimension {
            Some(dimension) => Ok(Self {
                entries,
                loaded_at,
                ttl,
                dimension,
            }),
            None => Err(GalleryLoadError::Empty),
        }
    }

    /// Highest-similarity entry, regardless of any threshold.
    pub fn nearest(&self, embedding: &Embedding) -> Option<(&GalleryEntry, f32)> {
        self.entries
            .values()
            .map(|entry| (entry, entry.embedding.similarity(embedding)))
            .fold(None, |best, (entry, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((entry, sim)),
            })
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.loaded_at) > self.ttl
    }

    pub fn get(&self, student_id: &str) -> Option<&GalleryEntry> {
        self.entries.get(student_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn face(id: &str, embedding: Vec<f32>) -> KnownFace {
        KnownFace {
            student_id: id.into(),
            name: None,
            embedding,
        }
    }

    fn build(faces: Vec<KnownFace>) -> Result<Gallery, GalleryLoadError> {
        Gallery::build(faces, Instant::now(), Duration::from_secs(60))
    }

    #[test]
    fn test_build_normalizes_embeddings() {
        let gallery = build(vec![face("SV001", vec![3.0, 4.0])]).unwrap();

        let entry = gallery.get("SV001").unwrap();
        assert_relative_eq!(entry.embedding.as_slice()[0], 0.6);
        assert_eq!(entry.name, "SV001");
        assert_eq!(gallery.dimension(), 2);
    }

    #[test]
    fn test_build_skips_zero_vectors() {
        let gallery = build(vec![face("A", vec![0.0, 0.0]), face("B", vec![1.0, 0.0])]).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(gallery.get("A").is_none());
    }

    #[test]
    fn test_build_rejects_mixed_dimensions() {
        let err = build(vec![face("A", vec![1.0, 0.0]), face("B", vec![1.0, 0.0, 0.0])]).unwrap_err();
        assert!(matches!(err, GalleryLoadError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn test_build_empty_is_error() {
        assert!(matches!(build(vec![]), Err(GalleryLoadError::Empty)));
        assert!(matches!(build(vec![face("A", vec![0.0])]), Err(GalleryLoadError::Empty)));
    }

    #[test]
    fn test_nearest_picks_highest_similarity() {
        let gallery = build(vec![face("A", vec![1.0, 0.0]), face("B", vec![0.0, 1.0])]).unwrap();
        let query = Embedding::normalized(vec![0.2, 0.9]).unwrap();

        let (entry, sim) = gallery.nearest(&query).unwrap();

        assert_eq!(entry.student_id, "B");
        assert!(sim > 0.9);
    }

    #[test]
    fn test_expiry_uses_ttl() {
        let t0 = Instant::now();
        let gallery = Gallery::build(vec![face("A", vec![1.0])], t0, Duration::from_secs(10)).unwrap();

        assert!(!gallery.is_expired(t0 + Duration::from_secs(10)));
        assert!(gallery.is_expired(t0 + Duration::from_secs(11)));
    }
}
