use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryLoadError {
    #[error("gallery source failed: {0}")]
    Source(String),
    #[error("gallery source returned no usable embeddings")]
    Empty,
    #[error("embedding for {student_id} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        student_id: String,
        expected: usize,
        found: usize,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {reason}")]
    Parse { origin: String, reason: String },
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },
}

/// A known identity as delivered by a gallery source. The embedding is
/// raw; the gallery normalizes it.
#[derive(Clone, Debug, PartialEq)]
pub struct KnownFace {
    pub student_id: String,
    pub name: Option<String>,
    pub embedding: Vec<f32>,
}

/// Supplies the full set of known identities.
///
/// Called from whichever worker performs the refresh, hence `Sync`.
pub trait GallerySource: Send + Sync {
    fn list_known_embeddings(&self) -> Result<Vec<KnownFace>, GalleryLoadError>;

    /// Human-readable origin for log messages.
    fn describe(&self) -> String;
}
