use std::fs;
use std::path::{Path, PathBuf};

use crate::recognition::domain::gallery_source::{GalleryLoadError, GallerySource, KnownFace};

use super::embedding_record::EmbeddingRecord;

/// Reads `<student_id>.json` embedding records from a directory.
///
/// Unreadable or malformed files are logged and skipped; only an unreadable
/// directory fails the listing.
pub struct JsonGallerySource {
    dir: PathBuf,
}

impl JsonGallerySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, GalleryLoadError> {
        let io_err = |source| GalleryLoadError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn read_record(path: &Path) -> Result<Option<KnownFace>, GalleryLoadError> {
    let text = fs::read_to_string(path).map_err(|source| GalleryLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: EmbeddingRecord =
        serde_json::from_str(&text).map_err(|e| GalleryLoadError::Parse {
            origin: path.display().to_string(),
            reason: e.to_string(),
        })?;
    record.into_known_face(&path.display().to_string())
}

impl GallerySource for JsonGallerySource {
    fn list_known_embeddings(&self) -> Result<Vec<KnownFace>, GalleryLoadError> {
        let mut faces = Vec::new();
        for path in self.record_paths()? {
            match read_record(&path) {
                Ok(Some(face)) => faces.push(face),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping embedding record: {e}"),
            }
        }
        log::debug!("Read {} embedding records from {}", faces.len(), self.dir.display());
        Ok(faces)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}
