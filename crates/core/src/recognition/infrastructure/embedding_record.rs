use base64::Engine;
use serde::Deserialize;

use crate::recognition::domain::gallery_source::{GalleryLoadError, KnownFace};

/// Stored embedding record, shared by the file and HTTP sources.
///
/// Field names follow the attendance backend (`maSv`, `hoTen`); the
/// embedding is a JSON number array, a comma-separated string, or base64 of
/// little-endian `f32` bytes.
#[derive(Debug, Deserialize)]
pub(super) struct EmbeddingRecord {
    #[serde(alias = "maSv", alias = "student_id")]
    pub ma_sv: String,
    #[serde(default, alias = "hoTen")]
    pub name: Option<String>,
    #[serde(default)]
    pub embedding: Option<EmbeddingValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum EmbeddingValue {
    Values(Vec<f32>),
    Text(String),
}

impl EmbeddingValue {
    fn into_values(self) -> Result<Vec<f32>, String> {
        match self {
            EmbeddingValue::Values(v) => Ok(v),
            EmbeddingValue::Text(text) => {
                parse_delimited(&text).or_else(|csv_err| decode_base64(&text).ok_or(csv_err))
            }
        }
    }
}

fn parse_delimited(text: &str) -> Result<Vec<f32>, String> {
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f32>().map_err(|e| format!("bad component {s:?}: {e}")))
        .collect()
}

fn decode_base64(text: &str) -> Option<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .ok()?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

impl EmbeddingRecord {
    /// `Ok(None)` for a record without an embedding yet.
    pub fn into_known_face(self, origin: &str) -> Result<Option<KnownFace>, GalleryLoadError> {
        let Some(value) = self.embedding else {
            log::debug!("{origin}: no embedding for {}", self.ma_sv);
            return Ok(None);
        };
        let embedding = value.into_values().map_err(|reason| GalleryLoadError::Parse {
            origin: format!("{origin} ({})", self.ma_sv),
            reason,
        })?;
        if embedding.is_empty() {
            log::debug!("{origin}: empty embedding for {}", self.ma_sv);
            return Ok(None);
        }
        Ok(Some(KnownFace {
            student_id: self.ma_sv,
            name: self.name.filter(|n| !n.trim().is_empty()),
            embedding,
        }))
    }
}
