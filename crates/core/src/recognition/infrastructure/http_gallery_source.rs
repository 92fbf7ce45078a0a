use std::time::Duration;

use serde::Deserialize;

use crate::recognition::domain::gallery_source::{GalleryLoadError, GallerySource, KnownFace};

use super::embedding_record::EmbeddingRecord;

const EMBEDDINGS_PATH: &str = "/sinhvien/embeddings";

/// Fetches all student embeddings from the attendance backend.
pub struct HttpGallerySource {
    client: reqwest::blocking::Client,
    url: String,
}

/// The backend answers either with a bare array or wrapped in `data`.
/// Records are decoded one by one so a malformed row only costs itself.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Bare(Vec<serde_json::Value>),
    Wrapped { data: Vec<serde_json::Value> },
}

impl HttpGallerySource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{EMBEDDINGS_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn parse_listing(body: &str, origin: &str) -> Result<Vec<KnownFace>, GalleryLoadError> {
    let listing: Listing = serde_json::from_str(body).map_err(|e| GalleryLoadError::Parse {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;
    let records = match listing {
        Listing::Bare(records) | Listing::Wrapped { data: records } => records,
    };

    let mut faces = Vec::with_capacity(records.len());
    for (index, raw) in records.into_iter().enumerate() {
        let parsed = serde_json::from_value::<EmbeddingRecord>(raw)
            .map_err(|e| GalleryLoadError::Parse {
                origin: format!("{origin} [{index}]"),
                reason: e.to_string(),
            })
            .and_then(|record| record.into_known_face(origin));
        match parsed {
            Ok(Some(face)) => faces.push(face),
            Ok(None) => {}
            Err(e) => log::warn!("Skipping embedding record: {e}"),
        }
    }
    Ok(faces)
}

impl GallerySource for HttpGallerySource {
    fn list_known_embeddings(&self) -> Result<Vec<KnownFace>, GalleryLoadError> {
        let http_err = |e: reqwest::Error| GalleryLoadError::Http {
            url: self.url.clone(),
            reason: e.to_string(),
        };
        let response = self
            .client
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;
        let body = response.text().map_err(http_err)?;
        let faces = parse_listing(&body, &self.url)?;
        log::debug!("Fetched {} embeddings from {}", faces.len(), self.url);
        Ok(faces)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_base_without_double_slash() {
        let source = HttpGallerySource::new("http://localhost:8080/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(source.url(), "http://localhost:8080/api/sinhvien/embeddings");
    }

    #[test]
    fn test_parses_bare_array() {
        let body = r#"[
            {"maSv": "SV001", "hoTen": "An", "embedding": "0.1,0.2"},
            {"maSv": "SV002", "embedding": null}
        ]"#;

        let faces = parse_listing(body, "test").unwrap();

        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].student_id, "SV001");
        assert_eq!(faces[0].embedding, vec![0.1, 0.2]);
    }

    #[test]
    fn test_parses_wrapped_listing() {
        let body = r#"{"data": [{"maSv": "SV003", "embedding": [1, 0, 0]}]}"#;

        let faces = parse_listing(body, "test").unwrap();

        assert_eq!(faces[0].student_id, "SV003");
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let body = r#"[
            {"maSv": "SV001", "embedding": "0.5,0.5"},
            {"maSv": "SV002", "embedding": "1,abc"},
            {"hoTen": "no id", "embedding": [1, 0]},
            {"maSv": "SV003", "embedding": "zczMPc3MTD6amZk+"}
        ]"#;

        let faces = parse_listing(body, "test").unwrap();

        let ids: Vec<&str> = faces.iter().map(|f| f.student_id.as_str()).collect();
        assert_eq!(ids, vec!["SV001", "SV003"]);
        assert_eq!(faces[1].embedding.len(), 3);
    }

    #[test]
    fn test_rejects_non_listing_body() {
        assert!(matches!(
            parse_listing(r#"{"error": "unauthorized"}"#, "test"),
            Err(GalleryLoadError::Parse { .. })
        ));
    }
}
