use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::detection::domain::face_model::{Detection, FaceModel, ModelError};
use crate::shared::embedding::Embedding;
use crate::shared::frame::Frame;
use crate::shared::region::BoundingBox;

/// Replays pre-computed detections by frame sequence number.
///
/// Stands in for the ONNX models when running against recorded scripts, so
/// the rest of the pipeline can be exercised without model files.
pub struct ReplayFaceModel {
    script: Arc<HashMap<u64, Vec<Detection>>>,
    fallback: Vec<Detection>,
}

#[derive(Deserialize)]
struct ScriptEntry {
    sequence: u64,
    detections: Vec<ScriptDetection>,
}

#[derive(Deserialize)]
struct ScriptDetection {
    bbox: [f64; 4],
    embedding: Vec<f32>,
    #[serde(default = "full_confidence")]
    confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl ReplayFaceModel {
    pub fn new(script: Arc<HashMap<u64, Vec<Detection>>>) -> Self {
        Self {
            script,
            fallback: Vec::new(),
        }
    }

    /// Returns `detections` for every frame.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            script: Arc::new(HashMap::new()),
            fallback: detections,
        }
    }

    /// Loads a JSON array of `{ "sequence", "detections": [{ "bbox",
    /// "embedding", "confidence"? }] }` entries.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        let entries: Vec<ScriptEntry> = serde_json::from_str(&text)?;

        let mut script = HashMap::with_capacity(entries.len());
        for entry in entries {
            let mut detections = Vec::with_capacity(entry.detections.len());
            for d in entry.detections {
                let embedding = Embedding::normalized(d.embedding).ok_or_else(|| {
                    format!("frame {}: embedding must be non-zero and finite", entry.sequence)
                })?;
                let [x1, y1, x2, y2] = d.bbox;
                detections.push(Detection {
                    bbox: BoundingBox::new(x1, y1, x2, y2),
                    embedding,
                    confidence: d.confidence,
                });
            }
            script.insert(entry.sequence, detections);
        }
        log::info!("Loaded replay script with {} frames from {}", script.len(), path.display());
        Ok(Self::new(Arc::new(script)))
    }
}

impl FaceModel for ReplayFaceModel {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        Ok(self
            .script
            .get(&frame.sequence())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
