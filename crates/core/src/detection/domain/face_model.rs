use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::shared::embedding::Embedding;
use crate::shared::frame::Frame;
use crate::shared::region::BoundingBox;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    InvalidOutput(String),
}

/// One face found in a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Detector score in `[0, 1]`.
    pub confidence: f32,
}

impl Detection {
    /// Maps a detection found inside a cropped frame back to full-frame
    /// coordinates.
    pub fn offset(mut self, dx: f64, dy: f64) -> Self {
        self.bbox = self.bbox.translated(dx, dy);
        self
    }
}

/// Domain interface for face detection plus embedding.
///
/// Takes `&mut self` so implementations may keep per-stream state. The
/// processing worker is the only caller while the pipeline runs.
pub trait FaceModel: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError>;

    /// Drops inference sessions or other native handles. Called once on
    /// shutdown; later `detect` calls may fail.
    fn release(&mut self) {}
}

/// Model shared between the processing worker and the orchestrator, which
/// releases it on shutdown.
pub type SharedModel = Arc<Mutex<Box<dyn FaceModel>>>;
