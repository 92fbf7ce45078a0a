use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::recognition::domain::recognition_stabilizer::Decision;
use crate::shared::region::BoundingBox;
use crate::tracking::domain::track::TrackState;

/// One live track as seen in a processed frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackReport {
    pub track_id: u32,
    pub bbox: BoundingBox,
    pub state: TrackState,
    /// Detector score when the track matched a detection this frame.
    pub confidence: Option<f32>,
    /// `None` when the track had no detection to recognize this frame.
    pub decision: Option<Decision>,
}

/// Output of the processing stage for one frame.
#[derive(Clone, Debug, Serialize)]
pub struct FrameResult {
    pub sequence: u64,
    #[serde(skip)]
    pub captured_at: Instant,
    pub tracks: Vec<TrackReport>,
}

impl FrameResult {
    /// `(track_id, student_id, confidence)` for every confirmed track.
    pub fn confirmed(&self) -> impl Iterator<Item = (u32, &str, f32)> + '_ {
        self.tracks.iter().filter_map(|t| match &t.decision {
            Some(Decision::Confirmed {
                student_id,
                confidence,
            }) => Some((t.track_id, student_id.as_str(), *confidence)),
            _ => None,
        })
    }
}

/// Observer invoked by the output stage with every frame result.
pub type ResultCallback = Arc<dyn Fn(&FrameResult) + Send + Sync>;
