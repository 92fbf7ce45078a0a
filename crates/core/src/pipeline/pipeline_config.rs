use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::recognition::domain::recognition_stabilizer::StabilizerSettings;
use crate::shared::constants::{STAGE_QUEUE_CAPACITY, TRACK_TIMEOUT_FRAMES};
use crate::shared::region::DetectionArea;
use crate::video::domain::video_reader::VideoSource;
use crate::video::frame_source::CaptureSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        origin: path.display().to_string(),
        source,
    })
}

/// One camera's attendance session.
///
/// `source` accepts a webcam index (number or numeric string) or a stream
/// URL / file path. `ma_lop` is the class the marks are filed under.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,
    pub source: VideoSource,
    #[serde(alias = "class_id", alias = "classId")]
    pub ma_lop: String,
    #[serde(default)]
    pub detection_area: Option<DetectionArea>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

impl CameraConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            origin: "camera config".into(),
            source,
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera_id.trim().is_empty() {
            return Err(invalid("camera_id", "must not be empty"));
        }
        if self.ma_lop.trim().is_empty() {
            return Err(invalid("ma_lop", "must not be empty"));
        }
        if let VideoSource::Url(url) = &self.source {
            if url.is_empty() {
                return Err(invalid("source", "must not be empty"));
            }
        }
        if let Some(area) = &self.detection_area {
            if area.width == 0 || area.height == 0 {
                return Err(invalid("detection_area", "width and height must be positive"));
            }
        }
        Ok(())
    }

    /// Camera override, else the pipeline default.
    pub fn cooldown(&self, settings: &PipelineSettings) -> Duration {
        Duration::from_secs(self.cooldown_seconds.unwrap_or(settings.cooldown_seconds))
    }
}

/// Tunables for every stage. All fields default, so a settings file only
/// needs the values it changes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub queue_poll_ms: u64,
    pub join_timeout_ms: u64,
    pub source_retries: u32,
    pub source_retry_delay_ms: u64,
    pub track_base_distance: f64,
    pub track_timeout_frames: u32,
    pub vote_horizon_ms: u64,
    pub vote_buffer_size: usize,
    pub min_confidence_frames: usize,
    pub vote_quorum: f32,
    pub recognition_threshold: f32,
    pub gallery_ttl_seconds: u64,
    pub cooldown_seconds: u64,
    pub detector_confidence: f32,
    pub min_face_area: f64,
    pub max_faces_per_frame: usize,
    pub http_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: STAGE_QUEUE_CAPACITY,
            queue_poll_ms: 100,
            join_timeout_ms: 2000,
            source_retries: 5,
            source_retry_delay_ms: 1000,
            track_base_distance: 80.0,
            track_timeout_frames: TRACK_TIMEOUT_FRAMES,
            vote_horizon_ms: 3000,
            vote_buffer_size: 10,
            min_confidence_frames: 3,
            vote_quorum: 0.6,
            recognition_threshold: 0.6,
            gallery_ttl_seconds: 300,
            cooldown_seconds: 300,
            detector_confidence: 0.5,
            min_face_area: 1600.0,
            max_faces_per_frame: 10,
            http_timeout_ms: 5000,
        }
    }
}

impl PipelineSettings {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.queue_poll_ms == 0 {
            return Err(invalid("queue_poll_ms", "must be positive"));
        }
        if self.source_retries == 0 {
            return Err(invalid("source_retries", "must be at least 1"));
        }
        if !(self.track_base_distance.is_finite() && self.track_base_distance > 0.0) {
            return Err(invalid("track_base_distance", "must be a positive number"));
        }
        if !(self.min_face_area.is_finite() && self.min_face_area >= 0.0) {
            return Err(invalid("min_face_area", "must be a non-negative number"));
        }
        if self.max_faces_per_frame == 0 {
            return Err(invalid("max_faces_per_frame", "must be at least 1"));
        }
        if self.vote_buffer_size == 0 {
            return Err(invalid("vote_buffer_size", "must be at least 1"));
        }
        if self.min_confidence_frames > self.vote_buffer_size {
            return Err(invalid(
                "min_confidence_frames",
                format!("cannot exceed vote_buffer_size ({})", self.vote_buffer_size),
            ));
        }
        for (field, value) in [
            ("vote_quorum", self.vote_quorum),
            ("recognition_threshold", self.recognition_threshold),
            ("detector_confidence", self.detector_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside [0, 1]")));
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn gallery_ttl(&self) -> Duration {
        Duration::from_secs(self.gallery_ttl_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_retries: self.source_retries,
            retry_delay: Duration::from_millis(self.source_retry_delay_ms),
        }
    }

    pub fn stabilizer_settings(&self) -> StabilizerSettings {
        StabilizerSettings {
            horizon: Duration::from_millis(self.vote_horizon_ms),
            max_samples: self.vote_buffer_size,
            min_confidence_frames: self.min_confidence_frames,
            vote_quorum: self.vote_quorum,
            recognition_threshold: self.recognition_threshold,
        }
    }
}
