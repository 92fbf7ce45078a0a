use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source {locator} unavailable after {attempts} attempt(s)")]
    Unavailable { locator: String, attempts: u32 },
    #[error("failed to open {locator}: {reason}")]
    Open { locator: String, reason: String },
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("video source not opened")]
    NotOpened,
}

/// Where frames come from: a local capture device by index, or a
/// stream URL / file path.
///
/// Deserializes from either a JSON integer or a string; numeric strings
/// are treated as device indices.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "RawVideoSource")]
pub enum VideoSource {
    Device(u32),
    Url(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVideoSource {
    Index(u32),
    Text(String),
}

impl From<RawVideoSource> for VideoSource {
    fn from(raw: RawVideoSource) -> Self {
        match raw {
            RawVideoSource::Index(i) => VideoSource::Device(i),
            RawVideoSource::Text(s) => VideoSource::parse(&s),
        }
    }
}

const LIVE_SCHEMES: &[&str] = &["rtsp://", "rtsps://", "rtmp://", "http://", "https://", "udp://", "tcp://"];

impl VideoSource {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.parse::<u32>() {
            Ok(index) => VideoSource::Device(index),
            Err(_) => VideoSource::Url(trimmed.to_string()),
        }
    }

    /// The string handed to the demuxer.
    pub fn locator(&self) -> String {
        match self {
            VideoSource::Device(index) => device_locator(*index),
            VideoSource::Url(url) => url.clone(),
        }
    }

    /// Live sources never legitimately end; end-of-stream on one is a read
    /// failure that triggers reconnection.
    pub fn is_live(&self) -> bool {
        match self {
            VideoSource::Device(_) => true,
            VideoSource::Url(url) => {
                let lower = url.to_ascii_lowercase();
                LIVE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn device_locator(index: u32) -> String {
    format!("/dev/video{index}")
}

#[cfg(not(target_os = "linux"))]
fn device_locator(index: u32) -> String {
    index.to_string()
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Device(index) => write!(f, "device #{index}"),
            VideoSource::Url(url) => f.write_str(url),
        }
    }
}

/// Properties of an opened stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub locator: String,
}

/// Reads frames from a camera, stream or file.
///
/// Implementations handle codec and transport details; the pipeline only
/// sees `Frame`s. `read` returns `Ok(None)` once a finite source is
/// exhausted.
pub trait VideoReader: Send {
    fn open(&mut self, source: &VideoSource) -> Result<StreamInfo, SourceError>;

    fn read(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Releases the underlying handle. Must be idempotent.
    fn close(&mut self);
}

/// Reader shared between the capture worker and the orchestrator, which
/// closes it on shutdown.
pub type SharedReader = Arc<Mutex<Box<dyn VideoReader>>>;
