use std::time::SystemTime;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("attendance for {student_id} rejected: {reason}")]
    Rejected { student_id: String, reason: String },
    #[error("attendance backend unreachable: {0}")]
    Transport(String),
}

/// One attendance mark to persist.
#[derive(Clone, Debug, PartialEq)]
pub struct AttendanceRecord {
    pub student_id: String,
    pub class_id: String,
    pub camera_id: String,
    pub timestamp: SystemTime,
}

/// Persists attendance marks. Shared across workers, hence `Sync`.
pub trait AttendanceRecorder: Send + Sync {
    fn record(&self, record: &AttendanceRecord) -> Result<(), RecordError>;
}
