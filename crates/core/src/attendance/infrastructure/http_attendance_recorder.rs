use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::attendance::domain::attendance_recorder::{AttendanceRecord, AttendanceRecorder, RecordError};

const RECORD_PATH: &str = "/diemdanh/record";

/// Posts attendance marks to the attendance backend.
pub struct HttpAttendanceRecorder {
    client: reqwest::blocking::Client,
    url: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordPayload<'a> {
    ma_sv: &'a str,
    ma_lop: &'a str,
    camera_id: &'a str,
    timestamp: String,
}

impl<'a> RecordPayload<'a> {
    fn from_record(record: &'a AttendanceRecord) -> Self {
        let at: DateTime<Local> = record.timestamp.into();
        Self {
            ma_sv: &record.student_id,
            ma_lop: &record.class_id,
            camera_id: &record.camera_id,
            timestamp: at.to_rfc3339(),
        }
    }
}

impl HttpAttendanceRecorder {
    /// `timeout` bounds each request so a hung backend cannot stall the
    /// side-effect stage.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{RECORD_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AttendanceRecorder for HttpAttendanceRecorder {
    fn record(&self, record: &AttendanceRecord) -> Result<(), RecordError> {
        let payload = RecordPayload::from_record(record);
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|e| RecordError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(RecordError::Rejected {
            student_id: record.student_id.clone(),
            reason: format!("HTTP {status}: {}", body.trim()),
        })
    }
}
