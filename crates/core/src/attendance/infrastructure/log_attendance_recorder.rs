use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};

use crate::attendance::domain::attendance_recorder::{AttendanceRecord, AttendanceRecorder, RecordError};

/// Dry-run recorder: logs each mark instead of sending it anywhere.
#[derive(Default)]
pub struct LogAttendanceRecorder {
    recorded: AtomicU64,
}

impl LogAttendanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl AttendanceRecorder for LogAttendanceRecorder {
    fn record(&self, record: &AttendanceRecord) -> Result<(), RecordError> {
        let at: DateTime<Local> = record.timestamp.into();
        log::info!(
            "[dry-run] attendance {} class={} camera={} at {}",
            record.student_id,
            record.class_id,
            record.camera_id,
            at.format("%Y-%m-%d %H:%M:%S")
        );
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
