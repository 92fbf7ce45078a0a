pub mod http_attendance_recorder;
pub mod log_attendance_recorder;
