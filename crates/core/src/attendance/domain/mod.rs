pub mod attendance_gate;
pub mod attendance_recorder;
