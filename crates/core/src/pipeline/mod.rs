pub mod attendance_pipeline;
pub mod frame_result;
pub mod infrastructure;
pub mod pipeline_config;
pub mod pipeline_logger;
pub mod pipeline_stats;
