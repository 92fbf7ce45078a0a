pub const DETECTOR_MODEL_NAME: &str = "yolo11n-pose_widerface.onnx";
pub const DETECTOR_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/yolo11n-pose_widerface.onnx";

pub const EMBEDDING_MODEL_NAME: &str = "w600k_r50.onnx";
pub const EMBEDDING_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/w600k_r50.onnx";

/// Missed cycles before a track is pruned (~1 second at 30 fps).
pub const TRACK_TIMEOUT_FRAMES: u32 = 30;

/// Capacity of every stage-to-stage queue.
pub const STAGE_QUEUE_CAPACITY: usize = 8;
