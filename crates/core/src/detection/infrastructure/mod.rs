mod execution_provider;
pub mod onnx_face_model;
pub mod replay_face_model;
