/// Face detection plus recognition embedding on ONNX Runtime via `ort`.
///
/// A YOLO face detector (letterbox, confidence filter, NMS) finds boxes;
/// each box is cropped, resized to 112x112 and fed to an ArcFace model
/// whose output is L2-normalized into an [`Embedding`].
use std::path::{Path, PathBuf};

use ort::session::Session;

use crate::detection::domain::face_model::{Detection, FaceModel, ModelError};
use crate::detection::infrastructure::execution_provider;
use crate::shared::embedding::Embedding;
use crate::shared::frame::Frame;
use crate::shared::region::BoundingBox;

/// Fallback detector input resolution when the model doesn't specify dimensions.
const DEFAULT_INPUT_SIZE: u32 = 640;

pub const DEFAULT_CONFIDENCE: f32 = 0.5;

const NMS_IOU_THRESH: f64 = 0.45;

/// Faces smaller than this (in either dimension) are too blurry to embed.
const MIN_FACE_PIXELS: f64 = 16.0;

pub const DEFAULT_MIN_FACE_AREA: f64 = 1600.0;
pub const DEFAULT_MAX_FACES: usize = 10;

const EMBED_INPUT_SIZE: usize = 112;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 127.5;

pub struct OnnxFaceModel {
    detector: Option<Session>,
    embedder: Option<Session>,
    detector_path: PathBuf,
    embedder_path: PathBuf,
    threads: usize,
    confidence: f32,
    min_face_area: f64,
    max_faces: usize,
    input_size: u32,
}

impl OnnxFaceModel {
    /// Loads both models. Sessions dropped by `release` are reopened
    /// from the same paths on the next `detect`.
    ///
    /// The detector input resolution is read from its input shape (NCHW),
    /// falling back to 640 when the shape is dynamic.
    pub fn new(
        detector_path: &Path,
        embedder_path: &Path,
        confidence: f32,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let detector = execution_provider::open_session(detector_path, threads)?;
        let embedder = execution_provider::open_session(embedder_path, threads)?;

        let input_size = detector
            .inputs()
            .first()
            .and_then(|input| match input.dtype() {
                ort::value::ValueType::Tensor { shape, .. } if shape.len() >= 4 && shape[2] > 0 => {
                    Some(shape[2] as u32)
                }
                _ => None,
            })
            .unwrap_or(DEFAULT_INPUT_SIZE);

        Ok(Self {
            detector: Some(detector),
            embedder: Some(embedder),
            detector_path: detector_path.to_path_buf(),
            embedder_path: embedder_path.to_path_buf(),
            threads,
            confidence,
            min_face_area: DEFAULT_MIN_FACE_AREA,
            max_faces: DEFAULT_MAX_FACES,
            input_size,
        })
    }

    /// Drops faces of at most `min_area` px² and keeps the `max_faces`
    /// best of the rest per frame.
    pub fn with_face_limits(mut self, min_area: f64, max_faces: usize) -> Self {
        self.min_face_area = min_area;
        self.max_faces = max_faces;
        self
    }

    /// Reopens sessions dropped by [`FaceModel::release`].
    fn ensure_loaded(&mut self) -> Result<(), ModelError> {
        if self.detector.is_none() {
            log::info!("Reloading detector from {}", self.detector_path.display());
            self.detector = Some(
                execution_provider::open_session(&self.detector_path, self.threads)
                    .map_err(inference)?,
            );
        }
        if self.embedder.is_none() {
            log::info!("Reloading embedder from {}", self.embedder_path.display());
            self.embedder = Some(
                execution_provider::open_session(&self.embedder_path, self.threads)
                    .map_err(inference)?,
            );
        }
        Ok(())
    }

    fn locate_faces(&mut self, frame: &Frame) -> Result<Vec<Candidate>, ModelError> {
        let session = self
            .detector
            .as_mut()
            .ok_or_else(|| ModelError::Inference("detector released".into()))?;

        let (input, letterbox) = letterbox(frame, self.input_size);
        let input_value = ort::value::Tensor::from_array(input).map_err(inference)?;
        let outputs = session.run(ort::inputs![input_value]).map_err(inference)?;
        if outputs.len() == 0 {
            return Err(ModelError::InvalidOutput("detector produced no outputs".into()));
        }
        let tensor = outputs[0].try_extract_array::<f32>().map_err(inference)?;
        let data = tensor
            .as_slice()
            .ok_or_else(|| ModelError::InvalidOutput("non-contiguous detector output".into()))?;

        let mut candidates = decode_predictions(data, tensor.shape(), self.confidence, &letterbox)?;
        let kept = nms(&mut candidates, NMS_IOU_THRESH);
        Ok(select_faces(kept, self.min_face_area, self.max_faces))
    }

    fn embed(&mut self, face: &FaceCrop) -> Result<Option<Embedding>, ModelError> {
        let session = self
            .embedder
            .as_mut()
            .ok_or_else(|| ModelError::Inference("embedder released".into()))?;

        let input = preprocess_face(face);
        let input_value = ort::value::Tensor::from_array(input).map_err(inference)?;
        let outputs = session.run(ort::inputs![input_value]).map_err(inference)?;
        if outputs.len() == 0 {
            return Err(ModelError::InvalidOutput("embedder produced no outputs".into()));
        }
        let array = outputs[0].try_extract_array::<f32>().map_err(inference)?;
        let values = array
            .as_slice()
            .ok_or_else(|| ModelError::InvalidOutput("non-contiguous embedding".into()))?;
        Ok(Embedding::normalized(values.to_vec()))
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        self.ensure_loaded()?;
        let candidates = self.locate_faces(frame)?;

        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(face) = crop_face(frame, &candidate.bbox) else {
                continue;
            };
            match self.embed(&face)? {
                Some(embedding) => detections.push(Detection {
                    bbox: candidate.bbox,
                    embedding,
                    confidence: candidate.confidence,
                }),
                None => log::debug!("Discarding degenerate embedding at {:?}", candidate.bbox),
            }
        }
        Ok(detections)
    }

    fn release(&mut self) {
        self.detector = None;
        self.embedder = None;
    }
}

fn inference(e: impl std::fmt::Display) -> ModelError {
    ModelError::Inference(e.to_string())
}

// ---------------------------------------------------------------------------
// Detector pre/post-processing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f64,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn to_frame(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.pad_x as f64) / self.scale,
            (y - self.pad_y as f64) / self.scale,
        )
    }
}

/// Letterbox-resize a frame to `target_size` x `target_size`, NCHW float32.
fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, Letterbox) {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = ((fw * scale).round() as u32).min(target_size);
    let new_h = ((fh * scale).round() as u32).min(target_size);
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    // 114 gray padding, YOLO convention
    let gray = 114.0f32 / 255.0;
    let size = target_size as usize;
    let mut tensor = ndarray::Array4::<f32>::from_elem((1, 3, size, size), gray);

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;

    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    bbox: BoundingBox,
    confidence: f32,
}

/// Decodes `[1, features, boxes]` or `[1, boxes, features]` predictions
/// whose rows start `[cx, cy, w, h, conf, ...]`.
fn decode_predictions(
    data: &[f32],
    shape: &[usize],
    confidence: f32,
    letterbox: &Letterbox,
) -> Result<Vec<Candidate>, ModelError> {
    if shape.len() != 3 {
        return Err(ModelError::InvalidOutput(format!(
            "unexpected detector output shape {shape:?}"
        )));
    }
    let transposed = shape[1] < shape[2];
    let (num_boxes, num_feats) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if num_feats < 5 || data.len() < num_boxes * num_feats {
        return Err(ModelError::InvalidOutput(format!(
            "detector output too small for shape {shape:?}"
        )));
    }

    let at = |i: usize, f: usize| {
        if transposed {
            data[f * num_boxes + i]
        } else {
            data[i * num_feats + f]
        }
    };

    let mut candidates = Vec::new();
    for i in 0..num_boxes {
        let conf = at(i, 4);
        if conf < confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(i, 0) as f64, at(i, 1) as f64, at(i, 2) as f64, at(i, 3) as f64);
        let (x1, y1) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);
        candidates.push(Candidate {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: conf.clamp(0.0, 1.0),
        });
    }
    Ok(candidates)
}

/// Greedy NMS: highest confidence first, drop boxes overlapping a kept one.
fn nms(candidates: &mut [Candidate], iou_thresh: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates.iter() {
        if keep.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_thresh) {
            keep.push(candidate.clone());
        }
    }
    keep
}

fn area(bbox: &BoundingBox) -> f64 {
    bbox.width() * bbox.height()
}

/// Quality gate: faces larger than `min_area`, most confident first (larger
/// first on ties), at most `max_faces`.
fn select_faces(candidates: Vec<Candidate>, min_area: f64, max_faces: usize) -> Vec<Candidate> {
    let mut faces: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| area(&c.bbox) > min_area)
        .collect();
    faces.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| area(&b.bbox).total_cmp(&area(&a.bbox)))
    });
    faces.truncate(max_faces);
    faces
}

// ---------------------------------------------------------------------------
// Embedder preprocessing
// ---------------------------------------------------------------------------

struct FaceCrop {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

/// Copies the part of `bbox` inside the frame. `None` if the visible part
/// is too small to embed.
fn crop_face(frame: &Frame, bbox: &BoundingBox) -> Option<FaceCrop> {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let x1 = bbox.x1.clamp(0.0, fw);
    let y1 = bbox.y1.clamp(0.0, fh);
    let x2 = bbox.x2.clamp(0.0, fw);
    let y2 = bbox.y2.clamp(0.0, fh);
    if x2 - x1 < MIN_FACE_PIXELS || y2 - y1 < MIN_FACE_PIXELS {
        return None;
    }

    let (x1, y1, x2, y2) = (x1 as usize, y1 as usize, x2 as usize, y2 as usize);
    let view = frame.as_ndarray();
    let crop = view.slice(ndarray::s![y1..y2, x1..x2, 0..3]);
    Some(FaceCrop {
        data: crop.iter().copied().collect(),
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// Resize crop to 112x112, normalize to `[-1, 1]`, NCHW layout.
fn preprocess_face(face: &FaceCrop) -> ndarray::Array4<f32> {
    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE));
    let step_y = face.height as f64 / EMBED_INPUT_SIZE as f64;
    let step_x = face.width as f64 / EMBED_INPUT_SIZE as f64;

    for y in 0..EMBED_INPUT_SIZE {
        let src_y = (((y as f64 + 0.5) * step_y) as usize).min(face.height - 1);
        for x in 0..EMBED_INPUT_SIZE {
            let src_x = (((x as f64 + 0.5) * step_x) as usize).min(face.width - 1);
            let offset = (src_y * face.width + src_x) * 3;
            for c in 0..3 {
                tensor[[0, c, y, x]] = (face.data[offset + c] as f32 - NORM_MEAN) / NORM_STD;
            }
        }
    }
    tensor
}
