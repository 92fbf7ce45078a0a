use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;

use faceattend_core::attendance::domain::attendance_recorder::AttendanceRecorder;
use faceattend_core::attendance::infrastructure::http_attendance_recorder::HttpAttendanceRecorder;
use faceattend_core::attendance::infrastructure::log_attendance_recorder::LogAttendanceRecorder;
use faceattend_core::detection::domain::face_model::FaceModel;
use faceattend_core::detection::infrastructure::onnx_face_model::OnnxFaceModel;
use faceattend_core::detection::infrastructure::replay_face_model::ReplayFaceModel;
use faceattend_core::pipeline::attendance_pipeline::{AttendancePipeline, PipelineComponents};
use faceattend_core::pipeline::frame_result::FrameResult;
use faceattend_core::pipeline::pipeline_config::{CameraConfig, PipelineSettings};
use faceattend_core::recognition::domain::gallery_source::GallerySource;
use faceattend_core::recognition::infrastructure::http_gallery_source::HttpGallerySource;
use faceattend_core::recognition::infrastructure::json_gallery_source::JsonGallerySource;
use faceattend_core::shared::constants::{
    DETECTOR_MODEL_NAME, DETECTOR_MODEL_URL, EMBEDDING_MODEL_NAME, EMBEDDING_MODEL_URL,
};
use faceattend_core::shared::model_resolver;
use faceattend_core::shared::region::DetectionArea;
use faceattend_core::video::domain::video_reader::VideoSource;
use faceattend_core::video::infrastructure::ffmpeg_reader::FfmpegReader;

const CONTROL_TICK: Duration = Duration::from_millis(100);

/// Real-time face attendance for one camera.
#[derive(Parser)]
#[command(name = "faceattend")]
struct Cli {
    /// Camera config JSON (camera_id, source, ma_lop, detection_area, cooldown_seconds).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pipeline settings JSON; unspecified fields keep their defaults.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Camera identifier reported with each attendance record.
    #[arg(long)]
    camera_id: Option<String>,

    /// Webcam index, stream URL or video file.
    #[arg(long)]
    source: Option<String>,

    /// Class the attendance is filed under.
    #[arg(long)]
    class_id: Option<String>,

    /// Restrict detection to x,y,width,height.
    #[arg(long, value_delimiter = ',')]
    detection_area: Option<Vec<u32>>,

    /// Seconds before the same student can be recorded again.
    #[arg(long)]
    cooldown_seconds: Option<u64>,

    /// Minimum cosine similarity for a gallery match (0.0-1.0).
    #[arg(long)]
    recognition_threshold: Option<f32>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long)]
    confidence: Option<f32>,

    /// Directory of <student_id>.json embedding records.
    #[arg(long)]
    gallery_dir: Option<PathBuf>,

    /// Attendance backend base URL (gallery listing and attendance records).
    #[arg(long)]
    backend_url: Option<String>,

    /// Log attendance instead of posting it to the backend.
    #[arg(long)]
    dry_run: bool,

    /// Directory checked for model files before the download cache.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Replay scripted detections from JSON instead of running the ONNX models.
    #[arg(long)]
    replay_detections: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise).
    #[arg(long)]
    duration: Option<u64>,

    /// Seconds between status reports.
    #[arg(long, default_value = "10")]
    status_interval: u64,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;

    let settings = build_settings(&cli)?;
    let camera = build_camera(&cli)?;

    let components = PipelineComponents {
        reader: Box::new(FfmpegReader::new()),
        model: build_model(&cli, &settings)?,
        gallery: build_gallery(&cli, &settings)?,
        recorder: build_recorder(&cli, &settings)?,
    };

    let mut pipeline =
        AttendancePipeline::new(components, settings).on_result(Arc::new(confirmation_logger()));
    pipeline.start(camera)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    supervise(&pipeline, &cli, &interrupted);

    let clean = pipeline.stop();
    let status = pipeline.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !clean {
        log::warn!("Some workers did not shut down cleanly");
    }
    match status.last_error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// Blocks until Ctrl-C, the optional duration elapses, or the pipeline
/// stops on its own, logging status periodically.
fn supervise(pipeline: &AttendancePipeline, cli: &Cli, interrupted: &AtomicBool) {
    let started = Instant::now();
    let deadline = cli.duration.map(|secs| started + Duration::from_secs(secs));
    let interval = Duration::from_secs(cli.status_interval.max(1));
    let mut next_report = started + interval;

    loop {
        std::thread::sleep(CONTROL_TICK);
        let now = Instant::now();
        if interrupted.load(Ordering::SeqCst) {
            log::info!("Interrupted; stopping");
            break;
        }
        if deadline.is_some_and(|d| now >= d) {
            log::info!("Duration elapsed; stopping");
            break;
        }
        if !pipeline.is_running() {
            log::info!("Pipeline finished");
            break;
        }
        if now >= next_report {
            next_report = now + interval;
            match serde_json::to_string(&pipeline.status()) {
                Ok(json) => log::info!("Status: {json}"),
                Err(e) => log::warn!("Failed to serialize status: {e}"),
            }
        }
    }
}

/// Remembered (track, student) pairs before the set is reset.
const ANNOUNCED_CAPACITY: usize = 4096;

/// Logs each (track, student) confirmation once.
fn confirmation_logger() -> impl Fn(&FrameResult) + Send + Sync {
    let announced: Mutex<HashSet<(u32, String)>> = Mutex::new(HashSet::new());
    move |result: &FrameResult| {
        let mut announced = match announced.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if announced.len() >= ANNOUNCED_CAPACITY {
            announced.clear();
        }
        for (track_id, student_id, confidence) in result.confirmed() {
            if announced.insert((track_id, student_id.to_string())) {
                log::info!(
                    "Frame {}: track {track_id} is {student_id} ({confidence:.2})",
                    result.sequence
                );
            }
        }
    }
}

fn build_settings(cli: &Cli) -> Result<PipelineSettings, Box<dyn std::error::Error>> {
    let mut settings = match &cli.settings {
        Some(path) => PipelineSettings::from_json_file(path)?,
        None => PipelineSettings::default(),
    };
    if let Some(threshold) = cli.recognition_threshold {
        settings.recognition_threshold = threshold;
    }
    if let Some(confidence) = cli.confidence {
        settings.detector_confidence = confidence;
    }
    if let Some(cooldown) = cli.cooldown_seconds {
        settings.cooldown_seconds = cooldown;
    }
    settings.validate()?;
    Ok(settings)
}

fn build_camera(cli: &Cli) -> Result<CameraConfig, Box<dyn std::error::Error>> {
    let mut camera = match &cli.config {
        Some(path) => CameraConfig::from_json_file(path)?,
        None => CameraConfig {
            camera_id: required(&cli.camera_id, "--camera-id")?,
            source: VideoSource::parse(&required(&cli.source, "--source")?),
            ma_lop: required(&cli.class_id, "--class-id")?,
            detection_area: None,
            cooldown_seconds: None,
        },
    };
    if let Some(id) = &cli.camera_id {
        camera.camera_id = id.clone();
    }
    if let Some(source) = &cli.source {
        camera.source = VideoSource::parse(source);
    }
    if let Some(class_id) = &cli.class_id {
        camera.ma_lop = class_id.clone();
    }
    if let Some(area) = &cli.detection_area {
        camera.detection_area = Some(DetectionArea {
            x: area[0],
            y: area[1],
            width: area[2],
            height: area[3],
        });
    }
    if let Some(cooldown) = cli.cooldown_seconds {
        camera.cooldown_seconds = Some(cooldown);
    }
    camera.validate()?;
    Ok(camera)
}

fn required(value: &Option<String>, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
    value
        .clone()
        .ok_or_else(|| format!("{flag} is required without --config").into())
}

fn build_model(
    cli: &Cli,
    settings: &PipelineSettings,
) -> Result<Box<dyn FaceModel>, Box<dyn std::error::Error>> {
    if let Some(script) = &cli.replay_detections {
        log::info!("Replaying detections from {}", script.display());
        return Ok(Box::new(ReplayFaceModel::from_json_file(script)?));
    }

    let model_dir = cli.model_dir.as_deref();
    let detector = resolve_model(DETECTOR_MODEL_NAME, DETECTOR_MODEL_URL, model_dir)?;
    let embedder = resolve_model(EMBEDDING_MODEL_NAME, EMBEDDING_MODEL_URL, model_dir)?;
    let model = OnnxFaceModel::new(&detector, &embedder, settings.detector_confidence)?
        .with_face_limits(settings.min_face_area, settings.max_faces_per_frame);
    Ok(Box::new(model))
}

fn resolve_model(
    name: &'static str,
    url: &str,
    model_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    log::info!("Resolving model: {name}");
    let progress: model_resolver::ProgressFn =
        Box::new(move |downloaded, total| download_progress(name, downloaded, total));
    let path = model_resolver::resolve(name, url, model_dir, Some(progress))?;
    eprintln!();
    Ok(path)
}

fn build_gallery(
    cli: &Cli,
    settings: &PipelineSettings,
) -> Result<Arc<dyn GallerySource>, Box<dyn std::error::Error>> {
    if let Some(dir) = &cli.gallery_dir {
        return Ok(Arc::new(JsonGallerySource::new(dir)));
    }
    match &cli.backend_url {
        Some(url) => Ok(Arc::new(HttpGallerySource::new(url, settings.http_timeout())?)),
        None => Err("either --gallery-dir or --backend-url is required".into()),
    }
}

fn build_recorder(
    cli: &Cli,
    settings: &PipelineSettings,
) -> Result<Arc<dyn AttendanceRecorder>, Box<dyn std::error::Error>> {
    if cli.dry_run {
        return Ok(Arc::new(LogAttendanceRecorder::new()));
    }
    match &cli.backend_url {
        Some(url) => Ok(Arc::new(HttpAttendanceRecorder::new(url, settings.http_timeout())?)),
        None => Err("--backend-url is required unless --dry-run is used".into()),
    }
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(config) = &cli.config {
        if !config.exists() {
            return Err(format!("Camera config not found: {}", config.display()).into());
        }
    }
    if let Some(dir) = &cli.gallery_dir {
        if !dir.is_dir() {
            return Err(format!("Gallery directory not found: {}", dir.display()).into());
        }
    }
    if let Some(threshold) = cli.recognition_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!(
                "Recognition threshold must be between 0.0 and 1.0, got {threshold}"
            )
            .into());
        }
    }
    if let Some(confidence) = cli.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!(
                "Confidence must be between 0.0 and 1.0, got {confidence}"
            )
            .into());
        }
    }
    if let Some(area) = &cli.detection_area {
        if area.len() != 4 {
            return Err("--detection-area takes exactly x,y,width,height".into());
        }
    }
    if cli.duration == Some(0) {
        return Err("Duration must be positive".into());
    }
    Ok(())
}

fn download_progress(name: &str, downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading {name}... {pct}%");
    } else {
        eprint!("\rDownloading {name}... {downloaded} bytes");
    }
}
