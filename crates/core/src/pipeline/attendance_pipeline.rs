use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use thiserror::Error;

use crate::attendance::domain::attendance_gate::AttendanceGate;
use crate::attendance::domain::attendance_recorder::AttendanceRecorder;
use crate::detection::domain::face_model::{FaceModel, SharedModel};
use crate::pipeline::frame_result::{FrameResult, ResultCallback};
use crate::pipeline::infrastructure::stage_workers::{
    self, DeferredRelease, ProcessStage, RunState, SinkStage,
};
use crate::pipeline::pipeline_config::{CameraConfig, ConfigError, PipelineSettings};
use crate::pipeline::pipeline_logger::{PipelineLogger, StdoutPipelineLogger};
use crate::pipeline::pipeline_stats::{Stage, StatsSnapshot};
use crate::recognition::domain::gallery_matcher::GalleryMatcher;
use crate::recognition::domain::gallery_source::{GalleryLoadError, GallerySource};
use crate::recognition::domain::recognition_stabilizer::RecognitionStabilizer;
use crate::shared::bounded_queue::DropOldestQueue;
use crate::shared::frame::Frame;
use crate::tracking::domain::track_manager::TrackManager;
use crate::video::domain::video_reader::{SharedReader, SourceError, VideoReader};
use crate::video::frame_source::FrameSource;

const WORKER_COUNT: usize = 3;

/// Frames between periodic timing summaries of the default logger.
const LOG_THROTTLE_FRAMES: u64 = 300;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("gallery unavailable: {0}")]
    GalleryUnavailable(#[source] GalleryLoadError),
    #[error("video source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),
    #[error("failed to spawn {stage} worker: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// The external collaborators a pipeline drives.
pub struct PipelineComponents {
    pub reader: Box<dyn VideoReader>,
    pub model: Box<dyn FaceModel>,
    pub gallery: Arc<dyn GallerySource>,
    pub recorder: Arc<dyn AttendanceRecorder>,
}

/// Control-surface view of a pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub is_running: bool,
    pub camera_id: Option<String>,
    pub class_id: Option<String>,
    pub total_tracked: usize,
    pub gallery_size: usize,
    pub stats: StatsSnapshot,
    pub last_error: Option<String>,
}

pub type LoggerFactory = Box<dyn Fn(&str) -> Box<dyn PipelineLogger> + Send>;

struct ActiveRun {
    workers: Vec<(Stage, JoinHandle<()>)>,
    done_rx: Receiver<Stage>,
}

fn spawn_failed(stage: &'static str) -> impl FnOnce(std::io::Error) -> StartError {
    move |source| StartError::Spawn { stage, source }
}

impl ActiveRun {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &mut self,
        source: FrameSource,
        processor: ProcessStage,
        sink: SinkStage,
        frames: DropOldestQueue<Frame>,
        results: DropOldestQueue<FrameResult>,
        poll: Duration,
        state: Arc<RunState>,
        done_tx: Sender<Stage>,
    ) -> Result<(), StartError> {
        let capture =
            stage_workers::spawn_capture(source, frames.clone(), state.clone(), done_tx.clone())
                .map_err(spawn_failed("capture"))?;
        self.workers.push((Stage::Capture, capture));

        let process = stage_workers::spawn_processor(
            processor,
            frames,
            results.clone(),
            poll,
            state.clone(),
            done_tx.clone(),
        )
        .map_err(spawn_failed("process"))?;
        self.workers.push((Stage::Process, process));

        let output = stage_workers::spawn_sink(sink, results, poll, state, done_tx)
            .map_err(spawn_failed("output"))?;
        self.workers.push((Stage::Output, output));
        Ok(())
    }
}

/// Capture → process → output pipeline for one camera.
///
/// `start` spins up one worker per stage connected by drop-oldest queues;
/// `stop` signals them, waits up to the configured join timeout and then
/// releases the reader and model. A stopped pipeline can be started again
/// and keeps its gallery snapshot across runs.
pub struct AttendancePipeline {
    settings: PipelineSettings,
    reader: SharedReader,
    model: SharedModel,
    gallery_source: Arc<dyn GallerySource>,
    recorder: Arc<dyn AttendanceRecorder>,
    on_result: Option<ResultCallback>,
    logger_factory: LoggerFactory,
    matcher: Option<Arc<GalleryMatcher>>,
    camera: Option<CameraConfig>,
    state: Arc<RunState>,
    run: Option<ActiveRun>,
}

impl AttendancePipeline {
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        Self {
            settings,
            reader: Arc::new(Mutex::new(components.reader)),
            model: Arc::new(Mutex::new(components.model)),
            gallery_source: components.gallery,
            recorder: components.recorder,
            on_result: None,
            logger_factory: Box::new(|label: &str| -> Box<dyn PipelineLogger> {
                Box::new(StdoutPipelineLogger::new(label, LOG_THROTTLE_FRAMES))
            }),
            matcher: None,
            camera: None,
            state: Arc::new(RunState::new()),
            run: None,
        }
    }

    /// Observer called from the output worker with every frame result.
    pub fn on_result(mut self, callback: ResultCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    /// Builds the processing worker's logger from the camera id.
    pub fn with_logger_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Box<dyn PipelineLogger> + Send + 'static,
    {
        self.logger_factory = Box::new(factory);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn start(&mut self, camera: CameraConfig) -> Result<(), StartError> {
        if self.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        if self.run.is_some() {
            // Previous run ended on its own (source finished or failed).
            self.stop();
        }

        self.settings.validate()?;
        camera.validate()?;
        let matcher = self.load_matcher()?;
        // A worker detached by the previous stop must not close the handles
        // this run is about to reopen.
        self.state.reader_release.reclaim();
        self.state.model_release.reclaim();

        let state = Arc::new(RunState::new());
        let mut source = FrameSource::new(
            self.reader.clone(),
            camera.source.clone(),
            self.settings.capture_settings(),
        );
        source
            .start(&state.stop)
            .map_err(StartError::SourceUnavailable)?;

        let frames = DropOldestQueue::new(self.settings.queue_capacity);
        let results = DropOldestQueue::new(self.settings.queue_capacity);
        let poll = self.settings.poll_timeout();

        let processor = ProcessStage::new(
            self.model.clone(),
            TrackManager::new(
                self.settings.track_base_distance,
                self.settings.track_timeout_frames,
            ),
            RecognitionStabilizer::new(matcher.clone(), self.settings.stabilizer_settings()),
            camera.detection_area,
            (self.logger_factory)(&camera.camera_id),
        );
        let sink = SinkStage::new(
            AttendanceGate::new(self.recorder.clone(), camera.cooldown(&self.settings)),
            matcher,
            camera.camera_id.clone(),
            camera.ma_lop.clone(),
            self.on_result.clone(),
        );

        log::info!(
            "Starting pipeline for camera {} (class {}) on {}",
            camera.camera_id,
            camera.ma_lop,
            camera.source
        );
        let (done_tx, done_rx) = crossbeam_channel::bounded(WORKER_COUNT);
        self.state = state.clone();
        self.camera = Some(camera);
        let run = self.run.insert(ActiveRun {
            workers: Vec::with_capacity(WORKER_COUNT),
            done_rx,
        });

        if let Err(e) = run.spawn(source, processor, sink, frames, results, poll, state, done_tx) {
            log::error!("{e}");
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Signals every worker, waits up to the join timeout, then releases
    /// the reader and model.
    ///
    /// Returns `false` if a worker missed the deadline or panicked.
    /// Safe to call repeatedly; `Drop` calls it too.
    pub fn stop(&mut self) -> bool {
        let Some(run) = self.run.take() else {
            return true;
        };
        self.state.request_stop();

        let timeout = self.settings.join_timeout();
        let deadline = Instant::now() + timeout;
        let mut finished = Vec::with_capacity(run.workers.len());
        while finished.len() < run.workers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match run.done_rx.recv_timeout(remaining) {
                Ok(stage) => finished.push(stage),
                Err(_) => break,
            }
        }

        let mut clean = true;
        for (stage, handle) in run.workers {
            if !finished.contains(&stage) {
                log::warn!("{stage:?} worker did not stop within {timeout:?}; detaching it");
                clean = false;
                continue;
            }
            if handle.join().is_err() {
                log::error!("{stage:?} worker panicked");
                clean = false;
            }
        }

        self.release_resources();
        if let Some(camera) = &self.camera {
            log::info!("Pipeline stopped for camera {}", camera.camera_id);
        }
        clean
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
            && !self.state.is_stopping()
            && self.state.active_workers.load(Ordering::Acquire) > 0
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            is_running: self.is_running(),
            camera_id: self.camera.as_ref().map(|c| c.camera_id.clone()),
            class_id: self.camera.as_ref().map(|c| c.ma_lop.clone()),
            total_tracked: self.state.total_tracked.load(Ordering::Relaxed),
            gallery_size: self.matcher.as_ref().map_or(0, |m| m.len()),
            stats: self.state.stats.snapshot(),
            last_error: self.state.last_error(),
        }
    }

    /// Forces a gallery reload at the next refresh check.
    pub fn request_gallery_refresh(&self) {
        if let Some(matcher) = &self.matcher {
            matcher.request_refresh();
        }
    }

    fn load_matcher(&mut self) -> Result<Arc<GalleryMatcher>, StartError> {
        if let Some(matcher) = &self.matcher {
            matcher.request_refresh();
            return Ok(matcher.clone());
        }
        let matcher = Arc::new(
            GalleryMatcher::load(
                self.gallery_source.clone(),
                self.settings.recognition_threshold,
                self.settings.gallery_ttl(),
            )
            .map_err(StartError::GalleryUnavailable)?,
        );
        self.matcher = Some(matcher.clone());
        Ok(matcher)
    }

    /// Closes the reader and releases the model. A handle still held by a
    /// detached worker is released by that worker when it exits.
    fn release_resources(&self) {
        release_or_defer(&*self.reader, &self.state.reader_release, "Video reader", |reader| {
            reader.close()
        });
        release_or_defer(&*self.model, &self.state.model_release, "Face model", |model| {
            model.release()
        });
    }
}

fn release_or_defer<T: ?Sized>(
    resource: &Mutex<Box<T>>,
    handoff: &DeferredRelease,
    what: &str,
    release: impl FnOnce(&mut T),
) {
    match resource.try_lock() {
        Ok(mut held) => release(&mut **held),
        Err(TryLockError::Poisoned(poisoned)) => release(&mut **poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => {
            if handoff.defer() {
                release(&mut **resource.lock().unwrap_or_else(PoisonError::into_inner));
            } else {
                log::warn!("{what} still busy; its worker releases it on exit");
            }
        }
    }
}

impl Drop for AttendancePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
