use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::attendance::domain::attendance_gate::{AttendanceGate, GateOutcome};
use crate::detection::domain::face_model::{Detection, ModelError, SharedModel};
use crate::pipeline::frame_result::{FrameResult, ResultCallback, TrackReport};
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::pipeline::pipeline_stats::{FpsMeter, PipelineStats, Stage};
use crate::recognition::domain::gallery_matcher::{GalleryMatcher, RefreshOutcome};
use crate::recognition::domain::recognition_stabilizer::{Decision, RecognitionStabilizer};
use crate::shared::bounded_queue::DropOldestQueue;
use crate::shared::frame::Frame;
use crate::shared::region::DetectionArea;
use crate::tracking::domain::track_manager::TrackManager;
use crate::video::frame_source::FrameSource;

/// State shared by the three workers of one run and the orchestrator.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub stats: PipelineStats,
    pub stop: AtomicBool,
    pub capture_done: AtomicBool,
    pub process_done: AtomicBool,
    pub active_workers: AtomicUsize,
    pub total_tracked: AtomicUsize,
    pub reader_release: DeferredRelease,
    pub model_release: DeferredRelease,
    last_error: Mutex<Option<String>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Records a fatal worker error and asks every worker to stop.
    pub fn fail(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.request_stop();
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    #[default]
    Held,
    Deferred,
    Exited,
}

/// Hands the release of a reader or model from the orchestrator to a worker
/// that missed the join deadline while holding it.
#[derive(Debug, Default)]
pub(crate) struct DeferredRelease(Mutex<Handoff>);

impl DeferredRelease {
    fn handoff(&self) -> std::sync::MutexGuard<'_, Handoff> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker side: runs `release` if the orchestrator deferred to it.
    pub fn worker_exit(&self, release: impl FnOnce()) {
        let mut handoff = self.handoff();
        if *handoff == Handoff::Deferred {
            release();
        }
        *handoff = Handoff::Exited;
    }

    /// Orchestrator side, when the resource is busy. Returns `true` if the
    /// worker has already exited and the caller must release it instead.
    pub fn defer(&self) -> bool {
        let mut handoff = self.handoff();
        if *handoff == Handoff::Exited {
            return true;
        }
        *handoff = Handoff::Deferred;
        false
    }

    /// Takes a pending release back before a new run reopens the resource.
    pub fn reclaim(&self) {
        let mut handoff = self.handoff();
        if *handoff == Handoff::Deferred {
            *handoff = Handoff::Held;
        }
    }
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// Marks a worker finished however its thread exits, panics included.
struct WorkerGuard {
    stage: Stage,
    state: Arc<RunState>,
    done_tx: Sender<Stage>,
    on_exit: Option<ExitHook>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.on_exit.take() {
            hook();
        }
        match self.stage {
            Stage::Capture => self.state.capture_done.store(true, Ordering::Release),
            Stage::Process => self.state.process_done.store(true, Ordering::Release),
            Stage::Output => {}
        }
        self.state.active_workers.fetch_sub(1, Ordering::AcqRel);
        let _ = self.done_tx.try_send(self.stage);
    }
}

fn spawn_worker<F>(
    name: &str,
    stage: Stage,
    state: Arc<RunState>,
    done_tx: Sender<Stage>,
    on_exit: Option<ExitHook>,
    body: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    state.active_workers.fetch_add(1, Ordering::AcqRel);
    let guard_state = state.clone();
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _guard = WorkerGuard {
                stage,
                state: guard_state,
                done_tx,
                on_exit,
            };
            body();
        });
    if spawned.is_err() {
        state.active_workers.fetch_sub(1, Ordering::AcqRel);
    }
    spawned
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Detection, tracking and recognition for one frame at a time.
pub(crate) struct ProcessStage {
    model: SharedModel,
    tracker: TrackManager,
    stabilizer: RecognitionStabilizer,
    detection_area: Option<DetectionArea>,
    logger: Box<dyn PipelineLogger>,
    area_warned: bool,
}

impl ProcessStage {
    pub fn new(
        model: SharedModel,
        tracker: TrackManager,
        stabilizer: RecognitionStabilizer,
        detection_area: Option<DetectionArea>,
        logger: Box<dyn PipelineLogger>,
    ) -> Self {
        Self {
            model,
            tracker,
            stabilizer,
            detection_area,
            logger,
            area_warned: false,
        }
    }

    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    pub fn process(&mut self, frame: &Frame, stats: &PipelineStats) -> FrameResult {
        let now = frame.captured_at();

        let started = Instant::now();
        let detections = self.detect(frame, stats);
        self.logger.timing("detect", elapsed_ms(started));
        stats.inc(&stats.frames_processed);
        stats.add(&stats.faces_detected, detections.len() as u64);
        self.logger.metric("faces_per_frame", detections.len() as f64);

        let started = Instant::now();
        let update = self.tracker.update(&detections, now);
        for track in &update.pruned {
            self.stabilizer.discard(track.id);
        }
        self.logger.timing("track", elapsed_ms(started));

        let started = Instant::now();
        let mut tracks = Vec::with_capacity(update.tracks.len());
        for track in update.tracks.values() {
            let matched = track.detection_index.and_then(|i| detections.get(i));
            let decision = match matched {
                Some(detection) => {
                    stats.inc(&stats.recognitions);
                    let decision = self.stabilizer.observe(track.id, &detection.embedding, now);
                    if matches!(decision, Decision::Confirmed { .. }) {
                        stats.inc(&stats.confirmed_recognitions);
                    }
                    Some(decision)
                }
                None => None,
            };
            tracks.push(TrackReport {
                track_id: track.id,
                bbox: track.bbox,
                state: track.state,
                confidence: matched.map(|d| d.confidence),
                decision,
            });
        }
        self.logger.timing("recognize", elapsed_ms(started));
        self.logger.frame_processed();

        FrameResult {
            sequence: frame.sequence(),
            captured_at: now,
            tracks,
        }
    }

    /// Runs the model on the frame, or on the detection area when one is
    /// configured, returning detections in full-frame coordinates.
    ///
    /// Model failures yield no detections for the frame.
    fn detect(&mut self, frame: &Frame, stats: &PipelineStats) -> Vec<Detection> {
        let (cropped, dx, dy) = match &self.detection_area {
            None => (None, 0.0, 0.0),
            Some(area) => match frame.crop(area) {
                Some(crop) => (Some(crop), area.x as f64, area.y as f64),
                None => {
                    if !self.area_warned {
                        log::warn!(
                            "Detection area {area:?} lies outside the {}x{} frame; no faces will be detected",
                            frame.width(),
                            frame.height()
                        );
                        self.area_warned = true;
                    }
                    return Vec::new();
                }
            },
        };
        let input = cropped.as_ref().unwrap_or(frame);

        let detected = match self.model.lock() {
            Ok(mut model) => model.detect(input),
            Err(_) => Err(ModelError::Inference("model lock poisoned".into())),
        };
        match detected {
            Ok(detections) => detections.into_iter().map(|d| d.offset(dx, dy)).collect(),
            Err(e) => {
                stats.inc(&stats.model_failures);
                log::warn!("Detection failed on frame {}: {e}", frame.sequence());
                Vec::new()
            }
        }
    }
}

/// Output side effects: attendance, result observers and gallery upkeep.
pub(crate) struct SinkStage {
    gate: AttendanceGate,
    matcher: Arc<GalleryMatcher>,
    camera_id: String,
    class_id: String,
    on_result: Option<ResultCallback>,
}

impl SinkStage {
    pub fn new(
        gate: AttendanceGate,
        matcher: Arc<GalleryMatcher>,
        camera_id: String,
        class_id: String,
        on_result: Option<ResultCallback>,
    ) -> Self {
        Self {
            gate,
            matcher,
            camera_id,
            class_id,
            on_result,
        }
    }

    pub fn handle(&self, result: &FrameResult, stats: &PipelineStats) {
        for (track_id, student_id, confidence) in result.confirmed() {
            let outcome =
                self.gate
                    .check_and_record(student_id, &self.class_id, &self.camera_id, Instant::now());
            match outcome {
                GateOutcome::Recorded => {
                    log::debug!("Track {track_id} confirmed {student_id} at {confidence:.3}");
                    stats.inc(&stats.attendance_recorded);
                }
                GateOutcome::CoolingDown => stats.inc(&stats.cooldown_suppressed),
                GateOutcome::Failed(_) => stats.inc(&stats.attendance_failures),
            }
        }
        if let Some(callback) = &self.on_result {
            callback(result);
        }
        stats.inc(&stats.results_handled);
    }

    pub fn refresh_gallery(&self, stats: &PipelineStats) {
        match self.matcher.maybe_refresh(Instant::now()) {
            RefreshOutcome::Skipped => {}
            RefreshOutcome::Refreshed { .. } => stats.inc(&stats.gallery_refreshes),
            RefreshOutcome::Failed(_) => stats.inc(&stats.gallery_refresh_failures),
        }
    }
}

pub(crate) fn spawn_capture(
    mut source: FrameSource,
    frames: DropOldestQueue<Frame>,
    state: Arc<RunState>,
    done_tx: Sender<Stage>,
) -> std::io::Result<JoinHandle<()>> {
    let worker = state.clone();
    let reader = source.reader().clone();
    let release_state = state.clone();
    let on_exit: ExitHook = Box::new(move || {
        release_state.reader_release.worker_exit(|| {
            reader.lock().unwrap_or_else(PoisonError::into_inner).close();
            log::info!("Video reader closed by exiting capture worker");
        });
    });
    spawn_worker("capture", Stage::Capture, state, done_tx, Some(on_exit), move || {
        if let Err(e) = source.capture_loop(&frames, &worker.stop, &worker.stats) {
            log::error!("Capture stopped: {e}");
            worker.fail(e.to_string());
        }
    })
}

pub(crate) fn spawn_processor(
    mut stage: ProcessStage,
    frames: DropOldestQueue<Frame>,
    results: DropOldestQueue<FrameResult>,
    poll: Duration,
    state: Arc<RunState>,
    done_tx: Sender<Stage>,
) -> std::io::Result<JoinHandle<()>> {
    let worker = state.clone();
    let model = stage.model.clone();
    let release_state = state.clone();
    let on_exit: ExitHook = Box::new(move || {
        release_state.model_release.worker_exit(|| {
            model.lock().unwrap_or_else(PoisonError::into_inner).release();
            log::info!("Face model released by exiting process worker");
        });
    });
    spawn_worker("process", Stage::Process, state, done_tx, Some(on_exit), move || {
        let stats = &worker.stats;
        let mut meter = FpsMeter::new(Instant::now());
        while !worker.is_stopping() {
            let Some(frame) = frames.pop_timeout(poll) else {
                if worker.capture_done.load(Ordering::Acquire) && frames.is_empty() {
                    break;
                }
                continue;
            };
            stage.logger.metric("frame_queue_depth", frames.len() as f64);

            let result = stage.process(&frame, stats);
            worker.total_tracked.store(stage.tracked(), Ordering::Relaxed);
            stats.add(&stats.results_dropped, results.push(result) as u64);
            if let Some(fps) = meter.tick(Instant::now()) {
                stats.set_fps(Stage::Process, fps);
            }
        }
        stage.logger.summary();
    })
}

pub(crate) fn spawn_sink(
    stage: SinkStage,
    results: DropOldestQueue<FrameResult>,
    poll: Duration,
    state: Arc<RunState>,
    done_tx: Sender<Stage>,
) -> std::io::Result<JoinHandle<()>> {
    let worker = state.clone();
    spawn_worker("output", Stage::Output, state, done_tx, None, move || {
        let stats = &worker.stats;
        let mut meter = FpsMeter::new(Instant::now());
        while !worker.is_stopping() {
            match results.pop_timeout(poll) {
                Some(result) => {
                    stage.handle(&result, stats);
                    if let Some(fps) = meter.tick(Instant::now()) {
                        stats.set_fps(Stage::Output, fps);
                    }
                }
                None => {
                    if worker.process_done.load(Ordering::Acquire) && results.is_empty() {
                        break;
                    }
                }
            }
            stage.refresh_gallery(stats);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::attendance::domain::attendance_recorder::{
        AttendanceRecord, AttendanceRecorder, RecordError,
    };
    use crate::detection::domain::face_model::FaceModel;
    use crate::detection::infrastructure::replay_face_model::ReplayFaceModel;
    use crate::pipeline::pipeline_logger::NullPipelineLogger;
    use crate::recognition::domain::gallery_source::{GalleryLoadError, GallerySource, KnownFace};
    use crate::recognition::domain::recognition_stabilizer::StabilizerSettings;
    use crate::shared::embedding::Embedding;
    use crate::shared::region::BoundingBox;

    struct FixedSource;

    impl GallerySource for FixedSource {
        fn list_known_embeddings(&self) -> Result<Vec<KnownFace>, GalleryLoadError> {
            Ok(vec![KnownFace {
                student_id: "SV001".into(),
                name: None,
                embedding: vec![1.0, 0.0, 0.0],
            }])
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    #[derive(Default)]
    struct CountingRecorder {
        calls: AtomicU64,
    }

    impl AttendanceRecorder for CountingRecorder {
        fn record(&self, _record: &AttendanceRecord) -> Result<(), RecordError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingModel;

    impl FaceModel for FailingModel {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ModelError> {
            Err(ModelError::Inference("boom".into()))
        }
    }

    fn matcher() -> Arc<GalleryMatcher> {
        Arc::new(GalleryMatcher::load(Arc::new(FixedSource), 0.6, Duration::from_secs(300)).unwrap())
    }

    fn detection(x: f64, y: f64) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, x + 20.0, y + 20.0),
            embedding: Embedding::normalized(vec![1.0, 0.1, 0.0]).unwrap(),
            confidence: 0.9,
        }
    }

    fn stage(model: Box<dyn FaceModel>, area: Option<DetectionArea>) -> ProcessStage {
        ProcessStage::new(
            Arc::new(Mutex::new(model)),
            TrackManager::default(),
            RecognitionStabilizer::new(matcher(), StabilizerSettings::default()),
            area,
            Box::new(NullPipelineLogger),
        )
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0; 64 * 64 * 3], 64, 64, 3, 0).stamped(sequence, Instant::now())
    }

    #[test]
    fn test_process_confirms_after_enough_frames() {
        let model = ReplayFaceModel::repeating(vec![detection(10.0, 10.0)]);
        let mut stage = stage(Box::new(model), None);
        let stats = PipelineStats::new();

        let decisions: Vec<_> = (1..=4)
            .map(|seq| stage.process(&frame(seq), &stats).tracks[0].decision.clone())
            .collect();

        assert_eq!(decisions[0], Some(Decision::Unconfirmed));
        assert_eq!(decisions[1], Some(Decision::Unconfirmed));
        assert!(matches!(decisions[2], Some(Decision::Confirmed { ref student_id, .. }) if student_id == "SV001"));
        assert_eq!(stats.snapshot().confirmed_recognitions, 2);
        assert_eq!(stats.snapshot().recognitions, 4);
        assert_eq!(stage.tracked(), 1);
    }

    #[test]
    fn test_model_failure_yields_empty_frame() {
        let mut stage = stage(Box::new(FailingModel), None);
        let stats = PipelineStats::new();

        let result = stage.process(&frame(1), &stats);

        assert!(result.tracks.is_empty());
        assert_eq!(stats.snapshot().model_failures, 1);
        assert_eq!(stats.snapshot().frames_processed, 1);
    }

    #[test]
    fn test_detection_area_offsets_boxes_to_frame_coordinates() {
        let model = ReplayFaceModel::repeating(vec![detection(2.0, 3.0)]);
        let area = DetectionArea {
            x: 10,
            y: 20,
            width: 40,
            height: 40,
        };
        let mut stage = stage(Box::new(model), Some(area));
        let stats = PipelineStats::new();

        let result = stage.process(&frame(1), &stats);

        assert_eq!(result.tracks[0].bbox, BoundingBox::new(12.0, 23.0, 32.0, 43.0));
    }

    #[test]
    fn test_detection_area_outside_frame_detects_nothing() {
        let model = ReplayFaceModel::repeating(vec![detection(2.0, 3.0)]);
        let area = DetectionArea {
            x: 500,
            y: 500,
            width: 40,
            height: 40,
        };
        let mut stage = stage(Box::new(model), Some(area));
        let stats = PipelineStats::new();

        let result = stage.process(&frame(1), &stats);

        assert!(result.tracks.is_empty());
        assert_eq!(stats.snapshot().model_failures, 0);
    }

    #[test]
    fn test_sink_records_once_then_cools_down() {
        let recorder = Arc::new(CountingRecorder::default());
        let gate = AttendanceGate::new(recorder.clone(), Duration::from_secs(300));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let callback: ResultCallback = Arc::new(move |r: &FrameResult| {
            observed.lock().unwrap().push(r.sequence);
        });
        let sink = SinkStage::new(gate, matcher(), "cam-1".into(), "CS101".into(), Some(callback));
        let stats = PipelineStats::new();
        let confirmed = |sequence| FrameResult {
            sequence,
            captured_at: Instant::now(),
            tracks: vec![TrackReport {
                track_id: 1,
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                state: crate::tracking::domain::track::TrackState::Active,
                confidence: Some(0.9),
                decision: Some(Decision::Confirmed {
                    student_id: "SV001".into(),
                    confidence: 0.9,
                }),
            }],
        };

        sink.handle(&confirmed(1), &stats);
        sink.handle(&confirmed(2), &stats);

        let snapshot = stats.snapshot();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.attendance_recorded, 1);
        assert_eq!(snapshot.cooldown_suppressed, 1);
        assert_eq!(snapshot.results_handled, 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_guard_marks_worker_done_on_exit() {
        let state = Arc::new(RunState::new());
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let handle = spawn_worker("t", Stage::Capture, state.clone(), done_tx, None, || {}).unwrap();
        handle.join().unwrap();

        assert_eq!(done_rx.recv().unwrap(), Stage::Capture);
        assert!(state.capture_done.load(Ordering::Acquire));
        assert_eq!(state.active_workers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_pruned_track_drops_its_vote_buffer() {
        let script = HashMap::from([(1, vec![detection(10.0, 10.0)])]);
        let model = ReplayFaceModel::new(Arc::new(script));
        let mut stage = ProcessStage::new(
            Arc::new(Mutex::new(Box::new(model) as Box<dyn FaceModel>)),
            TrackManager::new(50.0, 0),
            RecognitionStabilizer::new(matcher(), StabilizerSettings::default()),
            None,
            Box::new(NullPipelineLogger),
        );
        let stats = PipelineStats::new();

        let first = stage.process(&frame(1), &stats);
        let track_id = first.tracks[0].track_id;
        assert_eq!(stage.stabilizer.buffer_len(track_id), 1);

        let second = stage.process(&frame(2), &stats);

        assert!(second.tracks.is_empty());
        assert_eq!(stage.tracked(), 0);
        assert_eq!(stage.stabilizer.buffer_len(track_id), 0);
    }

    #[test]
    fn test_deferred_release_runs_on_worker_exit() {
        let handoff = DeferredRelease::default();
        let mut released = false;

        assert!(!handoff.defer());
        handoff.worker_exit(|| released = true);

        assert!(released);
    }

    #[test]
    fn test_release_after_worker_exit_falls_to_caller() {
        let handoff = DeferredRelease::default();
        let mut released = false;

        handoff.worker_exit(|| released = true);

        assert!(!released);
        assert!(handoff.defer());
    }

    #[test]
    fn test_reclaimed_release_is_not_run_by_worker() {
        let handoff = DeferredRelease::default();
        let mut released = false;

        assert!(!handoff.defer());
        handoff.reclaim();
        handoff.worker_exit(|| released = true);

        assert!(!released);
    }

    #[test]
    fn test_fail_sets_error_and_stop() {
        let state = RunState::new();

        state.fail("camera gone".into());

        assert!(state.is_stopping());
        assert_eq!(state.last_error().as_deref(), Some("camera gone"));
    }
}
