use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Pipeline stage whose throughput is tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Process,
    Output,
}

/// Lock-free counters shared by every pipeline worker.
///
/// Workers bump counters with relaxed atomics; `snapshot` gives the control
/// surface a consistent-enough copy without stalling any stage.
#[derive(Debug)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub results_dropped: AtomicU64,
    pub frames_processed: AtomicU64,
    pub faces_detected: AtomicU64,
    pub recognitions: AtomicU64,
    pub confirmed_recognitions: AtomicU64,
    pub attendance_recorded: AtomicU64,
    pub attendance_failures: AtomicU64,
    pub cooldown_suppressed: AtomicU64,
    pub model_failures: AtomicU64,
    pub gallery_refreshes: AtomicU64,
    pub gallery_refresh_failures: AtomicU64,
    pub source_reconnects: AtomicU64,
    pub results_handled: AtomicU64,
    capture_fps: AtomicU64,
    process_fps: AtomicU64,
    output_fps: AtomicU64,
    started_at: Instant,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub results_dropped: u64,
    pub frames_processed: u64,
    pub faces_detected: u64,
    pub recognitions: u64,
    pub confirmed_recognitions: u64,
    pub attendance_recorded: u64,
    pub attendance_failures: u64,
    pub cooldown_suppressed: u64,
    pub model_failures: u64,
    pub gallery_refreshes: u64,
    pub gallery_refresh_failures: u64,
    pub source_reconnects: u64,
    pub results_handled: u64,
    pub capture_fps: f64,
    pub process_fps: f64,
    pub output_fps: f64,
    pub uptime_secs: f64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            results_dropped: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            faces_detected: AtomicU64::new(0),
            recognitions: AtomicU64::new(0),
            confirmed_recognitions: AtomicU64::new(0),
            attendance_recorded: AtomicU64::new(0),
            attendance_failures: AtomicU64::new(0),
            cooldown_suppressed: AtomicU64::new(0),
            model_failures: AtomicU64::new(0),
            gallery_refreshes: AtomicU64::new(0),
            gallery_refresh_failures: AtomicU64::new(0),
            source_reconnects: AtomicU64::new(0),
            results_handled: AtomicU64::new(0),
            capture_fps: AtomicU64::new(0f64.to_bits()),
            process_fps: AtomicU64::new(0f64.to_bits()),
            output_fps: AtomicU64::new(0f64.to_bits()),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_fps(&self, stage: Stage, fps: f64) {
        self.fps_slot(stage).store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self, stage: Stage) -> f64 {
        f64::from_bits(self.fps_slot(stage).load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_dropped: load(&self.frames_dropped),
            results_dropped: load(&self.results_dropped),
            frames_processed: load(&self.frames_processed),
            faces_detected: load(&self.faces_detected),
            recognitions: load(&self.recognitions),
            confirmed_recognitions: load(&self.confirmed_recognitions),
            attendance_recorded: load(&self.attendance_recorded),
            attendance_failures: load(&self.attendance_failures),
            cooldown_suppressed: load(&self.cooldown_suppressed),
            model_failures: load(&self.model_failures),
            gallery_refreshes: load(&self.gallery_refreshes),
            gallery_refresh_failures: load(&self.gallery_refresh_failures),
            source_reconnects: load(&self.source_reconnects),
            results_handled: load(&self.results_handled),
            capture_fps: self.fps(Stage::Capture),
            process_fps: self.fps(Stage::Process),
            output_fps: self.fps(Stage::Output),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }

    fn fps_slot(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::Capture => &self.capture_fps,
            Stage::Process => &self.process_fps,
            Stage::Output => &self.output_fps,
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame rate over rolling one-second windows.
///
/// Owned by a single stage worker, which publishes each completed window
/// into [`PipelineStats`].
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    count: u32,
    fps: f64,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            fps: 0.0,
        }
    }

    /// Counts one frame; returns the new rate when a window closes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }
        self.fps = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}
