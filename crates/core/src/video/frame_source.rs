use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::pipeline::pipeline_stats::{FpsMeter, PipelineStats, Stage};
use crate::shared::bounded_queue::DropOldestQueue;
use crate::shared::frame::Frame;
use crate::video::domain::video_reader::{SharedReader, SourceError, StreamInfo, VideoSource};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Reconnection policy for a capture source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Open attempts per (re)connection before giving up. At least one.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Pulls frames from a [`VideoReader`](crate::video::domain::video_reader::VideoReader)
/// into a drop-oldest queue.
///
/// Owns sequence numbering and reconnection. The reader lock is taken per
/// call so the orchestrator can close the handle during shutdown.
pub struct FrameSource {
    reader: SharedReader,
    source: VideoSource,
    settings: CaptureSettings,
    info: Option<StreamInfo>,
    sequence: u64,
}

impl FrameSource {
    pub fn new(reader: SharedReader, source: VideoSource, settings: CaptureSettings) -> Self {
        Self {
            reader,
            source,
            settings,
            info: None,
            sequence: 0,
        }
    }

    pub fn source(&self) -> &VideoSource {
        &self.source
    }

    pub fn reader(&self) -> &SharedReader {
        &self.reader
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }

    /// Opens the source, retrying with a fixed delay.
    pub fn start(&mut self, stop: &AtomicBool) -> Result<StreamInfo, SourceError> {
        let info = self.open_with_retries(stop)?;
        log::info!(
            "Opened {} ({}x{} @ {:.1} fps, {})",
            self.source,
            info.width,
            info.height,
            info.fps,
            info.codec
        );
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Captures until `stop` is set, the source ends, or reconnection fails.
    ///
    /// A finite source running out is `Ok(())`. Exhausting the retry budget
    /// while reconnecting is `Err(SourceError::Unavailable)`.
    pub fn capture_loop(
        &mut self,
        queue: &DropOldestQueue<Frame>,
        stop: &AtomicBool,
        stats: &PipelineStats,
    ) -> Result<(), SourceError> {
        let mut meter = FpsMeter::new(Instant::now());

        while !stop.load(Ordering::Relaxed) {
            match self.read_frame() {
                Ok(Some(frame)) => {
                    self.sequence += 1;
                    let now = Instant::now();
                    let frame = frame.stamped(self.sequence, now);
                    stats.inc(&stats.frames_captured);
                    stats.add(&stats.frames_dropped, queue.push(frame) as u64);
                    if let Some(fps) = meter.tick(now) {
                        stats.set_fps(Stage::Capture, fps);
                    }
                }
                Ok(None) => {
                    log::info!("{} ended after {} frames", self.source, self.sequence);
                    return Ok(());
                }
                Err(e) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    log::warn!("Read from {} failed: {e}; reconnecting", self.source);
                    stats.inc(&stats.source_reconnects);
                    self.close_reader();
                    let info = self.open_with_retries(stop)?;
                    self.info = Some(info);
                }
            }
        }
        Ok(())
    }

    fn read_frame(&self) -> Result<Option<Frame>, SourceError> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| SourceError::Read("reader lock poisoned".into()))?;
        reader.read()
    }

    fn close_reader(&self) {
        if let Ok(mut reader) = self.reader.lock() {
            reader.close();
        }
    }

    fn open_with_retries(&self, stop: &AtomicBool) -> Result<StreamInfo, SourceError> {
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            let opened = match self.reader.lock() {
                Ok(mut reader) => reader.open(&self.source),
                Err(_) => Err(SourceError::Read("reader lock poisoned".into())),
            };
            match opened {
                Ok(info) => return Ok(info),
                Err(e) => {
                    log::warn!(
                        "Opening {} failed (attempt {attempts}/{max_attempts}): {e}",
                        self.source
                    );
                }
            }
            if attempts < max_attempts && !sleep_unless_stopped(stop, self.settings.retry_delay) {
                break;
            }
        }

        Err(SourceError::Unavailable {
            locator: self.source.locator(),
            attempts,
        })
    }
}

/// Sleeps for `total` in short slices. Returns `false` if `stop` was set.
pub(crate) fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::domain::video_reader::VideoReader;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    struct ScriptedReader {
        // Outcome of each successive open; succeeds once exhausted.
        opens: VecDeque<bool>,
        open_calls: Arc<AtomicU32>,
        reads: VecDeque<Result<Option<Frame>, SourceError>>,
    }

    impl VideoReader for ScriptedReader {
        fn open(&mut self, source: &VideoSource) -> Result<StreamInfo, SourceError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            if !self.opens.pop_front().unwrap_or(true) {
                return Err(SourceError::Open {
                    locator: source.locator(),
                    reason: "busy".into(),
                });
            }
            Ok(StreamInfo {
                width: 4,
                height: 4,
                fps: 30.0,
                codec: "raw".into(),
                locator: source.locator(),
            })
        }

        fn read(&mut self) -> Result<Option<Frame>, SourceError> {
            self.reads.pop_front().unwrap_or(Ok(None))
        }

        fn close(&mut self) {}
    }

    fn frame() -> Frame {
        Frame::new(vec![0; 4 * 4 * 3], 4, 4, 3, 0)
    }

    fn source_with(
        opens: Vec<bool>,
        reads: Vec<Result<Option<Frame>, SourceError>>,
        max_retries: u32,
    ) -> (FrameSource, Arc<AtomicU32>) {
        let open_calls = Arc::new(AtomicU32::new(0));
        let reader = ScriptedReader {
            opens: opens.into(),
            open_calls: open_calls.clone(),
            reads: reads.into(),
        };
        let shared: SharedReader = Arc::new(Mutex::new(Box::new(reader)));
        let settings = CaptureSettings {
            max_retries,
            retry_delay: Duration::ZERO,
        };
        (
            FrameSource::new(shared, VideoSource::Device(0), settings),
            open_calls,
        )
    }

    #[test]
    fn test_start_retries_then_succeeds() {
        let (mut source, open_calls) = source_with(vec![false, false], vec![], 3);
        let info = source.start(&AtomicBool::new(false)).unwrap();
        assert_eq!(info.width, 4);
        assert_eq!(open_calls.load(Ordering::SeqCst), 3);
        assert!(source.stream_info().is_some());
    }

    #[test]
    fn test_start_gives_up_after_bounded_attempts() {
        let (mut source, open_calls) = source_with(vec![false; 10], vec![], 3);
        let err = source.start(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { attempts: 3, .. }));
        assert_eq!(open_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_capture_stamps_increasing_sequences() {
        let reads = (0..3).map(|_| Ok(Some(frame()))).collect();
        let (mut source, _) = source_with(vec![], reads, 1);
        let queue = DropOldestQueue::new(8);
        let stats = PipelineStats::new();
        let stop = AtomicBool::new(false);

        source.start(&stop).unwrap();
        source.capture_loop(&queue, &stop, &stats).unwrap();

        let seqs: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(stats.snapshot().frames_captured, 3);
    }

    #[test]
    fn test_capture_overflow_drops_oldest() {
        let reads = (0..5).map(|_| Ok(Some(frame()))).collect();
        let (mut source, _) = source_with(vec![], reads, 1);
        let queue = DropOldestQueue::new(2);
        let stats = PipelineStats::new();
        let stop = AtomicBool::new(false);

        source.start(&stop).unwrap();
        source.capture_loop(&queue, &stop, &stats).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().sequence(), 4);
        assert_eq!(queue.try_pop().unwrap().sequence(), 5);
        assert_eq!(stats.snapshot().frames_dropped, 3);
    }

    #[test]
    fn test_read_failure_reconnects_and_continues() {
        let reads = vec![
            Ok(Some(frame())),
            Err(SourceError::Read("timeout".into())),
            Ok(Some(frame())),
        ];
        let (mut source, open_calls) = source_with(vec![], reads, 2);
        let queue = DropOldestQueue::new(8);
        let stats = PipelineStats::new();
        let stop = AtomicBool::new(false);

        source.start(&stop).unwrap();
        source.capture_loop(&queue, &stop, &stats).unwrap();

        assert_eq!(open_calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(stats.snapshot().source_reconnects, 1);
    }

    #[test]
    fn test_reconnect_exhaustion_is_unavailable() {
        let reads = vec![Err(SourceError::Read("gone".into()))];
        let (mut source, open_calls) = source_with(vec![true, false, false], reads, 2);
        let stop = AtomicBool::new(false);
        source.start(&stop).unwrap();

        let err = source
            .capture_loop(&DropOldestQueue::new(2), &stop, &PipelineStats::new())
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { attempts: 2, .. }));
        assert_eq!(open_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stop_flag_ends_loop_immediately() {
        let reads = (0..3).map(|_| Ok(Some(frame()))).collect();
        let (mut source, _) = source_with(vec![], reads, 1);
        let queue = DropOldestQueue::new(8);
        let stop = AtomicBool::new(false);
        source.start(&stop).unwrap();

        stop.store(true, Ordering::SeqCst);
        source.capture_loop(&queue, &stop, &PipelineStats::new()).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sleep_unless_stopped_returns_early() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_unless_stopped(&stop, Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
