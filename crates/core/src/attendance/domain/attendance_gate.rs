use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use super::attendance_recorder::{AttendanceRecord, AttendanceRecorder};

/// Result of one gate check.
#[derive(Clone, Debug, PartialEq)]
pub enum GateOutcome {
    Recorded,
    /// A record for this student succeeded within the cooldown window.
    CoolingDown,
    /// The recorder failed; the cooldown was left unset.
    Failed(String),
}

#[derive(Default)]
struct StudentSlot {
    last_recorded: Mutex<Option<Instant>>,
    record_lock: Mutex<()>,
}

impl StudentSlot {
    fn is_due(&self, now: Instant, cooldown: Duration) -> bool {
        let last = *self.last_recorded.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            None => true,
            Some(at) => now.saturating_duration_since(at) > cooldown,
        }
    }
}

/// Cooldown-gated access to the attendance recorder.
///
/// Cooldown is keyed by student, not by track. The slot map lock is held
/// only to look up a student's slot; recording serializes on that
/// student's own lock, so unrelated students never wait on each other.
pub struct AttendanceGate {
    recorder: Arc<dyn AttendanceRecorder>,
    cooldown: Duration,
    slots: Mutex<HashMap<String, Arc<StudentSlot>>>,
}

impl AttendanceGate {
    pub fn new(recorder: Arc<dyn AttendanceRecorder>, cooldown: Duration) -> Self {
        Self {
            recorder,
            cooldown,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// `true` iff a record was attempted and succeeded.
    pub fn maybe_record(&self, student_id: &str, class_id: &str, camera_id: &str, now: Instant) -> bool {
        self.check_and_record(student_id, class_id, camera_id, now) == GateOutcome::Recorded
    }

    pub fn check_and_record(
        &self,
        student_id: &str,
        class_id: &str,
        camera_id: &str,
        now: Instant,
    ) -> GateOutcome {
        let slot = self.slot(student_id);
        if !slot.is_due(now, self.cooldown) {
            return GateOutcome::CoolingDown;
        }

        let _recording = slot.record_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Another track may have recorded this student while we waited.
        if !slot.is_due(now, self.cooldown) {
            return GateOutcome::CoolingDown;
        }

        let record = AttendanceRecord {
            student_id: student_id.to_string(),
            class_id: class_id.to_string(),
            camera_id: camera_id.to_string(),
            timestamp: SystemTime::now(),
        };
        match self.recorder.record(&record) {
            Ok(()) => {
                *slot.last_recorded.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
                log::info!("Attendance recorded: {student_id} in {class_id} ({camera_id})");
                GateOutcome::Recorded
            }
            Err(e) => {
                log::warn!("Attendance for {student_id} failed: {e}");
                GateOutcome::Failed(e.to_string())
            }
        }
    }

    /// When the student's last successful record happened, if any.
    pub fn last_recorded(&self, student_id: &str) -> Option<Instant> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(student_id)?;
        let last = *slot.last_recorded.lock().unwrap_or_else(PoisonError::into_inner);
        last
    }

    fn slot(&self, student_id: &str) -> Arc<StudentSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(student_id.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::domain::attendance_recorder::RecordError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecorder {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
        seen: Mutex<Vec<AttendanceRecord>>,
    }

    impl AttendanceRecorder for CountingRecorder {
        fn record(&self, record: &AttendanceRecord) -> Result<(), RecordError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.failing.load(Ordering::SeqCst) {
                return Err(RecordError::Transport("connection refused".into()));
            }
            self.seen.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn gate(recorder: &Arc<CountingRecorder>) -> AttendanceGate {
        AttendanceGate::new(recorder.clone(), Duration::from_secs(300))
    }

    #[test]
    fn test_second_call_within_cooldown_skips_recorder() {
        let recorder = Arc::new(CountingRecorder::default());
        let gate = gate(&recorder);
        let t0 = Instant::now();

        assert!(gate.maybe_record("SV001", "CS101", "cam-1", t0));
        assert!(!gate.maybe_record("SV001", "CS101", "cam-1", t0 + Duration::from_secs(10)));

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].student_id, "SV001");
        assert_eq!(seen[0].class_id, "CS101");
        assert_eq!(seen[0].camera_id, "cam-1");
    }

    #[test]
    fn test_records_again_after_cooldown() {
        let recorder = Arc::new(CountingRecorder::default());
        let gate = gate(&recorder);
        let t0 = Instant::now();

        assert!(gate.maybe_record("SV001", "CS101", "cam-1", t0));
        assert_eq!(
            gate.check_and_record("SV001", "CS101", "cam-1", t0 + Duration::from_secs(300)),
            GateOutcome::CoolingDown
        );
        assert!(gate.maybe_record("SV001", "CS101", "cam-1", t0 + Duration::from_secs(301)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_leaves_cooldown_unset() {
        let recorder = Arc::new(CountingRecorder::default());
        recorder.failing.store(true, Ordering::SeqCst);
        let gate = gate(&recorder);
        let t0 = Instant::now();

        let outcome = gate.check_and_record("SV001", "CS101", "cam-1", t0);
        assert!(matches!(outcome, GateOutcome::Failed(_)));
        assert_eq!(gate.last_recorded("SV001"), None);

        recorder.failing.store(false, Ordering::SeqCst);
        assert!(gate.maybe_record("SV001", "CS101", "cam-1", t0 + Duration::from_secs(1)));
        assert_eq!(gate.last_recorded("SV001"), Some(t0 + Duration::from_secs(1)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cooldown_is_per_student() {
        let recorder = Arc::new(CountingRecorder::default());
        let gate = gate(&recorder);
        let t0 = Instant::now();

        assert!(gate.maybe_record("SV001", "CS101", "cam-1", t0));
        assert!(gate.maybe_record("SV002", "CS101", "cam-1", t0));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_confirmations_record_once() {
        let recorder = Arc::new(CountingRecorder {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let gate = Arc::new(gate(&recorder));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.maybe_record("SV001", "CS101", "cam-1", now))
            })
            .collect();
        let recorded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();

        assert_eq!(recorded, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }
}
