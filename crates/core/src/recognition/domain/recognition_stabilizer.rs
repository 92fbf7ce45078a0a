/// Per-track temporal voting over raw gallery matches.
///
/// A single frame's nearest match is noisy; identity is only confirmed once
/// enough recent samples on the same track agree.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::shared::embedding::Embedding;

use super::gallery_matcher::GalleryMatcher;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StabilizerSettings {
    /// Samples older than this are evicted.
    pub horizon: Duration,
    /// Most-recent samples retained per track.
    pub max_samples: usize,
    pub min_confidence_frames: usize,
    pub vote_quorum: f32,
    pub recognition_threshold: f32,
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(3),
            max_samples: 10,
            min_confidence_frames: 3,
            vote_quorum: 0.6,
            recognition_threshold: 0.6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Confirmed { student_id: String, confidence: f32 },
    Unconfirmed,
}

#[derive(Clone, Debug)]
struct RecognitionSample {
    candidate: Option<String>,
    similarity: f32,
    at: Instant,
}

pub struct RecognitionStabilizer {
    matcher: Arc<GalleryMatcher>,
    settings: StabilizerSettings,
    buffers: HashMap<u32, VecDeque<RecognitionSample>>,
}

impl RecognitionStabilizer {
    pub fn new(matcher: Arc<GalleryMatcher>, settings: StabilizerSettings) -> Self {
        Self {
            matcher,
            settings,
            buffers: HashMap::new(),
        }
    }

    /// Matches `embedding`, records the sample in the track's vote buffer
    /// and decides whether the track's identity is confirmed.
    pub fn observe(&mut self, track_id: u32, embedding: &Embedding, now: Instant) -> Decision {
        let (candidate, similarity) = self.matcher.best_match(embedding);

        let buffer = self.buffers.entry(track_id).or_default();
        buffer.push_back(RecognitionSample {
            candidate: candidate.clone(),
            similarity,
            at: now,
        });
        while buffer
            .front()
            .is_some_and(|s| now.saturating_duration_since(s.at) > self.settings.horizon)
        {
            buffer.pop_front();
        }
        while buffer.len() > self.settings.max_samples.max(1) {
            buffer.pop_front();
        }

        match candidate {
            Some(student_id) => decide(buffer, student_id, &self.settings),
            None => Decision::Unconfirmed,
        }
    }

    /// Drops the vote buffer of a pruned track.
    pub fn discard(&mut self, track_id: u32) {
        self.buffers.remove(&track_id);
    }

    pub fn buffer_len(&self, track_id: u32) -> usize {
        self.buffers.get(&track_id).map_or(0, VecDeque::len)
    }

    pub fn tracked_buffers(&self) -> usize {
        self.buffers.len()
    }
}

fn decide(
    buffer: &VecDeque<RecognitionSample>,
    student_id: String,
    settings: &StabilizerSettings,
) -> Decision {
    if buffer.len() < settings.min_confidence_frames {
        return Decision::Unconfirmed;
    }

    let votes = buffer
        .iter()
        .filter(|s| {
            s.candidate.as_deref() == Some(student_id.as_str())
                && s.similarity >= settings.recognition_threshold
        })
        .count();
    let vote_ratio = votes as f32 / buffer.len() as f32;

    let matched: Vec<f32> = buffer
        .iter()
        .filter(|s| s.candidate.is_some())
        .map(|s| s.similarity)
        .collect();
    if matched.is_empty() {
        return Decision::Unconfirmed;
    }
    let mean_confidence = matched.iter().sum::<f32>() / matched.len() as f32;

    if vote_ratio >= settings.vote_quorum && mean_confidence >= settings.recognition_threshold {
        Decision::Confirmed {
            student_id,
            confidence: mean_confidence,
        }
    } else {
        Decision::Unconfirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::domain::gallery_source::{GalleryLoadError, GallerySource, KnownFace};
    use approx::assert_relative_eq;

    struct FixedSource(Vec<KnownFace>);

    impl GallerySource for FixedSource {
        fn list_known_embeddings(&self) -> Result<Vec<KnownFace>, GalleryLoadError> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    fn basis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        v
    }

    /// Unit vector with similarity `sim` to basis `i`, the rest along axis 3.
    fn query(i: usize, sim: f32) -> Embedding {
        let mut v = basis(i);
        v[i] = sim;
        v[3] = (1.0 - sim * sim).sqrt();
        Embedding::normalized(v).unwrap()
    }

    fn no_match() -> Embedding {
        Embedding::normalized(basis(3)).unwrap()
    }

    fn stabilizer(settings: StabilizerSettings) -> RecognitionStabilizer {
        let faces = vec![
            KnownFace { student_id: "SV001".into(), name: None, embedding: basis(0) },
            KnownFace { student_id: "SV002".into(), name: None, embedding: basis(1) },
        ];
        let matcher = GalleryMatcher::load(Arc::new(FixedSource(faces)), 0.6, Duration::from_secs(300)).unwrap();
        RecognitionStabilizer::new(Arc::new(matcher), settings)
    }

    fn tick(t0: Instant, i: u64) -> Instant {
        t0 + Duration::from_millis(100 * i)
    }

    #[test]
    fn test_four_of_five_agreeing_confirms() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        s.observe(1, &no_match(), t0);
        let mut last = Decision::Unconfirmed;
        for i in 1..5 {
            last = s.observe(1, &query(0, 0.85), tick(t0, i));
        }

        match last {
            Decision::Confirmed { student_id, confidence } => {
                assert_eq!(student_id, "SV001");
                assert_relative_eq!(confidence, 0.85, epsilon = 1e-4);
            }
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[test]
    fn test_two_of_five_agreeing_is_unconfirmed() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        let samples = [query(1, 0.85), query(1, 0.85), no_match(), query(0, 0.85), query(0, 0.85)];
        let mut last = Decision::Unconfirmed;
        for (i, e) in samples.iter().enumerate() {
            last = s.observe(1, e, tick(t0, i as u64));
        }
        assert_eq!(last, Decision::Unconfirmed);
    }

    #[test]
    fn test_needs_min_confidence_frames() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();

        assert_eq!(s.observe(7, &query(0, 0.9), t0), Decision::Unconfirmed);
        assert_eq!(s.observe(7, &query(0, 0.9), tick(t0, 1)), Decision::Unconfirmed);
        assert!(matches!(s.observe(7, &query(0, 0.9), tick(t0, 2)), Decision::Confirmed { .. }));
    }

    #[test]
    fn test_unmatched_current_sample_is_unconfirmed() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        for i in 0..4 {
            s.observe(1, &query(0, 0.9), tick(t0, i));
        }
        assert_eq!(s.observe(1, &no_match(), tick(t0, 4)), Decision::Unconfirmed);
    }

    #[test]
    fn test_old_samples_fall_outside_horizon() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        s.observe(1, &query(0, 0.9), t0);
        s.observe(1, &query(0, 0.9), tick(t0, 1));

        let decision = s.observe(1, &query(0, 0.9), t0 + Duration::from_secs(5));

        assert_eq!(s.buffer_len(1), 1);
        assert_eq!(decision, Decision::Unconfirmed);
    }

    #[test]
    fn test_buffer_is_capped_to_most_recent() {
        let settings = StabilizerSettings { max_samples: 4, ..Default::default() };
        let mut s = stabilizer(settings);
        let t0 = Instant::now();
        for i in 0..4 {
            s.observe(1, &query(1, 0.9), tick(t0, i));
        }
        for i in 4..8 {
            s.observe(1, &query(0, 0.9), tick(t0, i));
        }

        assert_eq!(s.buffer_len(1), 4);
        assert!(matches!(
            s.observe(1, &query(0, 0.9), tick(t0, 8)),
            Decision::Confirmed { ref student_id, .. } if student_id == "SV001"
        ));
    }

    #[test]
    fn test_discard_starts_fresh_buffer() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        for i in 0..3 {
            s.observe(1, &query(0, 0.9), tick(t0, i));
        }
        s.discard(1);

        assert_eq!(s.buffer_len(1), 0);
        assert_eq!(s.tracked_buffers(), 0);
        assert_eq!(s.observe(1, &query(0, 0.9), tick(t0, 3)), Decision::Unconfirmed);
        assert_eq!(s.buffer_len(1), 1);
    }

    #[test]
    fn test_buffers_are_per_track() {
        let mut s = stabilizer(StabilizerSettings::default());
        let t0 = Instant::now();
        for i in 0..3 {
            s.observe(1, &query(0, 0.9), tick(t0, i));
        }
        assert_eq!(s.observe(2, &query(0, 0.9), tick(t0, 3)), Decision::Unconfirmed);
        assert_eq!(s.buffer_len(2), 1);
    }
}
