/// Greedy center-distance tracker.
///
/// Each cycle, every live track's center is extrapolated along its velocity
/// and paired with detections in ascending distance order. A pair is only
/// accepted below an adaptive bound `base * (1 + seconds since last seen)`,
/// so briefly occluded faces stay matchable with growing tolerance.
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use crate::detection::domain::face_model::Detection;
use crate::shared::constants::TRACK_TIMEOUT_FRAMES;

use super::track::{Track, TrackState};

pub const DEFAULT_BASE_DISTANCE: f64 = 80.0;

/// Result of one tracking cycle.
#[derive(Clone, Debug, Default)]
pub struct TrackUpdate {
    /// Live tracks keyed by ID after this cycle.
    pub tracks: BTreeMap<u32, Track>,
    /// Tracks removed this cycle, in `Pruned` state.
    pub pruned: Vec<Track>,
}

pub struct TrackManager {
    tracks: BTreeMap<u32, Track>,
    next_id: u32,
    base_distance: f64,
    timeout: u32,
}

impl TrackManager {
    pub fn new(base_distance: f64, timeout: u32) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            base_distance,
            timeout,
        }
    }

    pub fn update(&mut self, detections: &[Detection], now: Instant) -> TrackUpdate {
        let matches = self.greedy_match(detections, now);

        let mut matched_dets = HashSet::new();
        let mut matched_tracks = HashSet::new();
        for (track_id, det_idx) in matches {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.observe(detections[det_idx].bbox, now, det_idx);
            }
            matched_dets.insert(det_idx);
            matched_tracks.insert(track_id);
        }

        let pruned = self.age_unmatched(&matched_tracks);

        for (det_idx, det) in detections.iter().enumerate() {
            if !matched_dets.contains(&det_idx) {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.insert(id, Track::spawn(id, det.bbox, now, det_idx));
            }
        }

        TrackUpdate {
            tracks: self.tracks.clone(),
            pruned,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Pairs sorted by ascending distance, each track and detection used
    /// at most once. Ties go to the lower track ID.
    fn greedy_match(&self, detections: &[Detection], now: Instant) -> Vec<(u32, usize)> {
        let mut pairs: Vec<(f64, u32, usize)> = Vec::new();
        for track in self.tracks.values() {
            let predicted = track.predicted_center(now);
            let limit = self.base_distance * (1.0 + track.seconds_since_seen(now));
            for (det_idx, det) in detections.iter().enumerate() {
                let distance = det.bbox.center().distance(&predicted);
                if distance < limit {
                    pairs.push((distance, track.id, det_idx));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut used_tracks = HashSet::new();
        let mut used_dets = HashSet::new();
        let mut matches = Vec::new();
        for (_, track_id, det_idx) in pairs {
            if used_tracks.contains(&track_id) || used_dets.contains(&det_idx) {
                continue;
            }
            used_tracks.insert(track_id);
            used_dets.insert(det_idx);
            matches.push((track_id, det_idx));
        }
        matches
    }

    fn age_unmatched(&mut self, matched: &HashSet<u32>) -> Vec<Track> {
        let mut expired = Vec::new();
        for track in self.tracks.values_mut() {
            if matched.contains(&track.id) {
                continue;
            }
            track.miss();
            if track.missed > self.timeout {
                expired.push(track.id);
            }
        }

        expired
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id))
            .map(|mut track| {
                track.state = TrackState::Pruned;
                log::debug!("Pruned track {} after {} missed cycles", track.id, track.missed);
                track
            })
            .collect()
    }
}

impl Default for TrackManager {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DISTANCE, TRACK_TIMEOUT_FRAMES)
    }
}
