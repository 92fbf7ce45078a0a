use std::time::Instant;

use serde::Serialize;

use crate::shared::region::{BoundingBox, Point};

/// Lifecycle of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrackState {
    /// Matched a detection this cycle.
    Active,
    /// Unmatched this cycle but still within the timeout.
    Stale,
    /// Removed from the live set; reported once.
    Pruned,
}

/// Center velocity in pixels per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Velocity {
    pub dx: f64,
    pub dy: f64,
}

/// A face followed across frames. Identity-agnostic: recognition is keyed
/// by `id` but never stored here.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u32,
    pub bbox: BoundingBox,
    pub center: Point,
    pub velocity: Velocity,
    pub last_seen: Instant,
    /// Consecutive cycles without a matching detection.
    pub missed: u32,
    pub state: TrackState,
    /// Index of the detection matched this cycle, if any.
    pub detection_index: Option<usize>,
}

impl Track {
    pub(crate) fn spawn(id: u32, bbox: BoundingBox, now: Instant, detection_index: usize) -> Self {
        Self {
            id,
            bbox,
            center: bbox.center(),
            velocity: Velocity::default(),
            last_seen: now,
            missed: 0,
            state: TrackState::Active,
            detection_index: Some(detection_index),
        }
    }

    pub fn seconds_since_seen(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.last_seen).as_secs_f64()
    }

    /// Center extrapolated to `now` at the current velocity.
    pub fn predicted_center(&self, now: Instant) -> Point {
        let dt = self.seconds_since_seen(now);
        Point::new(
            self.center.x + self.velocity.dx * dt,
            self.center.y + self.velocity.dy * dt,
        )
    }

    pub(crate) fn observe(&mut self, bbox: BoundingBox, now: Instant, detection_index: usize) {
        let dt = self.seconds_since_seen(now);
        let center = bbox.center();
        self.velocity = if dt > 0.0 {
            Velocity {
                dx: (center.x - self.center.x) / dt,
                dy: (center.y - self.center.y) / dt,
            }
        } else {
            Velocity::default()
        };
        self.bbox = bbox;
        self.center = center;
        self.last_seen = now;
        self.missed = 0;
        self.state = TrackState::Active;
        self.detection_index = Some(detection_index);
    }

    pub(crate) fn miss(&mut self) {
        self.missed += 1;
        self.state = TrackState::Stale;
        self.detection_index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    #[test]
    fn test_velocity_is_pixels_per_second() {
        let t0 = Instant::now();
        let mut track = Track::spawn(1, BoundingBox::new(0.0, 0.0, 20.0, 20.0), t0, 0);

        track.observe(
            BoundingBox::new(10.0, 5.0, 30.0, 25.0),
            t0 + Duration::from_millis(500),
            0,
        );

        assert_relative_eq!(track.velocity.dx, 20.0);
        assert_relative_eq!(track.velocity.dy, 10.0);
    }

    #[test]
    fn test_zero_elapsed_gives_zero_velocity() {
        let t0 = Instant::now();
        let mut track = Track::spawn(1, BoundingBox::new(0.0, 0.0, 20.0, 20.0), t0, 0);

        track.observe(BoundingBox::new(50.0, 0.0, 70.0, 20.0), t0, 0);

        assert_eq!(track.velocity, Velocity::default());
        assert_relative_eq!(track.center.x, 60.0);
    }

    #[test]
    fn test_prediction_extrapolates_center() {
        let t0 = Instant::now();
        let mut track = Track::spawn(1, BoundingBox::new(0.0, 0.0, 20.0, 20.0), t0, 0);
        track.velocity = Velocity { dx: 100.0, dy: -50.0 };

        let p = track.predicted_center(t0 + Duration::from_millis(200));

        assert_relative_eq!(p.x, 30.0);
        assert_relative_eq!(p.y, 0.0);
    }

    #[test]
    fn test_miss_marks_stale_and_clears_detection() {
        let mut track = Track::spawn(3, BoundingBox::new(0.0, 0.0, 1.0, 1.0), Instant::now(), 2);
        track.miss();
        track.miss();

        assert_eq!(track.missed, 2);
        assert_eq!(track.state, TrackState::Stale);
        assert_eq!(track.detection_index, None);
    }
}
