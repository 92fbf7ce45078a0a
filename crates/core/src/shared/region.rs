use serde::{Deserialize, Serialize};

/// A point in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned face box as `[x1, y1, x2, y2]` in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Shifts the box by `(dx, dy)`; used to map detections found inside a
    /// detection area back to full-frame coordinates.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let area_a = self.width() * self.height();
        let area_b = other.width() * other.height();
        inter / (area_a + area_b - inter)
    }
}

/// Rectangle restricting the part of each frame handed to the face model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DetectionArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DetectionArea {
    /// Intersects the area with a `frame_w` x `frame_h` frame.
    ///
    /// Returns `(x, y, width, height)` of the visible part, or `None` when
    /// nothing of the area lies inside the frame.
    pub fn clamp_to(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        if self.x >= frame_w || self.y >= frame_h {
            return None;
        }
        let w = self.width.min(frame_w - self.x);
        let h = self.height.min(frame_h - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some((self.x, self.y, w, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn test_center_of_box() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(b.center(), Point::new(20.0, 40.0));
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert_relative_eq!(a.distance(&b), 5.0);
    }

    #[test]
    fn test_translated_moves_both_corners() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0).translated(5.0, -2.0);
        assert_eq!(b, BoundingBox::new(5.0, -2.0, 15.0, 8.0));
    }

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(10.0, 10.0, 110.0, 110.0);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(50.0, 0.0, 150.0, 100.0);
        assert_relative_eq!(a.iou(&b), 5000.0 / 15000.0);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[rstest]
    #[case(0, 0, 50, 50, Some((0, 0, 50, 50)))]
    #[case(80, 10, 50, 50, Some((80, 10, 20, 50)))]
    #[case(100, 0, 10, 10, None)]
    #[case(0, 0, 0, 10, None)]
    fn test_clamp_to_frame(
        #[case] x: u32,
        #[case] y: u32,
        #[case] width: u32,
        #[case] height: u32,
        #[case] expected: Option<(u32, u32, u32, u32)>,
    ) {
        let area = DetectionArea {
            x,
            y,
            width,
            height,
        };
        assert_eq!(area.clamp_to(100, 100), expected);
    }

    #[test]
    fn test_detection_area_deserializes() {
        let area: DetectionArea =
            serde_json::from_str(r#"{"x": 1, "y": 2, "width": 3, "height": 4}"#).unwrap();
        assert_eq!(
            area,
            DetectionArea {
                x: 1,
                y: 2,
                width: 3,
                height: 4
            }
        );
    }
}
