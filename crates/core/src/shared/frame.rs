use std::time::Instant;

use ndarray::{s, ArrayView3};

use crate::shared::region::DetectionArea;

/// A single captured frame: contiguous RGB bytes in row-major order.
///
/// Frames are stamped with a sequence number and capture instant by the
/// `FrameSource` and are not mutated afterwards; each stage owns the frame
/// until it hands it to the next queue.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, sequence: u64) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Re-stamps the frame with the capture-side sequence number and instant.
    pub fn stamped(mut self, sequence: u64, captured_at: Instant) -> Self {
        self.sequence = sequence;
        self.captured_at = captured_at;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Copies the part of the frame covered by `area`, clamped to the frame.
    ///
    /// Returns `None` when the clamped area is empty. The crop keeps the
    /// sequence number and capture instant of the source frame.
    pub fn crop(&self, area: &DetectionArea) -> Option<Frame> {
        let (x, y, w, h) = area.clamp_to(self.width, self.height)?;
        let view = self.as_ndarray();
        let sub = view.slice(s![
            y as usize..(y + h) as usize,
            x as usize..(x + w) as usize,
            ..
        ]);
        let data: Vec<u8> = sub.iter().copied().collect();
        Some(Frame {
            data,
            width: w,
            height: h,
            channels: self.channels,
            sequence: self.sequence,
            captured_at: self.captured_at,
        })
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_construction_and_accessors() {
        let data = vec![0u8; 12]; // 2x2x3
        let frame = Frame::new(data.clone(), 2, 2, 3, 5);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.sequence(), 5);
        assert_eq!(frame.data(), &data[..]);
    }

    #[test]
    fn test_stamped_overrides_sequence_and_instant() {
        let at = Instant::now() + Duration::from_secs(3);
        let frame = Frame::new(vec![0u8; 3], 1, 1, 3, 0).stamped(42, at);
        assert_eq!(frame.sequence(), 42);
        assert_eq!(frame.captured_at(), at);
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * channels")]
    fn test_mismatched_data_length_panics_in_debug() {
        let data = vec![0u8; 10]; // wrong size for 2x2x3
        Frame::new(data, 2, 2, 3, 0);
    }

    #[test]
    fn test_as_ndarray_pixel_access() {
        // 2x2 RGB: set pixel (row=1, col=0) to red
        let mut data = vec![0u8; 12];
        data[6] = 255;
        let frame = Frame::new(data, 2, 2, 3, 0);
        let arr = frame.as_ndarray();
        assert_eq!(arr.shape(), &[2, 2, 3]);
        assert_eq!(arr[[1, 0, 0]], 255);
        assert_eq!(arr[[1, 0, 1]], 0);
    }

    #[test]
    fn test_crop_copies_sub_image() {
        // 4x2 frame, pixel value encodes column
        let mut data = Vec::new();
        for _row in 0..2 {
            for col in 0..4u8 {
                data.extend_from_slice(&[col, col, col]);
            }
        }
        let frame = Frame::new(data, 4, 2, 3, 9);
        let area = DetectionArea {
            x: 1,
            y: 0,
            width: 2,
            height: 2,
        };

        let cropped = frame.crop(&area).unwrap();

        assert_eq!(cropped.width(), 2);
        assert_eq!(cropped.height(), 2);
        assert_eq!(cropped.sequence(), 9);
        assert_eq!(cropped.as_ndarray()[[0, 0, 0]], 1);
        assert_eq!(cropped.as_ndarray()[[1, 1, 0]], 2);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let frame = Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, 3, 0);
        let area = DetectionArea {
            x: 2,
            y: 2,
            width: 10,
            height: 10,
        };
        let cropped = frame.crop(&area).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (2, 2));
        assert_eq!(cropped.data().len(), 2 * 2 * 3);
    }

    #[test]
    fn test_crop_outside_frame_is_none() {
        let frame = Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, 3, 0);
        let area = DetectionArea {
            x: 10,
            y: 10,
            width: 5,
            height: 5,
        };
        assert!(frame.crop(&area).is_none());
    }
}
