//! Synthetic notification generation for testing
//!
//! Builds the byte stream the camera sends (row-major pixels followed by a
//! little-endian score) and splits it into notification fragments, so the
//! reassembly pipeline can be checked pixel for pixel without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! use nano_detect_lib::test_utils::NotificationGenerator;
//!
//! let gen = NotificationGenerator::default();
//!
//! // Gradient frame with a score of 3, split at the radio's MTU
//! let frame = NotificationGenerator::gradient_frame(96, 96);
//! let fragments = gen.capture_fragments(&frame, 3, 4);
//! ```

use crate::config::BoundaryPolicy;
use crate::gray_frame::GrayFrame;

/// Notification payload size with the default 23-byte ATT MTU
pub const DEFAULT_NOTIFY_PAYLOAD: usize = 20;

/// Generates synthetic notification fragments for testing
#[derive(Debug, Clone)]
pub struct NotificationGenerator {
    /// Maximum payload size per notification
    pub mtu: usize,
}

impl Default for NotificationGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_PAYLOAD)
    }
}

impl NotificationGenerator {
    /// Create a generator with the given payload size (minimum 1)
    pub fn new(mtu: usize) -> Self {
        Self { mtu: mtu.max(1) }
    }

    /// Raw byte stream for one capture: pixels then `score_width` score bytes
    pub fn stream(frame: &GrayFrame, score: u64, score_width: usize) -> Vec<u8> {
        let width = score_width.min(8);
        let mut stream = Vec::with_capacity(frame.pixels().len() + width);
        stream.extend_from_slice(frame.pixels());
        stream.extend_from_slice(&score.to_le_bytes()[..width]);
        stream
    }

    /// Split a stream into MTU-sized fragments
    pub fn fragments(&self, stream: &[u8]) -> Vec<Vec<u8>> {
        stream.chunks(self.mtu).map(<[u8]>::to_vec).collect()
    }

    /// Build and fragment one capture
    pub fn capture_fragments(
        &self,
        frame: &GrayFrame,
        score: u64,
        score_width: usize,
    ) -> Vec<Vec<u8>> {
        self.fragments(&Self::stream(frame, score, score_width))
    }

    /// Split a stream using a repeating pattern of fragment sizes.
    ///
    /// Zero sizes produce empty fragments, which the assembler must accept.
    pub fn irregular_fragments(stream: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
        if sizes.iter().all(|&s| s == 0) {
            return vec![stream.to_vec()];
        }

        let mut fragments = Vec::new();
        let mut offset = 0;
        for &size in sizes.iter().cycle() {
            if offset >= stream.len() {
                break;
            }
            let end = (offset + size).min(stream.len());
            fragments.push(stream[offset..end].to_vec());
            offset = end;
        }
        fragments
    }

    /// Frame the assembler should produce for `sent` under `policy`
    pub fn expected_frame(sent: &GrayFrame, policy: BoundaryPolicy) -> GrayFrame {
        let mut expected = sent.clone();
        if policy == BoundaryPolicy::DropFinalPixel {
            let last = sent.pixels().len().saturating_sub(1);
            expected.set_linear(last, 0);
        }
        expected
    }

    /// Horizontal gradient from black on the left to white on the right.
    ///
    /// Useful for detecting column shifts.
    pub fn gradient_frame(width: u32, height: u32) -> GrayFrame {
        let span = width.saturating_sub(1).max(1);
        Self::frame_from_fn(width, height, |x, _| ((x * 255) / span) as u8)
    }

    /// Vertical gradient from black at the top to white at the bottom.
    ///
    /// Useful for detecting row slips.
    pub fn vertical_gradient_frame(width: u32, height: u32) -> GrayFrame {
        let span = height.saturating_sub(1).max(1);
        Self::frame_from_fn(width, height, |_, y| ((y * 255) / span) as u8)
    }

    /// Alternating 8x8 black and white squares
    pub fn checkerboard_frame(width: u32, height: u32) -> GrayFrame {
        Self::frame_from_fn(width, height, |x, y| {
            if ((x / 8) + (y / 8)).is_multiple_of(2) {
                255
            } else {
                0
            }
        })
    }

    /// Every pixel set to `value`
    pub fn solid_frame(width: u32, height: u32, value: u8) -> GrayFrame {
        Self::frame_from_fn(width, height, |_, _| value)
    }

    /// Pixel `i` holds `(i % 251) + 1`, so every slot is non-zero and
    /// neighbouring slots differ.
    pub fn sequence_frame(width: u32, height: u32) -> GrayFrame {
        Self::frame_from_fn(width, height, |x, y| ((y * width + x) % 251 + 1) as u8)
    }

    fn frame_from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> GrayFrame {
        let mut frame = GrayFrame::new(width, height);
        for y in 0..height {
            for x in 0..width {
                frame.set_linear((y * width + x) as usize, f(x, y));
            }
        }
        frame
    }
}
