//! Frame assembly from BLE notification fragments
//!
//! The camera streams a `W x H` grayscale image one byte per pixel, followed
//! by a little-endian detection score. Notifications arrive with whatever
//! size the radio picked, so fragments are appended to a pending queue and
//! drained in logical chunks that are independent of fragment boundaries.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nano_detect_lib::config::ReassemblyConfig;
//! use nano_detect_lib::frame_assembler::{AssemblyEvent, FrameAssembler};
//!
//! let mut assembler = FrameAssembler::new(ReassemblyConfig::default());
//!
//! for fragment in notifications {
//!     for event in assembler.process_packet(&fragment) {
//!         match event {
//!             AssemblyEvent::ImageReady(frame) => upload(frame),
//!             AssemblyEvent::ScoreReady(score) => report(score),
//!         }
//!     }
//! }
//! ```

use crate::config::{BoundaryPolicy, ReassemblyConfig};
use crate::gray_frame::GrayFrame;

/// Position of the assembler in the capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// Cycle finished; waiting for the next reset
    Idle,
    /// Filling pixels
    AwaitingImage,
    /// Image complete, collecting score bytes
    AwaitingScore,
}

/// Detection score decoded from the bytes following the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Score(pub u64);

impl Score {
    /// Decode a little-endian unsigned integer of up to eight bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let value = bytes
            .iter()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)));
        Score(value)
    }

    /// Raw score value
    pub fn value(self) -> u64 {
        self.0
    }

    /// A positive score means the model saw something
    pub fn detected(self) -> bool {
        self.0 > 0
    }
}

/// Event emitted while draining
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyEvent {
    /// Every pixel slot has been consumed
    ImageReady(GrayFrame),
    /// Score decoded; the cycle is complete
    ScoreReady(Score),
}

/// Reassembles a grayscale frame and score from arbitrary fragments
#[derive(Debug)]
pub struct FrameAssembler {
    /// Geometry and chunking
    config: ReassemblyConfig,
    /// Bytes received but not yet consumed, oldest first
    pending: Vec<u8>,
    /// Row-major image being filled
    frame: GrayFrame,
    /// Index of the last consumed pixel slot (`None` before the first byte)
    pixel_index: Option<usize>,
    /// Current cycle position
    state: ReassemblyState,
}

impl FrameAssembler {
    /// Create an assembler ready for the first capture
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: Vec::with_capacity(config.pixel_count() + config.score_width),
            frame: GrayFrame::new(config.width, config.height),
            pixel_index: None,
            state: ReassemblyState::AwaitingImage,
        }
    }

    /// Reset for a new capture session.
    ///
    /// Clears pending bytes, zero-fills the frame, rewinds the cursor and
    /// returns to `AwaitingImage`. Calling it twice is the same as once.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.frame.clear();
        self.pixel_index = None;
        self.state = ReassemblyState::AwaitingImage;
    }

    /// Configuration in use
    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Current cycle position
    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Index of the last consumed pixel slot
    pub fn pixel_index(&self) -> Option<usize> {
        self.pixel_index
    }

    /// Bytes waiting to be consumed
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frame as filled so far
    pub fn frame(&self) -> &GrayFrame {
        &self.frame
    }

    /// Fraction of pixel slots consumed, `0.0..=1.0`
    pub fn progress(&self) -> f32 {
        match self.state {
            ReassemblyState::AwaitingImage => {
                let consumed = self.pixel_index.map_or(0, |i| i + 1);
                consumed as f32 / self.config.pixel_count() as f32
            }
            ReassemblyState::AwaitingScore | ReassemblyState::Idle => 1.0,
        }
    }

    /// Append a fragment to the pending queue.
    ///
    /// Never fails; empty fragments are accepted.
    pub fn append(&mut self, fragment: &[u8]) {
        self.pending.extend_from_slice(fragment);
    }

    /// Append a fragment and drain whatever it completes
    pub fn process_packet(&mut self, fragment: &[u8]) -> Vec<AssemblyEvent> {
        self.append(fragment);
        self.drain()
    }

    /// Consume pending bytes chunk by chunk.
    ///
    /// Returns the events produced, in order. Stops early when the score
    /// group is incomplete or the cycle is finished; leftover bytes stay
    /// queued for the next call.
    pub fn drain(&mut self) -> Vec<AssemblyEvent> {
        let mut events = Vec::new();

        while !self.pending.is_empty() {
            match self.state {
                ReassemblyState::AwaitingImage => {
                    if let Some(frame) = self.consume_image_chunk() {
                        events.push(AssemblyEvent::ImageReady(frame));
                    }
                }
                ReassemblyState::AwaitingScore => match self.consume_score() {
                    Some(score) => events.push(AssemblyEvent::ScoreReady(score)),
                    None => {
                        log::debug!(
                            "Score incomplete: {} of {} bytes pending",
                            self.pending.len(),
                            self.config.score_width
                        );
                        break;
                    }
                },
                ReassemblyState::Idle => {
                    log::debug!(
                        "Cycle complete, {} trailing bytes held until reset",
                        self.pending.len()
                    );
                    break;
                }
            }
        }

        events
    }

    /// Consume up to one chunk of pixel bytes.
    ///
    /// Returns the frame when the boundary byte is reached. Bytes after the
    /// boundary stay at the front of the queue and start the score group.
    fn consume_image_chunk(&mut self) -> Option<GrayFrame> {
        // A zero chunk size still consumes one byte per step
        let take = self.config.chunk_size.max(1).min(self.pending.len());
        let last = self.config.pixel_count().saturating_sub(1);
        let mut consumed = 0;
        let mut complete = false;

        for i in 0..take {
            let byte = self.pending[i];
            consumed += 1;

            let index = self.pixel_index.map_or(0, |p| p + 1);
            self.pixel_index = Some(index);

            if index == last {
                if self.config.boundary == BoundaryPolicy::StoreFinalPixel {
                    self.frame.set_linear(index, byte);
                }
                complete = true;
                break;
            }
            self.frame.set_linear(index, byte);
        }

        self.pending.drain(..consumed);

        if !complete {
            return None;
        }

        log::info!(
            "Image complete: {}x{} ({} bytes carried into score)",
            self.config.width,
            self.config.height,
            self.pending.len()
        );
        self.state = ReassemblyState::AwaitingScore;
        Some(self.frame.clone())
    }

    /// Decode the score once `score_width` bytes are queued
    fn consume_score(&mut self) -> Option<Score> {
        let width = self.config.score_width;
        if self.pending.len() < width {
            return None;
        }

        let score = Score::from_le_bytes(&self.pending[..width]);
        self.pending.drain(..width);
        self.state = ReassemblyState::Idle;

        log::info!("Score received: {}", score.value());
        Some(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ReassemblyConfig {
        ReassemblyConfig::new(4, 4, 4, 4)
    }

    /// Bytes 1..=16 followed by a score of 5
    fn small_stream() -> Vec<u8> {
        let mut stream: Vec<u8> = (1..=16).collect();
        stream.extend_from_slice(&[5, 0, 0, 0]);
        stream
    }

    fn expected_small_frame() -> GrayFrame {
        let mut pixels: Vec<u8> = (1..=15).collect();
        pixels.push(0);
        GrayFrame::from_pixels(4, 4, pixels).unwrap()
    }

    // =========================================================================
    // Score Decoding Tests
    // =========================================================================

    #[test]
    fn test_score_little_endian() {
        assert_eq!(Score::from_le_bytes(&[5, 0, 0, 0]), Score(5));
        assert_eq!(Score::from_le_bytes(&[0x34, 0x12]), Score(0x1234));
        assert_eq!(Score::from_le_bytes(&[0, 0, 0, 1]), Score(0x0100_0000));
        assert_eq!(Score::from_le_bytes(&[]), Score(0));
    }

    #[test]
    fn test_score_detected() {
        assert!(!Score(0).detected());
        assert!(Score(1).detected());
    }

    // =========================================================================
    // FrameAssembler Tests
    // =========================================================================

    #[test]
    fn test_assembler_creation() {
        let assembler = FrameAssembler::new(small_config());
        assert_eq!(assembler.state(), ReassemblyState::AwaitingImage);
        assert_eq!(assembler.pixel_index(), None);
        assert_eq!(assembler.pending_len(), 0);
        assert_eq!(assembler.progress(), 0.0);
    }

    #[test]
    fn test_bulk_stream_emits_image_then_score() {
        let mut assembler = FrameAssembler::new(small_config());

        let events = assembler.process_packet(&small_stream());

        assert_eq!(
            events,
            vec![
                AssemblyEvent::ImageReady(expected_small_frame()),
                AssemblyEvent::ScoreReady(Score(5)),
            ]
        );
        assert_eq!(assembler.state(), ReassemblyState::Idle);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_single_byte_fragments_match_bulk() {
        let mut assembler = FrameAssembler::new(small_config());

        let mut events = Vec::new();
        for byte in small_stream() {
            events.extend(assembler.process_packet(&[byte]));
        }

        assert_eq!(
            events,
            vec![
                AssemblyEvent::ImageReady(expected_small_frame()),
                AssemblyEvent::ScoreReady(Score(5)),
            ]
        );
    }

    #[test]
    fn test_image_ready_fires_on_final_byte() {
        let mut assembler = FrameAssembler::new(small_config());
        let stream = small_stream();

        assert!(assembler.process_packet(&stream[..15]).is_empty());
        assert_eq!(assembler.pixel_index(), Some(14));

        let events = assembler.process_packet(&stream[15..16]);
        assert!(matches!(events.as_slice(), [AssemblyEvent::ImageReady(_)]));
        assert_eq!(assembler.state(), ReassemblyState::AwaitingScore);
        assert_eq!(assembler.pixel_index(), Some(15));
    }

    #[test]
    fn test_one_short_of_boundary_stays_awaiting_image() {
        let config = ReassemblyConfig::new(8, 8, 5, 4);
        let mut assembler = FrameAssembler::new(config);

        let events = assembler.process_packet(&vec![0x7F; 63]);

        assert!(events.is_empty());
        assert_eq!(assembler.state(), ReassemblyState::AwaitingImage);
        assert_eq!(assembler.pixel_index(), Some(62));
    }

    #[test]
    fn test_leftover_chunk_bytes_start_the_score() {
        // Boundary lands mid-chunk: the score bytes share a chunk with pixels
        let config = ReassemblyConfig::new(3, 3, 6, 2);
        let mut assembler = FrameAssembler::new(config);
        let mut stream = vec![9u8; 9];
        stream.extend_from_slice(&[0x02, 0x01]);

        let events = assembler.process_packet(&stream);

        assert_eq!(events.len(), 2);
        assert_eq!(events[1], AssemblyEvent::ScoreReady(Score(0x0102)));
    }

    #[test]
    fn test_partial_score_waits_for_more_bytes() {
        let mut assembler = FrameAssembler::new(small_config());
        let stream = small_stream();

        assembler.process_packet(&stream[..18]);
        assert_eq!(assembler.state(), ReassemblyState::AwaitingScore);
        assert_eq!(assembler.pending_len(), 2);

        let events = assembler.process_packet(&stream[18..]);
        assert_eq!(events, vec![AssemblyEvent::ScoreReady(Score(5))]);
    }

    #[test]
    fn test_store_final_pixel_policy() {
        let mut config = small_config();
        config.boundary = BoundaryPolicy::StoreFinalPixel;
        let mut assembler = FrameAssembler::new(config);

        let events = assembler.process_packet(&small_stream());

        let expected: Vec<u8> = (1..=16).collect();
        match &events[0] {
            AssemblyEvent::ImageReady(frame) => assert_eq!(frame.pixels(), expected.as_slice()),
            other => panic!("expected image, got {:?}", other),
        }
        assert_eq!(events[1], AssemblyEvent::ScoreReady(Score(5)));
    }

    #[test]
    fn test_empty_fragment_is_harmless() {
        let mut assembler = FrameAssembler::new(small_config());
        assert!(assembler.process_packet(&[]).is_empty());
        assert_eq!(assembler.pixel_index(), None);
    }

    #[test]
    fn test_zero_chunk_size_still_drains() {
        let mut assembler = FrameAssembler::new(ReassemblyConfig::new(4, 4, 0, 4));

        let events = assembler.process_packet(&small_stream());

        assert_eq!(events.len(), 2);
        assert_eq!(assembler.state(), ReassemblyState::Idle);
    }

    #[test]
    fn test_idle_holds_trailing_bytes() {
        let mut assembler = FrameAssembler::new(small_config());
        let mut stream = small_stream();
        stream.extend_from_slice(&[0xEE, 0xEE]);

        let events = assembler.process_packet(&stream);

        assert_eq!(events.len(), 2);
        assert_eq!(assembler.state(), ReassemblyState::Idle);
        assert_eq!(assembler.pending_len(), 2);
        assert!(assembler.process_packet(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut assembler = FrameAssembler::new(small_config());
        assembler.process_packet(&[1, 2, 3, 4, 5, 6]);

        assembler.reset();

        assert_eq!(assembler.state(), ReassemblyState::AwaitingImage);
        assert_eq!(assembler.pixel_index(), None);
        assert_eq!(assembler.pending_len(), 0);
        assert!(assembler.frame().pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut once = FrameAssembler::new(small_config());
        once.process_packet(&small_stream()[..10]);
        once.reset();

        let mut twice = FrameAssembler::new(small_config());
        twice.process_packet(&small_stream()[..10]);
        twice.reset();
        twice.reset();

        assert_eq!(once.state(), twice.state());
        assert_eq!(once.pixel_index(), twice.pixel_index());
        assert_eq!(once.pending_len(), twice.pending_len());
        assert_eq!(once.frame(), twice.frame());
    }

    #[test]
    fn test_second_cycle_after_reset() {
        let mut assembler = FrameAssembler::new(small_config());
        assembler.process_packet(&small_stream());
        assembler.reset();

        let mut stream: Vec<u8> = vec![200; 16];
        stream.extend_from_slice(&[0, 0, 0, 0]);
        let events = assembler.process_packet(&stream);

        assert_eq!(events.len(), 2);
        assert_eq!(events[1], AssemblyEvent::ScoreReady(Score(0)));
        assert_eq!(assembler.frame().get(0, 0), Some(200));
        assert_eq!(assembler.frame().get(3, 3), Some(0));
    }

    #[test]
    fn test_progress_tracks_pixels() {
        let mut assembler = FrameAssembler::new(small_config());
        assembler.process_packet(&[1; 8]);
        assert!((assembler.progress() - 0.5).abs() < f32::EPSILON);
        assembler.process_packet(&[1; 8]);
        assert!((assembler.progress() - 1.0).abs() < f32::EPSILON);
    }
}
