//! Capture session shared between the transport callback and the driver.
//!
//! The assembler (pending bytes, frame, cursor and state) sits behind one
//! mutex. The transport gets a cloneable [`PacketIngestor`] whose
//! `on_packet` appends and drains under that lock, then forwards events over
//! an unbounded channel. The driver awaits [`CaptureSession::wait_for_outcome`]
//! instead of polling.
//!
//! # Example
//!
//! ```ignore
//! let mut session = CaptureSession::new(ReassemblyConfig::default(), Duration::from_secs(30))?;
//! let ingestor = session.begin()?;
//! transport.start_notify(CHAR_UUID, ingestor).await?;
//! let outcome = session.wait_for_outcome().await?;
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::capture::{CaptureError, PacketRecorder};
use crate::config::{ConfigError, ReassemblyConfig};
use crate::frame_assembler::{AssemblyEvent, FrameAssembler, ReassemblyState, Score};
use crate::gray_frame::GrayFrame;
use crate::transport::TransportError;

/// Errors that end a capture session early.
///
/// Every variant is recoverable: the session is reset and the next cycle may
/// begin.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No fragment arrived within the idle window.
    #[error("no data for {idle_ms} ms ({received} of {expected} pixels received)")]
    IdleTimeout {
        /// Configured idle window in milliseconds.
        idle_ms: u64,
        /// Pixel slots consumed before the stall.
        received: usize,
        /// Pixel slots in a full frame.
        expected: usize,
    },

    /// The event channel closed before the score arrived.
    #[error("session event channel closed")]
    ChannelClosed,

    /// `wait_for_outcome` was called without `begin`.
    #[error("session has not been started")]
    NotStarted,

    /// No advertisement matched the device filter.
    #[error("no device matching {0}")]
    DeviceNotFound(String),

    /// Transport lifecycle call failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session geometry is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The notification recorder could not be set up.
    #[error("recording error: {0}")]
    Recording(#[from] CaptureError),

    /// Failed to acquire lock on the shared assembler.
    #[error("failed to acquire lock: {0}")]
    LockError(String),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Finished image and score, delivered together
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    /// Reassembled frame
    pub frame: GrayFrame,
    /// Score that followed the frame
    pub score: Score,
}

impl CaptureOutcome {
    /// Whether the device reported a detection (`score > 0`)
    pub fn detected(&self) -> bool {
        self.score.detected()
    }
}

/// Event forwarded from the ingestor to the waiting driver
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A fragment was appended
    Fragment {
        /// Fragment length in bytes
        len: usize,
        /// Pixel progress after draining, `0.0..=1.0`
        progress: f32,
    },
    /// The assembler produced an event
    Assembled(AssemblyEvent),
}

/// Point-in-time view of the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current cycle position
    pub state: ReassemblyState,
    /// Last consumed pixel slot
    pub pixel_index: Option<usize>,
    /// Bytes waiting to be consumed
    pub pending: usize,
}

/// State guarded by the session lock
struct Shared {
    assembler: FrameAssembler,
    /// Incremented on every begin/abort; stale ingestors are ignored
    generation: u64,
    events: Option<UnboundedSender<SessionEvent>>,
    recorder: Option<Arc<PacketRecorder>>,
}

/// Handle given to the transport for delivering notification fragments
#[derive(Clone)]
pub struct PacketIngestor {
    shared: Arc<Mutex<Shared>>,
    generation: u64,
}

impl PacketIngestor {
    /// Deliver one notification fragment.
    ///
    /// Safe to call from any thread. Holds the session lock only for the
    /// append and drain; never performs I/O. Fragments from a session that
    /// has since been reset, or arriving after the score, are dropped.
    pub fn on_packet(&self, fragment: &[u8]) {
        let Ok(mut shared) = self.shared.lock() else {
            log::warn!("Failed to acquire session lock, dropping fragment");
            return;
        };

        if shared.generation != self.generation {
            log::debug!(
                "Dropping {} byte fragment from a finished session",
                fragment.len()
            );
            return;
        }

        if shared.assembler.state() == ReassemblyState::Idle {
            log::debug!(
                "Dropping {} byte fragment after the score",
                fragment.len()
            );
            return;
        }

        if let Some(recorder) = &shared.recorder {
            recorder.record_packet(fragment);
        }

        let events = shared.assembler.process_packet(fragment);
        let progress = shared.assembler.progress();

        if let Some(tx) = &shared.events {
            // A closed receiver only means nobody is waiting any more
            let _ = tx.send(SessionEvent::Fragment {
                len: fragment.len(),
                progress,
            });
            for event in events {
                let _ = tx.send(SessionEvent::Assembled(event));
            }
        }
    }
}

/// One capture context: the assembler plus the channel the driver waits on
pub struct CaptureSession {
    shared: Arc<Mutex<Shared>>,
    events: Option<UnboundedReceiver<SessionEvent>>,
    idle_timeout: Duration,
    pixel_count: usize,
}

impl CaptureSession {
    /// Create a session for the given geometry.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Config` if the geometry is invalid.
    pub fn new(config: ReassemblyConfig, idle_timeout: Duration) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                assembler: FrameAssembler::new(config),
                generation: 0,
                events: None,
                recorder: None,
            })),
            events: None,
            idle_timeout,
            pixel_count: config.pixel_count(),
        })
    }

    /// Record every accepted fragment into `recorder`
    pub fn set_recorder(&mut self, recorder: Arc<PacketRecorder>) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.recorder = Some(recorder);
        }
    }

    /// Idle window applied by `wait_for_outcome`
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Reset the assembler and open a fresh event channel.
    ///
    /// Returns the ingestor the transport should feed. Ingestors from
    /// earlier sessions stop having any effect.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::LockError` if the session lock is poisoned.
    pub fn begin(&mut self) -> Result<PacketIngestor> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|e| SessionError::LockError(e.to_string()))?;

        shared.assembler.reset();
        shared.generation += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        shared.events = Some(tx);
        self.events = Some(rx);

        log::debug!("Capture session {} started", shared.generation);

        Ok(PacketIngestor {
            shared: Arc::clone(&self.shared),
            generation: shared.generation,
        })
    }

    /// Abandon the current session and reset the assembler
    pub fn abort(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.assembler.reset();
            shared.generation += 1;
            shared.events = None;
        } else {
            log::warn!("Failed to acquire session lock during abort");
        }
        self.events = None;
    }

    /// Current assembler state.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::LockError` if the session lock is poisoned.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        let shared = self
            .shared
            .lock()
            .map_err(|e| SessionError::LockError(e.to_string()))?;

        Ok(SessionSnapshot {
            state: shared.assembler.state(),
            pixel_index: shared.assembler.pixel_index(),
            pending: shared.assembler.pending_len(),
        })
    }

    /// Wait until the score arrives, returning the frame and score together.
    ///
    /// The wait is keyed on events, not polling. If no fragment arrives for
    /// the idle window the session is aborted.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotStarted` without a prior `begin`,
    /// `SessionError::IdleTimeout` on a stall, or
    /// `SessionError::ChannelClosed` if the session was aborted elsewhere.
    pub async fn wait_for_outcome(&mut self) -> Result<CaptureOutcome> {
        let idle = self.idle_timeout;
        let mut frame = None;
        let mut next_report = 0.25f32;

        loop {
            let next = {
                let rx = self.events.as_mut().ok_or(SessionError::NotStarted)?;
                tokio::time::timeout(idle, rx.recv()).await
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.abort();
                    return Err(SessionError::ChannelClosed);
                }
                Err(_) => {
                    let received = self
                        .snapshot()
                        .ok()
                        .and_then(|s| s.pixel_index)
                        .map_or(0, |i| i + 1);
                    log::warn!(
                        "Session stalled after {} of {} pixels, resetting",
                        received,
                        self.pixel_count
                    );
                    self.abort();
                    return Err(SessionError::IdleTimeout {
                        idle_ms: idle.as_millis() as u64,
                        received,
                        expected: self.pixel_count,
                    });
                }
            };

            match event {
                SessionEvent::Fragment { len, progress } => {
                    log::trace!("Fragment: {} bytes", len);
                    while progress >= next_report && next_report <= 1.0 {
                        log::info!("Receiving image: {:.0}%", next_report * 100.0);
                        next_report += 0.25;
                    }
                }
                SessionEvent::Assembled(AssemblyEvent::ImageReady(image)) => {
                    frame = Some(image);
                }
                SessionEvent::Assembled(AssemblyEvent::ScoreReady(score)) => {
                    let Some(frame) = frame.take() else {
                        // The assembler only scores after an image
                        log::warn!("Score {} arrived without an image", score.value());
                        continue;
                    };
                    self.events = None;
                    return Ok(CaptureOutcome { frame, score });
                }
            }
        }
    }
}
