//! Notification replay for testing without the camera.
//!
//! Loads a recording written by [`crate::capture::PacketRecorder`] and feeds
//! its fragments back through a [`PacketIngestor`] with the recorded timing,
//! or runs them straight through a [`FrameAssembler`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use nano_detect_lib::replay::replay_all_outcomes;
//!
//! let outcomes = replay_all_outcomes(Path::new("capture_1700000000000.bin"))?;
//! for outcome in outcomes {
//!     println!("score {}", outcome.score.value());
//! }
//! ```

use std::collections::VecDeque;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{read_metadata, read_packets, CaptureError, CaptureMetadata, RecordedPacket};
use crate::config::{AppConfig, ConfigError, ReassemblyConfig};
use crate::frame_assembler::{AssemblyEvent, FrameAssembler, ReassemblyState};
use crate::gray_frame::GrayFrame;
use crate::session::{CaptureOutcome, PacketIngestor};
use crate::transport::{self, Advertisement, Started, Transport, TransportError};

/// Errors that can occur during replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// The recorded geometry cannot drive a reassembler.
    #[error("invalid replay geometry: {0}")]
    Config(#[from] ConfigError),

    /// Replay is already running.
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running.
    #[error("replay is not running")]
    NotRunning,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 0.0 = as fast as possible).
    pub speed: f64,
    /// Restart from the first fragment after the last one.
    pub loop_playback: bool,
    /// Geometry override (default: from metadata, else built-in defaults).
    pub reassembly: Option<ReassemblyConfig>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
            reassembly: None,
        }
    }
}

/// A loaded recording ready to be replayed.
#[derive(Debug, Clone)]
pub struct PacketReplay {
    packets: Vec<RecordedPacket>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
}

impl PacketReplay {
    /// Load a recording and its companion `.json` metadata, if present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the packet file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let packets = read_packets(path)?;
        let metadata = Self::try_load_metadata(path);

        log::info!("Loaded {} packets from {}", packets.len(), path.display());
        if let Some(meta) = &metadata {
            log::info!(
                "Metadata: {}x{} chunk {} score {}B, {} cycles, {} ms",
                meta.width,
                meta.height,
                meta.chunk_size,
                meta.score_width,
                meta.total_cycles,
                meta.duration_ms
            );
        }

        Ok(Self {
            packets,
            metadata,
            config: ReplayConfig::default(),
        })
    }

    /// Load a recording with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet file cannot be read.
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut replay = Self::load(path)?;
        replay.config = config;
        Ok(replay)
    }

    /// Build a replay from fragments already in memory
    pub fn from_packets(packets: Vec<RecordedPacket>, metadata: Option<CaptureMetadata>) -> Self {
        Self {
            packets,
            metadata,
            config: ReplayConfig::default(),
        }
    }

    fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
        let json_path = path.with_extension("json");
        if !json_path.exists() {
            return None;
        }
        match read_metadata(&json_path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
                None
            }
        }
    }

    /// Loaded metadata, if any
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Number of loaded fragments
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Span of the recording in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.packets
            .last()
            .map(|p| p.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Replace the replay configuration
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Geometry to reassemble with: override, then metadata, then defaults.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Config` if the chosen geometry is invalid, e.g.
    /// a hand-edited metadata file with a zero chunk size.
    pub fn reassembly_config(&self) -> Result<ReassemblyConfig> {
        let config = self
            .config
            .reassembly
            .or_else(|| self.metadata.as_ref().map(CaptureMetadata::reassembly_config))
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Whether the recording carries its own geometry
    pub fn has_geometry(&self) -> bool {
        self.config.reassembly.is_some() || self.metadata.is_some()
    }

    /// Deliver the fragments to `ingestor` from a background thread.
    pub fn spawn(&self, ingestor: PacketIngestor) -> ReplayHandle {
        let (stop_tx, stop_rx) = mpsc::channel();
        let packets = self.packets.clone();
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            Self::replay_thread(packets, config, ingestor, stop_rx);
        });

        log::info!("Packet replay started");
        ReplayHandle {
            thread_handle: Some(handle),
            stop_sender: Some(stop_tx),
        }
    }

    fn replay_thread(
        packets: Vec<RecordedPacket>,
        config: ReplayConfig,
        ingestor: PacketIngestor,
        stop_rx: Receiver<()>,
    ) {
        loop {
            let replay_start = Instant::now();

            for packet in &packets {
                if stop_rx.try_recv().is_ok() {
                    log::debug!("Replay thread received stop signal");
                    return;
                }

                if config.speed > 0.0 {
                    let expected_elapsed =
                        Duration::from_micros((packet.timestamp_us as f64 / config.speed) as u64);
                    let actual_elapsed = replay_start.elapsed();

                    if expected_elapsed > actual_elapsed {
                        // Sleep in small slices to stay responsive to stop
                        let slice = Duration::from_millis(10);
                        let mut remaining = expected_elapsed - actual_elapsed;
                        while remaining > Duration::ZERO {
                            if stop_rx.try_recv().is_ok() {
                                return;
                            }
                            let sleep = remaining.min(slice);
                            thread::sleep(sleep);
                            remaining = remaining.saturating_sub(sleep);
                        }
                    }
                }

                ingestor.on_packet(&packet.data);
            }

            if config.loop_playback {
                log::debug!("Replay loop completed, restarting");
            } else {
                log::debug!("Replay completed");
                break;
            }
        }
    }
}

/// Running replay thread
pub struct ReplayHandle {
    thread_handle: Option<JoinHandle<()>>,
    stop_sender: Option<Sender<()>>,
}

impl ReplayHandle {
    /// Whether the thread is still attached
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stop the replay thread and wait for it.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if already stopped.
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_sender.take().ok_or(ReplayError::NotRunning)?;
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;

        // The thread may already have finished and dropped its receiver
        let _ = stop_tx.send(());
        handle.join().map_err(|_| ReplayError::NotRunning)?;

        log::info!("Packet replay stopped");
        Ok(())
    }
}

impl Drop for ReplayHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Replay a recording synchronously and collect every completed cycle.
///
/// The assembler is reset after each score, so multi-cycle recordings yield
/// one outcome per cycle.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded or its geometry is
/// invalid.
pub fn replay_all_outcomes(path: &Path) -> Result<Vec<CaptureOutcome>> {
    let replay = PacketReplay::load(path)?;
    Ok(OutcomeIterator::from_replay(&replay)?.collect())
}

/// Lazily reassembles outcomes from a recording
pub struct OutcomeIterator {
    packets: std::vec::IntoIter<RecordedPacket>,
    assembler: FrameAssembler,
    frame: Option<GrayFrame>,
    ready: VecDeque<CaptureOutcome>,
}

impl OutcomeIterator {
    /// Create an iterator over a recording file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded or its geometry is
    /// invalid.
    pub fn new(path: &Path) -> Result<Self> {
        let replay = PacketReplay::load(path)?;
        Self::from_replay(&replay)
    }

    /// Create an iterator over an already loaded replay.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Config` if the replay geometry is invalid.
    pub fn from_replay(replay: &PacketReplay) -> Result<Self> {
        Ok(Self {
            packets: replay.packets.clone().into_iter(),
            assembler: FrameAssembler::new(replay.reassembly_config()?),
            frame: None,
            ready: VecDeque::new(),
        })
    }
}

impl Iterator for OutcomeIterator {
    type Item = CaptureOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(outcome) = self.ready.pop_front() {
                return Some(outcome);
            }

            let packet = self.packets.next()?;
            for event in self.assembler.process_packet(&packet.data) {
                match event {
                    AssemblyEvent::ImageReady(frame) => self.frame = Some(frame),
                    AssemblyEvent::ScoreReady(score) => {
                        if let Some(frame) = self.frame.take() {
                            self.ready.push_back(CaptureOutcome { frame, score });
                        }
                    }
                }
            }

            // Bytes trailing the score are discarded, as the live session does
            if self.assembler.state() == ReassemblyState::Idle {
                self.assembler.reset();
            }
        }
    }
}

/// Transport that plays a recording back as notifications
pub struct ReplayTransport {
    replay: PacketReplay,
    advertisement: Advertisement,
    connected: bool,
    running: Option<ReplayHandle>,
}

impl ReplayTransport {
    /// Wrap a loaded replay; scans report one device named after the
    /// recording's metadata.
    pub fn new(replay: PacketReplay) -> Self {
        let name = replay
            .metadata()
            .map(|m| m.device_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| transport::CAMERA_DEVICE_NAME.to_string());

        Self {
            replay,
            advertisement: Advertisement {
                address: "replay".to_string(),
                name: Some(name),
                service_uuids: vec![transport::CAMERA_SERVICE_UUID.to_string()],
            },
            connected: false,
            running: None,
        }
    }

    /// Load a recording from disk.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn load(path: &Path, config: ReplayConfig) -> Result<Self> {
        Ok(Self::new(PacketReplay::load_with_config(path, config)?))
    }

    /// Replay being played
    pub fn replay(&self) -> &PacketReplay {
        &self.replay
    }

    /// Make `config` reassemble with the recording's geometry.
    ///
    /// Leaves `config` untouched when the recording has no metadata and no
    /// override.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Config` if the recorded geometry is invalid.
    pub fn apply_geometry(&self, config: &mut AppConfig) -> Result<()> {
        if !self.replay.has_geometry() {
            return Ok(());
        }

        let recorded = self.replay.reassembly_config()?;
        if recorded != config.reassembly {
            log::info!(
                "Using recorded geometry {}x{} chunk {} score {}B",
                recorded.width,
                recorded.height,
                recorded.chunk_size,
                recorded.score_width
            );
            config.reassembly = recorded;
        }
        Ok(())
    }
}

impl Transport for ReplayTransport {
    async fn scan(&mut self) -> transport::Result<Vec<Advertisement>> {
        Ok(vec![self.advertisement.clone()])
    }

    async fn connect(&mut self, device: &Advertisement) -> transport::Result<()> {
        if device.address != self.advertisement.address {
            return Err(TransportError::Connect(format!(
                "unknown device {}",
                device.address
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn start_notify(
        &mut self,
        characteristic: &str,
        ingestor: PacketIngestor,
    ) -> transport::Result<Started> {
        if !self.connected {
            return Err(TransportError::NotifyFailed("not connected".to_string()));
        }
        if self.running.is_some() {
            return Err(TransportError::NotifyFailed(
                "notifications already running".to_string(),
            ));
        }

        self.running = Some(self.replay.spawn(ingestor));
        Ok(Started {
            characteristic: characteristic.to_string(),
        })
    }

    async fn stop_notify(&mut self, _characteristic: &str) -> transport::Result<()> {
        if let Some(mut handle) = self.running.take() {
            let _ = handle.stop();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> transport::Result<()> {
        if let Some(mut handle) = self.running.take() {
            let _ = handle.stop();
        }
        self.connected = false;
        Ok(())
    }
}
