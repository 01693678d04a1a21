//! Notification recording for offline analysis and replay.
//!
//! Records raw notification fragments exactly as the transport delivered
//! them, so a capture can later be replayed through the reassembler with
//! the same fragmentation.
//!
//! # File Format
//!
//! - `capture_<millis>_<seq>.bin`: `[u64 LE: timestamp_us][u32 LE: length][bytes: data]...`
//! - `capture_<millis>_<seq>.json`: device and geometry metadata
//!
//! `<seq>` counts recordings per recorder, so two captures saved within the
//! same millisecond get distinct names.
//!
//! # Example
//!
//! ```ignore
//! let recorder = PacketRecorder::new();
//! recorder.start_recording(CaptureMetadata::for_config(&config.reassembly))?;
//!
//! // In the notification callback:
//! recorder.record_packet(&fragment);
//!
//! // When done:
//! let result = recorder.stop_recording(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::config::{BoundaryPolicy, ReassemblyConfig};

/// Upper bound on a single recorded fragment
const MAX_PACKET_LEN: usize = 1024 * 1024;

/// Errors that can occur while recording or reading captures.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Recording is not active when trying to stop.
    #[error("recording is not active")]
    NotActive,

    /// Recording is already active when trying to start.
    #[error("recording is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Corrupted record in a capture file.
    #[error("invalid packet data at offset {offset}: {message}")]
    InvalidPacket {
        /// Byte offset of the bad record.
        offset: u64,
        /// Description of the problem.
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata stored next to a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Advertised name of the recorded device.
    #[serde(default)]
    pub device_name: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Chunk size the capture was taken with.
    pub chunk_size: usize,
    /// Score width in bytes.
    pub score_width: usize,
    /// Boundary policy in effect.
    #[serde(default)]
    pub boundary: BoundaryPolicy,
    /// Total fragments recorded.
    #[serde(default)]
    pub total_packets: u64,
    /// Completed image + score cycles.
    #[serde(default)]
    pub total_cycles: u64,
    /// Recording duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes recorded.
    #[serde(default)]
    pub total_bytes: u64,
    /// Free-form notes.
    #[serde(default)]
    pub description: String,
}

impl Default for CaptureMetadata {
    fn default() -> Self {
        Self::for_config(&ReassemblyConfig::default())
    }
}

impl CaptureMetadata {
    /// Metadata describing a capture taken with `config`
    pub fn for_config(config: &ReassemblyConfig) -> Self {
        Self {
            device_name: String::new(),
            width: config.width,
            height: config.height,
            chunk_size: config.chunk_size,
            score_width: config.score_width,
            boundary: config.boundary,
            total_packets: 0,
            total_cycles: 0,
            duration_ms: 0,
            total_bytes: 0,
            description: String::new(),
        }
    }

    /// Reassembly geometry this capture should be replayed with
    pub fn reassembly_config(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            width: self.width,
            height: self.height,
            chunk_size: self.chunk_size,
            score_width: self.score_width,
            boundary: self.boundary,
        }
    }
}

/// One recorded notification fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPacket {
    /// Time since recording started (microseconds).
    pub timestamp_us: u64,
    /// Raw fragment bytes.
    pub data: Vec<u8>,
}

/// Paths and summary returned when recording stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved packet file.
    pub packets_path: String,
    /// Path to the saved metadata file.
    pub metadata_path: String,
    /// Summary of the recording.
    pub metadata: CaptureMetadata,
}

/// Thread-safe recorder for notification fragments.
///
/// `record_packet` is called from the ingestor under the session lock, so
/// the fast path only touches atomics unless recording is active.
pub struct PacketRecorder {
    /// Whether recording is currently active.
    is_recording: AtomicBool,
    /// Recorded fragments.
    packets: Mutex<Vec<RecordedPacket>>,
    /// When recording started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the recording.
    metadata: Mutex<CaptureMetadata>,
    /// Fragment counter (lock-free).
    packet_count: AtomicU64,
    /// Byte counter (lock-free).
    byte_count: AtomicU64,
    /// Recordings saved so far, used in file names.
    sequence: AtomicU64,
}

impl PacketRecorder {
    /// Creates a recorder with no active recording.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_recording: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns whether recording is active.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    /// Returns the number of fragments recorded so far.
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes recorded so far.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new recording.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a recording is in progress.
    /// Returns `CaptureError::LockError` if the internal mutex cannot be acquired.
    pub fn start_recording(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_recording
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.packets
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.packet_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());

        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Notification recording started");
        Ok(())
    }

    /// Records one fragment. Ignored unless recording is active.
    pub fn record_packet(&self, packet: &[u8]) {
        if !self.is_recording.load(Ordering::Acquire) {
            return;
        }

        let timestamp_us = self
            .start_time
            .lock()
            .ok()
            .and_then(|t| *t)
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(packet.len() as u64, Ordering::Relaxed);

        if let Ok(mut packets) = self.packets.lock() {
            packets.push(RecordedPacket {
                timestamp_us,
                data: packet.to_vec(),
            });
        } else {
            log::warn!("Failed to acquire lock for packet recording");
        }
    }

    /// Counts a completed image + score cycle.
    pub fn record_cycle(&self) {
        if !self.is_recording.load(Ordering::Acquire) {
            return;
        }

        if let Ok(mut meta) = self.metadata.lock() {
            meta.total_cycles += 1;
        }
    }

    /// Stops recording and writes the capture to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no recording is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_recording(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_recording
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.exists() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let total_packets = self.packet_count.load(Ordering::Acquire);
        let total_bytes = self.byte_count.load(Ordering::Acquire);

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_packets = total_packets;
            meta.total_bytes = total_bytes;
            meta.clone()
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let packets_path = output_dir.join(format!("capture_{}_{:03}.bin", timestamp, sequence));
        let metadata_path = packets_path.with_extension("json");

        {
            let packets = self
                .packets
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            write_packets(&packets_path, &packets)?;
        }
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Recording stopped: {} packets, {} bytes, {} cycles, {} ms",
            total_packets,
            total_bytes,
            metadata.total_cycles,
            duration_ms
        );

        Ok(CaptureResult {
            packets_path: packets_path.display().to_string(),
            metadata_path: metadata_path.display().to_string(),
            metadata,
        })
    }

    /// Cancels the current recording without saving.
    pub fn cancel_recording(&self) {
        self.is_recording.store(false, Ordering::Release);
        if let Ok(mut packets) = self.packets.lock() {
            packets.clear();
        }
        log::info!("Recording cancelled");
    }
}

impl Default for PacketRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// File Utilities
// =============================================================================

/// Writes fragments in the capture file format.
///
/// # Errors
///
/// Returns `CaptureError::Io` if file operations fail.
pub fn write_packets(path: &Path, packets: &[RecordedPacket]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);

    for packet in packets {
        file.write_all(&packet.timestamp_us.to_le_bytes())?;
        file.write_all(&(packet.data.len() as u32).to_le_bytes())?;
        file.write_all(&packet.data)?;
    }

    file.flush()?;
    log::debug!("Saved {} packets to {}", packets.len(), path.display());
    Ok(())
}

/// Reads fragments from a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read and
/// `CaptureError::InvalidPacket` if a record is truncated or oversized.
pub fn read_packets(path: &Path) -> Result<Vec<RecordedPacket>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut packets = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }
        let timestamp_us = u64::from_le_bytes(timestamp_bytes);

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| CaptureError::InvalidPacket {
                offset,
                message: "unexpected EOF reading packet length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_PACKET_LEN {
            return Err(CaptureError::InvalidPacket {
                offset,
                message: format!("packet length {} exceeds 1MB limit", len),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidPacket {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        packets.push(RecordedPacket { timestamp_us, data });
        offset += 8 + 4 + len as u64;
    }

    Ok(packets)
}

/// Writes capture metadata as pretty JSON.
///
/// # Errors
///
/// Returns `CaptureError::Json` or `CaptureError::Io` on failure.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
