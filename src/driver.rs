//! One capture cycle from scan to detection report.
//!
//! The driver owns the session, the transport and both sinks. Each call to
//! [`CaptureDriver::run_cycle`] scans for the camera, connects, enables
//! notifications (retrying once after a fixed backoff), waits for the frame
//! and score, disconnects, then uploads the frame as PNG and reports the
//! detection flag. Sink failures are logged and returned in the
//! [`CycleReport`]; they never stop the next cycle.

use std::path::PathBuf;
use std::sync::Arc;

use crate::capture::{CaptureError, CaptureMetadata, PacketRecorder};
use crate::config::AppConfig;
use crate::frame_assembler::Score;
use crate::frame_validation::{validate_gray_frame, ValidationResult};
use crate::session::{CaptureOutcome, CaptureSession, Result, SessionError};
use crate::sinks::{DetectionSink, DetectionStatus, SinkError, UploadSink};
use crate::transport::{Advertisement, Started, Transport};

/// What happened during one completed cycle
#[derive(Debug)]
pub struct CycleReport {
    /// Score sent after the image
    pub score: Score,
    /// `score > 0`
    pub detected: bool,
    /// Frame sanity checks
    pub validation: ValidationResult,
    /// Result of the image upload
    pub upload: std::result::Result<(), SinkError>,
    /// Result of the detection report
    pub detection: std::result::Result<(), SinkError>,
    /// Recording written for this cycle, if recording is enabled
    pub recording: Option<PathBuf>,
}

impl CycleReport {
    /// Both sinks accepted their payloads
    pub fn delivered(&self) -> bool {
        self.upload.is_ok() && self.detection.is_ok()
    }
}

/// Runs capture cycles against a transport and two sinks
pub struct CaptureDriver<T, U, D> {
    config: AppConfig,
    session: CaptureSession,
    transport: T,
    upload: U,
    detection: D,
    recorder: Option<Arc<PacketRecorder>>,
    cycles: u64,
}

impl<T, U, D> CaptureDriver<T, U, D>
where
    T: Transport,
    U: UploadSink,
    D: DetectionSink,
{
    /// Create a driver.
    ///
    /// When `config.record_dir` is set the directory is created and every
    /// cycle's fragments are saved there.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Config` for invalid geometry or timeouts, or
    /// `SessionError::Recording` if the record directory cannot be created.
    pub fn new(config: AppConfig, transport: T, upload: U, detection: D) -> Result<Self> {
        config.validate()?;
        let mut session = CaptureSession::new(config.reassembly, config.idle_timeout())?;

        let recorder = match &config.record_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(CaptureError::from)?;
                let recorder = Arc::new(PacketRecorder::new());
                session.set_recorder(Arc::clone(&recorder));
                log::info!("Recording notifications to {}", dir.display());
                Some(recorder)
            }
            None => None,
        };

        Ok(Self {
            config,
            session,
            transport,
            upload,
            detection,
            recorder,
            cycles: 0,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Underlying session
    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// Transport in use
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport between cycles
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Image upload sink
    pub fn upload_sink(&self) -> &U {
        &self.upload
    }

    /// Detection-status sink
    pub fn detection_sink(&self) -> &D {
        &self.detection
    }

    /// Number of cycles that produced a frame and score
    pub fn cycles_completed(&self) -> u64 {
        self.cycles
    }

    /// Run one full capture cycle.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::DeviceNotFound` when no advertisement matches,
    /// `SessionError::Transport` when connecting or enabling notifications
    /// fails twice, or `SessionError::IdleTimeout` when the stream stalls.
    /// The session is reset in every case and the next cycle may run.
    /// Sink failures are not errors; see [`CycleReport`].
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let device = self.find_device().await?;
        log::info!(
            "Connecting to {} ({})",
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.address
        );
        self.transport.connect(&device).await?;
        self.start_recording(&device);

        let outcome = match self.receive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Capture failed: {}", e);
                self.session.abort();
                self.finish_recording();
                self.disconnect().await;
                return Err(e);
            }
        };

        self.disconnect().await;
        self.cycles += 1;
        if let Some(recorder) = &self.recorder {
            recorder.record_cycle();
        }
        let recording = self.finish_recording();

        Ok(self.deliver(outcome, recording).await)
    }

    async fn find_device(&mut self) -> Result<Advertisement> {
        log::info!("Scanning for {}", self.config.device.describe());
        let devices = self.transport.scan().await?;
        log::debug!("Scan returned {} advertisements", devices.len());

        devices
            .into_iter()
            .find(|adv| self.config.device.matches(adv))
            .ok_or_else(|| SessionError::DeviceNotFound(self.config.device.describe()))
    }

    /// Enable notifications and wait for the score
    async fn receive(&mut self) -> Result<CaptureOutcome> {
        let started = self.start_notify().await?;
        log::info!("Notifications started on {}", started.characteristic);

        let outcome = self.session.wait_for_outcome().await;

        if let Err(e) = self
            .transport
            .stop_notify(&self.config.notify_char_uuid)
            .await
        {
            log::warn!("Failed to stop notify: {}", e);
        }
        outcome
    }

    /// Start notifications, retrying once after the configured backoff
    async fn start_notify(&mut self) -> Result<Started> {
        let ingestor = self.session.begin()?;
        match self
            .transport
            .start_notify(&self.config.notify_char_uuid, ingestor)
            .await
        {
            Ok(started) => Ok(started),
            Err(first) => {
                let delay = self.config.notify_retry_delay();
                log::warn!(
                    "Failed to start notify: {}. Retrying in {} ms",
                    first,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;

                let ingestor = self.session.begin()?;
                let started = self
                    .transport
                    .start_notify(&self.config.notify_char_uuid, ingestor)
                    .await?;
                Ok(started)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            log::warn!("Failed to disconnect: {}", e);
        }
    }

    fn start_recording(&self, device: &Advertisement) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let metadata = CaptureMetadata {
            device_name: device.name.clone().unwrap_or_default(),
            ..CaptureMetadata::for_config(&self.config.reassembly)
        };
        if let Err(e) = recorder.start_recording(metadata) {
            log::warn!("Failed to start recording: {}", e);
        }
    }

    fn finish_recording(&self) -> Option<PathBuf> {
        let recorder = self.recorder.as_ref()?;
        let dir = self.config.record_dir.as_ref()?;
        match recorder.stop_recording(dir) {
            Ok(result) => Some(PathBuf::from(result.packets_path)),
            Err(e) => {
                log::warn!("Failed to save recording: {}", e);
                None
            }
        }
    }

    /// Validate, upload and report a finished capture
    async fn deliver(&self, outcome: CaptureOutcome, recording: Option<PathBuf>) -> CycleReport {
        let validation = validate_gray_frame(&outcome.frame, self.config.validation);
        if let Some(reason) = &validation.failure_reason {
            log::warn!("Frame failed validation: {}", reason);
        }

        let upload = match outcome.frame.encode_png() {
            Ok(png) => self.upload.upload_image(&png).await,
            Err(e) => Err(SinkError::from(e)),
        };
        match &upload {
            Ok(()) => log::info!("Image uploaded"),
            Err(e) => log::error!("Image upload failed: {}", e),
        }

        let detected = outcome.detected();
        let detection = self
            .detection
            .report_detection(DetectionStatus { detected })
            .await;
        match &detection {
            Ok(()) => log::info!("Detection status sent: {}", detected),
            Err(e) => log::error!("Detection status failed: {}", e),
        }

        CycleReport {
            score: outcome.score,
            detected,
            validation,
            upload,
            detection,
            recording,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReassemblyConfig;
    use crate::test_utils::{MemorySink, MockTransport, NotificationGenerator, TransportCall};
    use crate::transport::TransportError;

    fn small_config() -> AppConfig {
        AppConfig {
            reassembly: ReassemblyConfig::new(8, 8, 8, 4),
            idle_timeout_ms: 100,
            notify_retry_delay_ms: 5,
            ..AppConfig::default()
        }
    }

    fn camera(score: u64) -> MockTransport {
        let frame = NotificationGenerator::sequence_frame(8, 8);
        let fragments = NotificationGenerator::new(5).capture_fragments(&frame, score, 4);
        MockTransport::new(vec![MockTransport::camera_advertisement()], fragments)
    }

    #[tokio::test]
    async fn test_cycle_uploads_and_reports() {
        let sink = MemorySink::new();
        let mut driver =
            CaptureDriver::new(small_config(), camera(3), sink.clone(), sink.clone()).unwrap();

        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.score, Score(3));
        assert!(report.detected);
        assert!(report.delivered());
        assert_eq!(sink.uploads().len(), 1);
        assert_eq!(sink.detections(), vec![DetectionStatus { detected: true }]);
        assert_eq!(driver.cycles_completed(), 1);
        assert!(!driver.transport().is_connected());
    }

    #[tokio::test]
    async fn test_device_not_found() {
        let sink = MemorySink::new();
        let transport = MockTransport::new(vec![Advertisement::default()], vec![]);
        let mut driver =
            CaptureDriver::new(small_config(), transport, sink.clone(), sink).unwrap();

        let result = driver.run_cycle().await;

        assert!(matches!(result, Err(SessionError::DeviceNotFound(_))));
        assert_eq!(driver.transport().calls(), &[TransportCall::Scan]);
    }

    #[tokio::test]
    async fn test_notify_retried_once() {
        let sink = MemorySink::new();
        let mut driver = CaptureDriver::new(
            small_config(),
            camera(0).with_notify_failures(1),
            sink.clone(),
            sink.clone(),
        )
        .unwrap();

        let report = driver.run_cycle().await.unwrap();

        assert!(!report.detected);
        assert_eq!(driver.transport().notify_attempts(), 2);
    }

    #[tokio::test]
    async fn test_second_notify_failure_aborts() {
        let sink = MemorySink::new();
        let mut driver = CaptureDriver::new(
            small_config(),
            camera(1).with_notify_failures(2),
            sink.clone(),
            sink.clone(),
        )
        .unwrap();

        let result = driver.run_cycle().await;

        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::NotifyFailed(_)))
        ));
        assert_eq!(driver.transport().notify_attempts(), 2);
        assert_eq!(driver.transport().calls().last(), Some(&TransportCall::Disconnect));
        assert!(sink.uploads().is_empty());

        // The session is resettable: the next cycle succeeds
        let report = driver.run_cycle().await.unwrap();
        assert_eq!(report.score, Score(1));
    }

    #[tokio::test]
    async fn test_stall_times_out() {
        let sink = MemorySink::new();
        let mut driver = CaptureDriver::new(
            small_config(),
            camera(1).with_stall_after(20),
            sink.clone(),
            sink.clone(),
        )
        .unwrap();

        let result = driver.run_cycle().await;

        assert!(matches!(
            result,
            Err(SessionError::IdleTimeout { received: 20, expected: 64, .. })
        ));
        assert_eq!(driver.session().snapshot().unwrap().pixel_index, None);
    }

    #[tokio::test]
    async fn test_recording_written_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            record_dir: Some(dir.path().join("captures")),
            ..small_config()
        };
        let sink = MemorySink::new();
        let mut driver = CaptureDriver::new(config, camera(2), sink.clone(), sink).unwrap();

        let first = driver.run_cycle().await.unwrap().recording.unwrap();
        let second = driver.run_cycle().await.unwrap().recording.unwrap();

        assert_ne!(first, second);
        for path in [&first, &second] {
            assert!(path.exists());
            assert!(path.with_extension("json").exists());
        }
    }

    #[test]
    fn test_new_rejects_zero_idle_timeout() {
        let config = AppConfig {
            idle_timeout_ms: 0,
            ..small_config()
        };
        let sink = MemorySink::new();

        let result = CaptureDriver::new(config, camera(1), sink.clone(), sink);

        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
