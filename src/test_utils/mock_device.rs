//! Scripted transport and in-memory sinks
//!
//! [`MockTransport`] plays a fixed fragment script into the session on every
//! `start_notify`, with knobs for notify failures and stalls. [`MemorySink`]
//! collects uploads and detection reports and can be told to fail.

use std::sync::{Arc, Mutex};

use crate::config::AppConfig;
use crate::session::PacketIngestor;
use crate::sinks::{DetectionSink, DetectionStatus, SinkError, UploadSink};
use crate::transport::{self, Advertisement, Started, Transport, TransportError};

use super::packet_generator::NotificationGenerator;

/// Lifecycle call observed by a [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `scan()`
    Scan,
    /// `connect()` with the device address
    Connect(String),
    /// `start_notify()` with the characteristic
    StartNotify(String),
    /// `stop_notify()` with the characteristic
    StopNotify(String),
    /// `disconnect()`
    Disconnect,
}

/// Transport that replays a fragment script synchronously
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    advertisements: Vec<Advertisement>,
    fragments: Vec<Vec<u8>>,
    notify_failures: usize,
    stall_after: Option<usize>,
    calls: Vec<TransportCall>,
    connected: bool,
}

impl MockTransport {
    /// Transport advertising `advertisements` and delivering `fragments`
    pub fn new(advertisements: Vec<Advertisement>, fragments: Vec<Vec<u8>>) -> Self {
        Self {
            advertisements,
            fragments,
            ..Self::default()
        }
    }

    /// Advertisement carrying the camera's default name and service
    pub fn camera_advertisement() -> Advertisement {
        Advertisement {
            address: "4C:11:AE:00:00:01".to_string(),
            name: Some(transport::CAMERA_DEVICE_NAME.to_string()),
            service_uuids: vec![transport::CAMERA_SERVICE_UUID.to_string()],
        }
    }

    /// Camera transport that streams a gradient frame and a score of 1
    /// using the geometry in `config`.
    pub fn synthetic_camera(config: &AppConfig) -> Self {
        let geometry = config.reassembly;
        let frame = NotificationGenerator::gradient_frame(geometry.width, geometry.height);
        let fragments = NotificationGenerator::default().capture_fragments(
            &frame,
            1,
            geometry.score_width,
        );

        let mut advertisement = Self::camera_advertisement();
        if let Some(name) = &config.device.name {
            advertisement.name = Some(name.clone());
        }
        if let Some(uuid) = &config.device.service_uuid {
            advertisement.service_uuids = vec![uuid.clone()];
        }

        Self::new(vec![advertisement], fragments)
    }

    /// Fail the next `count` `start_notify` calls
    pub fn with_notify_failures(mut self, count: usize) -> Self {
        self.notify_failures = count;
        self
    }

    /// Deliver only the first `bytes` bytes of the script, then go quiet
    pub fn with_stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    /// Replace the fragment script used by later `start_notify` calls
    pub fn set_fragments(&mut self, fragments: Vec<Vec<u8>>) {
        self.fragments = fragments;
    }

    /// Calls observed so far, in order
    pub fn calls(&self) -> &[TransportCall] {
        &self.calls
    }

    /// Number of `start_notify` attempts
    pub fn notify_attempts(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, TransportCall::StartNotify(_)))
            .count()
    }

    /// Whether the mock currently considers itself connected
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn deliver(&self, ingestor: &PacketIngestor) {
        let mut budget = self.stall_after.unwrap_or(usize::MAX);
        for fragment in &self.fragments {
            if budget == 0 {
                log::debug!("Mock transport stalling");
                return;
            }
            let take = fragment.len().min(budget);
            ingestor.on_packet(&fragment[..take]);
            budget -= take;
        }
    }
}

impl Transport for MockTransport {
    async fn scan(&mut self) -> transport::Result<Vec<Advertisement>> {
        self.calls.push(TransportCall::Scan);
        Ok(self.advertisements.clone())
    }

    async fn connect(&mut self, device: &Advertisement) -> transport::Result<()> {
        self.calls.push(TransportCall::Connect(device.address.clone()));
        self.connected = true;
        Ok(())
    }

    async fn start_notify(
        &mut self,
        characteristic: &str,
        ingestor: PacketIngestor,
    ) -> transport::Result<Started> {
        self.calls
            .push(TransportCall::StartNotify(characteristic.to_string()));

        if !self.connected {
            return Err(TransportError::NotifyFailed("not connected".to_string()));
        }
        if self.notify_failures > 0 {
            self.notify_failures -= 1;
            return Err(TransportError::NotifyFailed(
                "characteristic busy".to_string(),
            ));
        }

        self.deliver(&ingestor);
        Ok(Started {
            characteristic: characteristic.to_string(),
        })
    }

    async fn stop_notify(&mut self, characteristic: &str) -> transport::Result<()> {
        self.calls
            .push(TransportCall::StopNotify(characteristic.to_string()));
        Ok(())
    }

    async fn disconnect(&mut self) -> transport::Result<()> {
        self.calls.push(TransportCall::Disconnect);
        self.connected = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    uploads: Vec<Vec<u8>>,
    detections: Vec<DetectionStatus>,
    upload_failures: usize,
    detection_failures: usize,
}

/// In-memory upload and detection sink; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    /// Empty sink that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` uploads with a 500 status
    pub fn fail_uploads(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.upload_failures = count;
        }
    }

    /// Reject the next `count` detection reports as unavailable
    pub fn fail_detections(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.detection_failures = count;
        }
    }

    /// Accepted uploads, oldest first
    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.uploads.clone())
            .unwrap_or_default()
    }

    /// Accepted detection reports, oldest first
    pub fn detections(&self) -> Vec<DetectionStatus> {
        self.state
            .lock()
            .map(|s| s.detections.clone())
            .unwrap_or_default()
    }
}

impl UploadSink for MemorySink {
    async fn upload_image(&self, png: &[u8]) -> Result<(), SinkError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        if state.upload_failures > 0 {
            state.upload_failures -= 1;
            return Err(SinkError::Status {
                code: 500,
                body: "internal server error".to_string(),
            });
        }
        state.uploads.push(png.to_vec());
        Ok(())
    }
}

impl DetectionSink for MemorySink {
    async fn report_detection(&self, status: DetectionStatus) -> Result<(), SinkError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        if state.detection_failures > 0 {
            state.detection_failures -= 1;
            return Err(SinkError::Unavailable("connection refused".to_string()));
        }
        state.detections.push(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReassemblyConfig;
    use crate::session::CaptureSession;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_records_call_order() {
        let mut transport = MockTransport::new(vec![MockTransport::camera_advertisement()], vec![]);
        let mut session =
            CaptureSession::new(ReassemblyConfig::new(2, 2, 2, 1), Duration::from_secs(1)).unwrap();

        let devices = transport.scan().await.unwrap();
        transport.connect(&devices[0]).await.unwrap();
        transport
            .start_notify("2a57", session.begin().unwrap())
            .await
            .unwrap();
        transport.stop_notify("2a57").await.unwrap();
        transport.disconnect().await.unwrap();

        assert_eq!(
            transport.calls(),
            &[
                TransportCall::Scan,
                TransportCall::Connect("4C:11:AE:00:00:01".to_string()),
                TransportCall::StartNotify("2a57".to_string()),
                TransportCall::StopNotify("2a57".to_string()),
                TransportCall::Disconnect,
            ]
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_notify_failures_consumed() {
        let mut transport =
            MockTransport::new(vec![MockTransport::camera_advertisement()], vec![])
                .with_notify_failures(1);
        let mut session =
            CaptureSession::new(ReassemblyConfig::new(2, 2, 2, 1), Duration::from_secs(1)).unwrap();

        transport
            .connect(&MockTransport::camera_advertisement())
            .await
            .unwrap();
        let first = transport.start_notify("c", session.begin().unwrap()).await;
        let second = transport.start_notify("c", session.begin().unwrap()).await;

        assert!(matches!(first, Err(TransportError::NotifyFailed(_))));
        assert!(second.is_ok());
        assert_eq!(transport.notify_attempts(), 2);
    }

    #[tokio::test]
    async fn test_stall_truncates_delivery() {
        let fragments = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let mut transport =
            MockTransport::new(vec![MockTransport::camera_advertisement()], fragments)
                .with_stall_after(4);
        let mut session =
            CaptureSession::new(ReassemblyConfig::new(4, 4, 4, 4), Duration::from_secs(1)).unwrap();

        transport
            .connect(&MockTransport::camera_advertisement())
            .await
            .unwrap();
        transport
            .start_notify("c", session.begin().unwrap())
            .await
            .unwrap();

        assert_eq!(session.snapshot().unwrap().pixel_index, Some(3));
    }

    #[test]
    fn test_synthetic_camera_matches_default_filter() {
        let config = AppConfig::default();
        let camera = MockTransport::synthetic_camera(&config);
        assert!(config.device.matches(&camera.advertisements[0]));
        assert_eq!(camera.fragments.concat().len(), 96 * 96 + 4);
    }

    #[tokio::test]
    async fn test_memory_sink_failures() {
        let sink = MemorySink::new();
        let handle = sink.clone();
        sink.fail_uploads(1);

        assert!(matches!(
            sink.upload_image(b"png").await,
            Err(SinkError::Status { code: 500, .. })
        ));
        sink.upload_image(b"png").await.unwrap();
        sink.report_detection(DetectionStatus { detected: false })
            .await
            .unwrap();

        assert_eq!(handle.uploads(), vec![b"png".to_vec()]);
        assert_eq!(handle.detections(), vec![DetectionStatus { detected: false }]);
    }
}
