//! Notification transport seam.
//!
//! The radio stack is an external collaborator. Anything that can scan,
//! connect and push notification fragments into a [`PacketIngestor`] can
//! drive a capture: the replay transport, the synthetic camera in
//! `test_utils`, or a BLE backend.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::PacketIngestor;

/// Service UUID advertised by the camera
pub const CAMERA_SERVICE_UUID: &str = "0000180a-0000-1000-8000-00805f9b34fb";

/// Advertised name of the camera board
pub const CAMERA_DEVICE_NAME: &str = "Nano 33 IoT";

/// Errors reported by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Scanning for advertisements failed.
    #[error("scan failed: {0}")]
    Scan(String),

    /// Connecting to the device failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Notifications could not be enabled.
    #[error("failed to start notify: {0}")]
    NotifyFailed(String),

    /// The device went away mid-session.
    #[error("device disconnected")]
    Disconnected,

    /// I/O error in a file-backed transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Advertisement {
    /// Device address
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<String>,
}

/// Proof that notifications are flowing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// Characteristic being notified
    pub characteristic: String,
}

/// Rule for picking the camera out of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    /// Match on advertised name
    pub name: Option<String>,
    /// Match on advertised service UUID
    pub service_uuid: Option<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name: Some(CAMERA_DEVICE_NAME.to_string()),
            service_uuid: Some(CAMERA_SERVICE_UUID.to_string()),
        }
    }
}

impl DeviceFilter {
    /// Whether `adv` is the camera.
    ///
    /// Only advertisements that list at least one service are considered;
    /// those match on the configured service UUID or on the exact name.
    pub fn matches(&self, adv: &Advertisement) -> bool {
        if adv.service_uuids.is_empty() {
            return false;
        }

        let uuid_match = self.service_uuid.as_ref().is_some_and(|wanted| {
            adv.service_uuids
                .iter()
                .any(|uuid| uuid.eq_ignore_ascii_case(wanted))
        });
        let name_match = match (&self.name, &adv.name) {
            (Some(wanted), Some(name)) => wanted == name,
            _ => false,
        };

        uuid_match || name_match
    }

    /// Human-readable description for logs and errors
    pub fn describe(&self) -> String {
        match (&self.name, &self.service_uuid) {
            (Some(name), Some(uuid)) => format!("name {:?} or service {}", name, uuid),
            (Some(name), None) => format!("name {:?}", name),
            (None, Some(uuid)) => format!("service {}", uuid),
            (None, None) => "<empty filter>".to_string(),
        }
    }
}

/// Lifecycle of a notification source.
///
/// Implementations deliver fragments by calling
/// [`PacketIngestor::on_packet`] from whatever context their radio stack
/// uses, in arrival order.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Scan for nearby advertisements.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Scan` if the adapter cannot scan.
    async fn scan(&mut self) -> Result<Vec<Advertisement>>;

    /// Connect to a scanned device.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the link cannot be opened.
    async fn connect(&mut self, device: &Advertisement) -> Result<()>;

    /// Start delivering notifications of `characteristic` to `ingestor`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NotifyFailed` if notifications cannot be
    /// enabled.
    async fn start_notify(&mut self, characteristic: &str, ingestor: PacketIngestor)
        -> Result<Started>;

    /// Stop delivering notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the request.
    async fn stop_notify(&mut self, characteristic: &str) -> Result<()>;

    /// Drop the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be closed cleanly.
    async fn disconnect(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(name: Option<&str>, uuids: &[&str]) -> Advertisement {
        Advertisement {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: name.map(str::to_string),
            service_uuids: uuids.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_matches_service_uuid() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(&adv(None, &[CAMERA_SERVICE_UUID])));
        assert!(filter.matches(&adv(None, &["0000180A-0000-1000-8000-00805F9B34FB"])));
    }

    #[test]
    fn test_matches_name_when_services_listed() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(&adv(Some("Nano 33 IoT"), &["0000feed-0000-1000-8000-00805f9b34fb"])));
    }

    #[test]
    fn test_name_alone_without_services_does_not_match() {
        let filter = DeviceFilter::default();
        assert!(!filter.matches(&adv(Some("Nano 33 IoT"), &[])));
    }

    #[test]
    fn test_unrelated_device() {
        let filter = DeviceFilter::default();
        assert!(!filter.matches(&adv(Some("Headphones"), &["0000110b-0000-1000-8000-00805f9b34fb"])));
    }

    #[test]
    fn test_describe() {
        let filter = DeviceFilter {
            name: None,
            service_uuid: Some("abcd".to_string()),
        };
        assert_eq!(filter.describe(), "service abcd");
    }
}
