//! Upload and detection-status sinks.
//!
//! The driver hands each finished frame (as PNG) to an [`UploadSink`] and the
//! derived detection flag to a [`DetectionSink`]. Failures are reported back
//! to the driver, which logs them; nothing here retries.
//!
//! [`HttpSink`] posts both to the image server: the PNG as a multipart
//! `file` field to `/upload` and the flag as JSON to `/detect`. Only a 200
//! answer counts as delivered.
//!
//! [`LocalStore`] implements both with the same persistence contract as the
//! image server: the upload always overwrites one well-known file and the
//! detection flag lives only in memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Filename sent with the multipart upload
pub const UPLOAD_FILENAME: &str = "image.png";

/// Errors returned by a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The receiver answered with a non-success status.
    #[error("sink returned status {code}: {body}")]
    Status {
        /// Status code (HTTP semantics).
        code: u16,
        /// Response body or reason.
        body: String,
    },

    /// The receiver could not be reached.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// I/O error while persisting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame could not be encoded for upload.
    #[error("image encoding error: {0}")]
    Encode(#[from] image::ImageError),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Body of a detection-status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStatus {
    /// Whether the device's score was positive
    pub detected: bool,
}

/// Receives one encoded image per capture
#[allow(async_fn_in_trait)]
pub trait UploadSink {
    /// Deliver a PNG payload.
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if the payload was not accepted.
    async fn upload_image(&self, png: &[u8]) -> Result<()>;
}

/// Receives the detection flag derived from the score
#[allow(async_fn_in_trait)]
pub trait DetectionSink {
    /// Deliver a detection status.
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if the status was not accepted.
    async fn report_detection(&self, status: DetectionStatus) -> Result<()>;
}

/// Client for the image server's `/upload` and `/detect` endpoints
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSink {
    /// Create a client for the server rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Unavailable` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Server root without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint receiving the PNG
    pub fn upload_url(&self) -> String {
        format!("{}/upload", self.base_url)
    }

    /// Endpoint receiving the detection flag
    pub fn detect_url(&self) -> String {
        format!("{}/detect", self.base_url)
    }
}

/// Map a response to `Ok` only for status 200
async fn expect_ok(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Status {
        code: status.as_u16(),
        body,
    })
}

impl UploadSink for HttpSink {
    async fn upload_image(&self, png: &[u8]) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(png.to_vec())
            .file_name(UPLOAD_FILENAME)
            .mime_str("image/png")
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        expect_ok(response).await
    }
}

impl DetectionSink for HttpSink {
    async fn report_detection(&self, status: DetectionStatus) -> Result<()> {
        let response = self
            .client
            .post(self.detect_url())
            .json(&status)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        expect_ok(response).await
    }
}

/// Filesystem-backed sink mirroring the image server's stored state
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
    filename: String,
    detected: Arc<Mutex<Option<bool>>>,
}

impl LocalStore {
    /// Open a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Io` if the directory cannot be created.
    pub fn new(dir: &Path, filename: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            filename: filename.to_string(),
            detected: Arc::new(Mutex::new(None)),
        })
    }

    /// Path of the well-known image file
    pub fn image_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    /// Bytes of the last stored image, if any.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Status` with 404 when nothing has been uploaded.
    pub fn last_image(&self) -> Result<Vec<u8>> {
        let path = self.image_path();
        if !path.exists() {
            return Err(SinkError::Status {
                code: 404,
                body: "no image available".to_string(),
            });
        }
        Ok(std::fs::read(path)?)
    }

    /// Last reported detection flag (`None` until the first report)
    pub fn last_detection(&self) -> Option<bool> {
        self.detected.lock().ok().and_then(|d| *d)
    }
}

impl UploadSink for LocalStore {
    async fn upload_image(&self, png: &[u8]) -> Result<()> {
        if png.is_empty() {
            return Err(SinkError::Status {
                code: 400,
                body: "no file sent".to_string(),
            });
        }

        let path = self.image_path();
        std::fs::write(&path, png)?;
        log::debug!("Stored {} bytes at {}", png.len(), path.display());
        Ok(())
    }
}

impl DetectionSink for LocalStore {
    async fn report_detection(&self, status: DetectionStatus) -> Result<()> {
        log::debug!("Detection status: {}", serde_json::to_string(&status)?);
        let mut detected = self
            .detected
            .lock()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        *detected = Some(status.detected);
        Ok(())
    }
}
