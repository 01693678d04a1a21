//! Runtime configuration
//!
//! Geometry, chunking and timing are explicit fields validated before a
//! session starts. Values come from defaults, an optional JSON file named by
//! `NANODETECT_CONFIG`, then individual `NANODETECT_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::frame_validation::ValidationLevel;
use crate::transport::DeviceFilter;

/// Environment variable naming a JSON configuration file
pub const CONFIG_ENV: &str = "NANODETECT_CONFIG";

/// Default image edge length in pixels
pub const DEFAULT_IMAGE_SIZE: u32 = 96;
/// Default logical chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 96;
/// Default score width in bytes
pub const DEFAULT_SCORE_WIDTH: usize = 4;
/// Widest score that still decodes into a `u64`
pub const MAX_SCORE_WIDTH: usize = 8;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Width or height is zero.
    #[error("image dimensions must be non-zero (got {width}x{height})")]
    ZeroDimension {
        /// Configured width.
        width: u32,
        /// Configured height.
        height: u32,
    },

    /// Chunk size is zero.
    #[error("chunk size must be at least one byte")]
    ZeroChunkSize,

    /// A timeout that would expire immediately.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// Score width outside the decodable range.
    #[error("score width {0} is outside 1..={MAX_SCORE_WIDTH}")]
    ScoreWidth(usize),

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Raw value found in the environment.
        value: String,
    },

    /// I/O error while reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON config file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// What happens to the byte that lands on the last pixel slot.
///
/// The device firmware and the host scripts it shipped with disagree on
/// whether the image is complete at `W*H - 1` or `W*H`. `DropFinalPixel`
/// reproduces the majority behavior: the byte is consumed but the slot keeps
/// its zero fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Complete at cursor `W*H - 1` without storing the triggering byte
    #[default]
    DropFinalPixel,
    /// Store the byte at `W*H - 1`, then complete
    StoreFinalPixel,
}

impl BoundaryPolicy {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "drop" | "drop_final_pixel" => Some(Self::DropFinalPixel),
            "store" | "store_final_pixel" => Some(Self::StoreFinalPixel),
            _ => None,
        }
    }
}

/// Geometry and chunking of the reassembly state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Bytes consumed per logical chunk
    pub chunk_size: usize,
    /// Bytes making up the little-endian score
    pub score_width: usize,
    /// Handling of the final pixel slot
    pub boundary: BoundaryPolicy,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            score_width: DEFAULT_SCORE_WIDTH,
            boundary: BoundaryPolicy::default(),
        }
    }
}

impl ReassemblyConfig {
    /// Create a config for the given geometry with default policy
    pub fn new(width: u32, height: u32, chunk_size: usize, score_width: usize) -> Self {
        Self {
            width,
            height,
            chunk_size,
            score_width,
            boundary: BoundaryPolicy::default(),
        }
    }

    /// Total pixel count (`W * H`)
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Check that the geometry can drive a session.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroDimension {
                width: self.width,
                height: self.height,
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if !(1..=MAX_SCORE_WIDTH).contains(&self.score_width) {
            return Err(ConfigError::ScoreWidth(self.score_width));
        }
        Ok(())
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Reassembly geometry
    pub reassembly: ReassemblyConfig,
    /// Which advertisements count as the camera
    pub device: DeviceFilter,
    /// Characteristic carrying the image notifications
    pub notify_char_uuid: String,
    /// Abort a session after this long without a fragment
    pub idle_timeout_ms: u64,
    /// Wait before the single notify retry
    pub notify_retry_delay_ms: u64,
    /// Directory holding the last uploaded image
    pub store_dir: PathBuf,
    /// Well-known filename the upload overwrites
    pub image_filename: String,
    /// Replay recorded notifications instead of a synthetic device
    pub replay_path: Option<PathBuf>,
    /// Record incoming notifications into this directory
    pub record_dir: Option<PathBuf>,
    /// Checks applied to each finished frame before upload
    pub validation: ValidationLevel,
    /// Image server root; `/upload` and `/detect` are posted here when set
    pub base_url: Option<String>,
    /// Per-request timeout for the image server
    pub upload_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reassembly: ReassemblyConfig::default(),
            device: DeviceFilter::default(),
            notify_char_uuid: "00002a57-0000-1000-8000-00805f9b34fb".to_string(),
            idle_timeout_ms: 30_000,
            notify_retry_delay_ms: 16_000,
            store_dir: PathBuf::from("uploads"),
            image_filename: "last_image.png".to_string(),
            replay_path: None,
            record_dir: None,
            validation: ValidationLevel::default(),
            base_url: None,
            upload_timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Idle timeout as a `Duration`
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Notify retry backoff as a `Duration`
    pub fn notify_retry_delay(&self) -> Duration {
        Duration::from_millis(self.notify_retry_delay_ms)
    }

    /// Image server request timeout as a `Duration`
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Check geometry and timeouts.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        self.reassembly.validate()?;
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("idle_timeout_ms"));
        }
        if self.upload_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("upload_timeout_ms"));
        }
        Ok(())
    }

    /// Read a JSON config file; missing fields fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Json` on unreadable input.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Load defaults, the optional config file, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, an override does not
    /// parse, or the result fails [`AppConfig::validate`].
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                log::info!("Loading config from {}", path);
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NANODETECT_*` overrides obtained from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` for values that do not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "NANODETECT_WIDTH")? {
            self.reassembly.width = v;
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_HEIGHT")? {
            self.reassembly.height = v;
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_CHUNK_SIZE")? {
            self.reassembly.chunk_size = v;
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_SCORE_WIDTH")? {
            self.reassembly.score_width = v;
        }
        if let Some(raw) = lookup("NANODETECT_BOUNDARY") {
            self.reassembly.boundary =
                BoundaryPolicy::from_env_str(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                    var: "NANODETECT_BOUNDARY".to_string(),
                    value: raw.clone(),
                })?;
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_IDLE_TIMEOUT_MS")? {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_NOTIFY_RETRY_MS")? {
            self.notify_retry_delay_ms = v;
        }
        if let Some(name) = lookup("NANODETECT_DEVICE_NAME") {
            self.device.name = Some(name);
        }
        if let Some(dir) = lookup("NANODETECT_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("NANODETECT_REPLAY") {
            self.replay_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("NANODETECT_RECORD_DIR") {
            self.record_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("NANODETECT_FRAME_VALIDATION") {
            self.validation = ValidationLevel::from_env_str(&level);
        }
        if let Some(url) = lookup("NANODETECT_BASE_URL") {
            let url = url.trim();
            self.base_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(v) = parse_var(&lookup, "NANODETECT_UPLOAD_TIMEOUT_MS")? {
            self.upload_timeout_ms = v;
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_match_device() {
        let config = AppConfig::default();
        assert_eq!(config.reassembly.width, 96);
        assert_eq!(config.reassembly.height, 96);
        assert_eq!(config.reassembly.chunk_size, 96);
        assert_eq!(config.reassembly.score_width, 4);
        assert_eq!(config.reassembly.boundary, BoundaryPolicy::DropFinalPixel);
        assert_eq!(config.notify_retry_delay(), Duration::from_secs(16));
        assert!(config.reassembly.validate().is_ok());
        assert_eq!(config.base_url, None);
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let config = ReassemblyConfig::new(0, 96, 96, 4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDimension { width: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = ReassemblyConfig::new(96, 96, 0, 4);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunkSize)));
    }

    #[test]
    fn test_validate_score_width_bounds() {
        assert!(matches!(
            ReassemblyConfig::new(4, 4, 4, 0).validate(),
            Err(ConfigError::ScoreWidth(0))
        ));
        assert!(matches!(
            ReassemblyConfig::new(4, 4, 4, 9).validate(),
            Err(ConfigError::ScoreWidth(9))
        ));
        assert!(ReassemblyConfig::new(4, 4, 4, 8).validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        let lookup = lookup_from(&[
            ("NANODETECT_WIDTH", "32"),
            ("NANODETECT_HEIGHT", "24"),
            ("NANODETECT_CHUNK_SIZE", "50"),
            ("NANODETECT_BOUNDARY", "store"),
            ("NANODETECT_IDLE_TIMEOUT_MS", "1500"),
            ("NANODETECT_DEVICE_NAME", "Bench Cam"),
            ("NANODETECT_FRAME_VALIDATION", "off"),
            ("NANODETECT_BASE_URL", "http://192.168.116.10:5000"),
        ]);

        config.apply_overrides(lookup).unwrap();

        assert_eq!(config.reassembly.width, 32);
        assert_eq!(config.reassembly.height, 24);
        assert_eq!(config.reassembly.chunk_size, 50);
        assert_eq!(config.reassembly.boundary, BoundaryPolicy::StoreFinalPixel);
        assert_eq!(config.idle_timeout(), Duration::from_millis(1500));
        assert_eq!(config.device.name.as_deref(), Some("Bench Cam"));
        assert_eq!(config.validation, ValidationLevel::Off);
        assert_eq!(config.base_url.as_deref(), Some("http://192.168.116.10:5000"));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = AppConfig {
            idle_timeout_ms: 0,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("idle_timeout_ms"))
        ));

        let config = AppConfig {
            upload_timeout_ms: 0,
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout("upload_timeout_ms"))
        ));

        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_idle_timeout_from_env_fails_validation() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup_from(&[("NANODETECT_IDLE_TIMEOUT_MS", "0")]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(lookup_from(&[("NANODETECT_CHUNK_SIZE", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv { var, .. }) if var == "NANODETECT_CHUNK_SIZE"
        ));
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "reassembly": { "chunk_size": 50 }, "image_filename": "latest.png" }"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();

        assert_eq!(config.reassembly.chunk_size, 50);
        assert_eq!(config.reassembly.width, 96);
        assert_eq!(config.image_filename, "latest.png");
        assert_eq!(config.idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_boundary_policy_from_env_str() {
        assert_eq!(
            BoundaryPolicy::from_env_str("DROP"),
            Some(BoundaryPolicy::DropFinalPixel)
        );
        assert_eq!(
            BoundaryPolicy::from_env_str("store_final_pixel"),
            Some(BoundaryPolicy::StoreFinalPixel)
        );
        assert_eq!(BoundaryPolicy::from_env_str("maybe"), None);
    }
}
