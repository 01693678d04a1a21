//! Sanity checks for reassembled grayscale frames
//!
//! Detects the artifacts a broken capture leaves behind:
//! - Blank frames (every pixel identical, usually a dead sensor or a stream
//!   of zeros)
//! - Horizontal banding (adjacent rows wildly different, usually a stream
//!   that slipped by a partial row)
//!
//! Results are advisory; the driver logs them and uploads regardless.
//! Configurable via `NANODETECT_FRAME_VALIDATION` environment variable.

use serde::{Deserialize, Serialize};

use crate::gray_frame::GrayFrame;

/// Average adjacent-row difference above which a frame counts as banded
const STRICT_ROW_DIFF_THRESHOLD: f32 = 40.0;

/// Sample every Nth column when comparing rows
const ROW_SAMPLE_STEP: usize = 4;

/// Frame validation strictness levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Blank-frame and row-banding checks
    #[default]
    Strict,
    /// Blank-frame check only
    Minimal,
    /// No validation
    Off,
}

impl ValidationLevel {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "strict" => Self::Strict,
            "minimal" => Self::Minimal,
            "off" | "none" | "disabled" => Self::Off,
            _ => {
                log::warn!("Unknown validation level '{}', defaulting to 'strict'", s);
                Self::Strict
            }
        }
    }
}

/// Frame validation result with diagnostic metrics
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Whether the frame passed validation
    pub valid: bool,
    /// Average intensity difference between adjacent rows (Strict only)
    pub avg_row_diff: Option<f32>,
    /// Whether every pixel holds the same value
    pub uniform: bool,
    /// Reason for validation failure (if any)
    pub failure_reason: Option<String>,
}

impl ValidationResult {
    fn passed() -> Self {
        Self {
            valid: true,
            avg_row_diff: None,
            uniform: false,
            failure_reason: None,
        }
    }
}

/// Validate a reassembled frame.
///
/// The final pixel is ignored by the uniformity check because the default
/// boundary policy leaves it at zero.
pub fn validate_gray_frame(frame: &GrayFrame, level: ValidationLevel) -> ValidationResult {
    if level == ValidationLevel::Off {
        return ValidationResult::passed();
    }

    let mut failure_reasons = Vec::new();

    let pixels = frame.pixels();
    let body = &pixels[..pixels.len().saturating_sub(1)];
    let uniform = match body.first() {
        Some(&first) => body.iter().all(|&p| p == first),
        None => true,
    };
    if uniform {
        failure_reasons.push(format!(
            "Uniform frame: all pixels are {}",
            body.first().copied().unwrap_or(0)
        ));
    }

    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let avg_row_diff = if level == ValidationLevel::Strict && height >= 2 && width > 0 {
        Some(compute_row_difference(pixels, width, height))
    } else {
        None
    };

    if let Some(diff) = avg_row_diff {
        if diff > STRICT_ROW_DIFF_THRESHOLD {
            failure_reasons.push(format!(
                "High row difference: {:.1} (threshold {})",
                diff, STRICT_ROW_DIFF_THRESHOLD
            ));
        }
    }

    let failure_reason = if failure_reasons.is_empty() {
        None
    } else {
        Some(failure_reasons.join("; "))
    };

    ValidationResult {
        valid: failure_reason.is_none(),
        avg_row_diff,
        uniform,
        failure_reason,
    }
}

/// Average absolute difference between vertically adjacent pixels.
///
/// Samples every `ROW_SAMPLE_STEP`th column of every row pair. High values
/// (>40) indicate banding.
fn compute_row_difference(pixels: &[u8], width: usize, height: usize) -> f32 {
    let mut total_diff: u64 = 0;
    let mut samples: u64 = 0;

    for row in 0..height - 1 {
        let row0 = row * width;
        let row1 = (row + 1) * width;

        for x in (0..width).step_by(ROW_SAMPLE_STEP) {
            // Skip the unstored boundary slot
            if row1 + x >= pixels.len() - 1 {
                break;
            }
            let y0 = i16::from(pixels[row0 + x]);
            let y1 = i16::from(pixels[row1 + x]);
            total_diff += u64::from((y0 - y1).unsigned_abs());
            samples += 1;
        }
    }

    if samples == 0 {
        return 0.0;
    }

    total_diff as f32 / samples as f32
}
