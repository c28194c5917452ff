//! Configuration boundary validation
//!
//! Everything that reaches a running camera pipeline has passed through
//! here first. The capture loop itself never re-validates, so malformed
//! cameras and areas must be rejected at load time:
//! - identifiers that could escape the storage root
//! - connection fields carrying shell metacharacters (they end up in
//!   ffmpeg argument lists)
//! - areas with fewer than 3 points, bad colors or inverted bounds

use std::collections::HashSet;
use thiserror::Error;

use crate::camera::{Camera, Protocol, RecordMode};
use crate::roi::{Roi, MAX_SENSITIVITY, MIN_SENSITIVITY};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for resource IDs (camera_id, roi_id)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for URIs and URI components
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for display names
pub const MAX_NAME_LENGTH: usize = 512;

/// Upper bound on polygon vertices per area
pub const MAX_ROI_POINTS: usize = 256;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: String },

    #[error("{field} exceeds maximum length of {max} bytes (got {actual})")]
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },

    #[error("{field} contains invalid characters ({reason})")]
    InvalidCharacters { field: String, reason: &'static str },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        min: String,
        max: String,
        value: String,
    },

    #[error("invalid color '{0}' (expected #rrggbb)")]
    InvalidColor(String),

    #[error("area '{roi}' needs at least 3 points, got {count}")]
    TooFewPoints { roi: String, count: usize },

    #[error("area '{roi}' has inverted aspect ratio bounds ({min} > {max})")]
    InvertedAspectRatio { roi: String, min: f32, max: f32 },

    #[error("duplicate {kind} id '{id}'")]
    Duplicate { kind: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, ValidationError>;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(ValidationError::TooLong {
            field: field_name.to_string(),
            max: max_length,
            actual: value.len(),
        });
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty {
            field: field_name.to_string(),
        });
    }
    Ok(())
}

/// Validate resource ID. IDs become directory names under the storage root.
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(ValidationError::InvalidCharacters {
            field: field_name.to_string(),
            reason: "no path separators or '..' allowed",
        });
    }

    Ok(())
}

/// Validate display name
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_NAME_LENGTH, field_name)?;
    Ok(())
}

/// Validate a URI component that will be handed to an external process
pub fn validate_uri_part(value: &str, field_name: &str) -> Result<()> {
    validate_length(value, MAX_URI_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r', ' '];
    if value.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(ValidationError::InvalidCharacters {
            field: field_name.to_string(),
            reason: "shell metacharacters or whitespace",
        });
    }

    Ok(())
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate value is within an inclusive range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    // NaN fails both comparisons, so check containment rather than exclusion
    if !(value >= min && value <= max) {
        return Err(ValidationError::OutOfRange {
            field: field_name.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Domain Validation
// ============================================================================

/// Validate a single area definition
pub fn validate_roi(roi: &Roi) -> Result<()> {
    validate_id(&roi.id, "roi.id")?;
    validate_name(&roi.name, "roi.name")?;

    if roi.points.len() < 3 {
        return Err(ValidationError::TooFewPoints {
            roi: roi.id.clone(),
            count: roi.points.len(),
        });
    }
    validate_range(roi.points.len(), 3, MAX_ROI_POINTS, "roi.points")?;

    for point in &roi.points {
        validate_range(point.x, 0.0, 1.0, "roi.points.x")?;
        validate_range(point.y, 0.0, 1.0, "roi.points.y")?;
    }

    let s = &roi.settings;
    validate_range(s.sensitivity, MIN_SENSITIVITY, MAX_SENSITIVITY, "roi.settings.sensitivity")?;
    if !(s.min_area > 0.0) {
        return Err(ValidationError::OutOfRange {
            field: "roi.settings.min_area".to_string(),
            min: "0 (exclusive)".to_string(),
            max: "inf".to_string(),
            value: s.min_area.to_string(),
        });
    }
    if !(s.min_aspect_ratio > 0.0) {
        return Err(ValidationError::OutOfRange {
            field: "roi.settings.min_aspect_ratio".to_string(),
            min: "0 (exclusive)".to_string(),
            max: "inf".to_string(),
            value: s.min_aspect_ratio.to_string(),
        });
    }
    if s.min_aspect_ratio > s.max_aspect_ratio {
        return Err(ValidationError::InvertedAspectRatio {
            roi: roi.id.clone(),
            min: s.min_aspect_ratio,
            max: s.max_aspect_ratio,
        });
    }

    Ok(())
}

/// Validate the full set of areas configured for one camera
pub fn validate_rois(rois: &[Roi]) -> Result<()> {
    let mut seen = HashSet::new();
    for roi in rois {
        validate_roi(roi)?;
        if !seen.insert(roi.id.as_str()) {
            return Err(ValidationError::Duplicate {
                kind: "roi",
                id: roi.id.clone(),
            });
        }
    }
    Ok(())
}

/// Validate a camera snapshot before it is handed to a pipeline
pub fn validate_camera(camera: &Camera) -> Result<()> {
    validate_id(&camera.id, "camera.id")?;
    validate_name(&camera.name, "camera.name")?;

    let conn = &camera.connection;
    match conn.protocol {
        Protocol::Rtsp | Protocol::Http | Protocol::Https => {
            validate_non_empty(&conn.host, "camera.connection.host")?;
            validate_uri_part(&conn.host, "camera.connection.host")?;
        }
        Protocol::Usb | Protocol::File => {
            validate_non_empty(&conn.path, "camera.connection.path")?;
        }
    }
    validate_uri_part(&conn.path, "camera.connection.path")?;
    if let Some(user) = &conn.username {
        validate_uri_part(user, "camera.connection.username")?;
    }
    if let Some(port) = conn.port {
        validate_range(port, 1, u16::MAX, "camera.connection.port")?;
    }

    if camera.record_mode == RecordMode::Video {
        validate_range(camera.record_duration, 1, 24 * 60, "camera.record_duration")?;
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
