//! Decoded video frames passed through a camera pipeline.

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::Arc;

/// One decoded picture at native resolution.
///
/// The pixel buffer is reference counted so the recording path, the
/// detector and preview consumers can share it without copies.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<RgbImage>,
    /// Presentation timestamp reported by the demuxer, in stream time base.
    /// Informational only; outputs re-stamp frames from their own counter.
    pub pts: Option<i64>,
    pub captured_at: DateTime<Utc>,
}

impl VideoFrame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            pts: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
