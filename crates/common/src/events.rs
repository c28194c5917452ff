//! Detection events produced by the capture loop and consumed by the
//! notifier, the event log and live subscribers.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::camera::{Camera, RecordMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MotionStart,
    MotionEnd,
    RecordingStart,
    RecordingEnd,
}

impl EventKind {
    /// Topic name used on the event bus.
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::MotionStart => "motion.start",
            EventKind::MotionEnd => "motion.end",
            EventKind::RecordingStart => "recording.start",
            EventKind::RecordingEnd => "recording.end",
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, EventKind::MotionStart | EventKind::MotionEnd)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic())
    }
}

/// Value object handed from a camera pipeline to the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub camera_id: String,
    pub camera_name: String,
    pub record_mode: RecordMode,
    /// Area that triggered the event; `None` for recording events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Seconds covered by the recording, set on `recording.end`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Full-resolution frame attached to `motion.start` for screenshots.
    #[serde(skip)]
    pub frame: Option<Arc<RgbImage>>,
}

impl DetectionEvent {
    fn new(camera: &Camera, kind: EventKind, roi_id: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: camera.id.clone(),
            camera_name: camera.name.clone(),
            record_mode: camera.record_mode,
            roi_id,
            kind,
            timestamp,
            duration_secs: None,
            frame: None,
        }
    }

    pub fn motion_start(
        camera: &Camera,
        roi_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        frame: Option<Arc<RgbImage>>,
    ) -> Self {
        let mut event = Self::new(camera, EventKind::MotionStart, Some(roi_id.into()), timestamp);
        event.frame = frame;
        event
    }

    pub fn motion_end(camera: &Camera, roi_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(camera, EventKind::MotionEnd, Some(roi_id.into()), timestamp)
    }

    pub fn recording_start(camera: &Camera, timestamp: DateTime<Utc>) -> Self {
        Self::new(camera, EventKind::RecordingStart, None, timestamp)
    }

    pub fn recording_end(camera: &Camera, timestamp: DateTime<Utc>, duration_secs: f64) -> Self {
        let mut event = Self::new(camera, EventKind::RecordingEnd, None, timestamp);
        event.duration_secs = Some(duration_secs);
        event
    }
}
