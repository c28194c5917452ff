//! Camera snapshot types shared between the configuration store and the
//! per-camera stream pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Transport used to reach a camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Rtsp,
    Http,
    Https,
    /// Local V4L2 device, `path` holds the device node (e.g. `/dev/video0`).
    Usb,
    /// Local media file, mostly used for demos and soak tests.
    File,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Rtsp => "rtsp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Usb => "usb",
            Protocol::File => "file",
        };
        write!(f, "{}", s)
    }
}

/// Per-camera recording policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordMode {
    /// Continuous video, rotated every `record_duration` minutes.
    Video,
    /// Continuous screenshots at a fixed interval.
    Screenshots,
    /// Video only while motion is reported in at least one ROI.
    #[default]
    DetectionVideo,
    /// Screenshots only while motion is reported in at least one ROI.
    DetectionScreenshots,
}

impl RecordMode {
    /// VIDEO and SCREENSHOTS keep an output open for the whole session.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RecordMode::Video | RecordMode::Screenshots)
    }

    pub fn uses_detection(&self) -> bool {
        !self.is_permanent()
    }

    pub fn records_video(&self) -> bool {
        matches!(self, RecordMode::Video | RecordMode::DetectionVideo)
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordMode::Video => "VIDEO",
            RecordMode::Screenshots => "SCREENSHOTS",
            RecordMode::DetectionVideo => "DETECTION_VIDEO",
            RecordMode::DetectionScreenshots => "DETECTION_SCREENSHOTS",
        };
        write!(f, "{}", s)
    }
}

/// How to reach the camera. Secrets are not part of the snapshot, they are
/// resolved separately into [`Credentials`] right before connecting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Plaintext credentials, already decrypted by the configuration collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl ConnectionInfo {
    /// Source locator handed to the demuxer, with credentials inlined for
    /// network protocols.
    pub fn uri(&self, credentials: Option<&Credentials>) -> String {
        match self.protocol {
            Protocol::Usb | Protocol::File => self.path.clone(),
            Protocol::Rtsp | Protocol::Http | Protocol::Https => {
                let auth = credentials
                    .map(|c| format!("{}:{}@", c.username, c.password))
                    .unwrap_or_default();
                self.network_uri(&auth)
            }
        }
    }

    /// Same as [`ConnectionInfo::uri`] but safe to log.
    pub fn redacted_uri(&self) -> String {
        match self.protocol {
            Protocol::Usb | Protocol::File => self.path.clone(),
            _ => {
                let auth = self
                    .username
                    .as_ref()
                    .map(|u| format!("{}:***@", u))
                    .unwrap_or_default();
                self.network_uri(&auth)
            }
        }
    }

    fn network_uri(&self, auth: &str) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}{}{}", self.protocol, auth, self.host, port, path)
    }
}

/// Optional per-camera overrides of the motion detector defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MotionTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_secs: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_luma_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dark_frames: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_change_ceiling: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_solidity: Option<f32>,
}

/// Read-only snapshot of a camera as seen by its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub connection: ConnectionInfo,
    /// Root directory for this camera's recordings; falls back to the
    /// process-wide recordings root when absent.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub record_mode: RecordMode,
    /// Minutes per video segment, only used in [`RecordMode::Video`].
    #[serde(default = "default_record_duration")]
    pub record_duration: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub motion: MotionTuning,
}

fn default_record_duration() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Camera {
    /// Whether moving from `self` to `next` needs the input connection and
    /// output container torn down. ROI changes never do.
    pub fn requires_reconfigure(&self, next: &Camera) -> bool {
        self.connection != next.connection || self.record_mode != next.record_mode
    }
}
