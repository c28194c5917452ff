use common::MotionTuning;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_HOLD_SECS: f32 = 3.0;
const DEFAULT_DARK_LUMA: f32 = 12.0;
const DEFAULT_MAX_DARK_FRAMES: u32 = 10;
const DEFAULT_SCENE_CHANGE_CEILING: f32 = 35.0;
const DEFAULT_MIN_SOLIDITY: f32 = 0.5;

/// Tuning shared by every area of one camera.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectorConfig {
    /// Width frames are downsampled to before analysis (aspect preserved).
    #[serde(default = "default_detection_width")]
    pub detection_width: u32,

    /// Gaussian blur applied before differencing, suppresses sensor noise.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Per-pixel absolute difference needed to count as changed.
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,

    /// Radius of the square structuring element used for the opening.
    #[serde(default = "default_opening_radius")]
    pub opening_radius: u8,

    /// Frames whose mean luminance is below this are treated as dark.
    #[serde(default = "default_dark_luma")]
    pub dark_luma_threshold: f32,

    /// Consecutive dark frames replaced by the last good frame before
    /// detection is skipped altogether.
    #[serde(default = "default_max_dark_frames")]
    pub max_dark_frames: u32,

    /// Mean absolute frame difference above which a tick is a scene-wide
    /// change (IR switch, exposure jump) and is discarded.
    #[serde(default = "default_scene_change_ceiling")]
    pub scene_change_ceiling: f32,

    /// Detector pause after a scene-wide change.
    #[serde(default = "default_scene_change_cooldown", with = "duration_millis")]
    pub scene_change_cooldown: Duration,

    /// Minimum contour area / convex hull area.
    #[serde(default = "default_min_solidity")]
    pub min_solidity: f32,

    /// Quiet period after the last active tick before motion ends.
    #[serde(default = "default_hold", with = "duration_millis")]
    pub hold: Duration,
}

fn default_detection_width() -> u32 {
    320
}

fn default_blur_sigma() -> f32 {
    1.0
}

fn default_pixel_threshold() -> u8 {
    25
}

fn default_opening_radius() -> u8 {
    1
}

fn default_dark_luma() -> f32 {
    DEFAULT_DARK_LUMA
}

fn default_max_dark_frames() -> u32 {
    DEFAULT_MAX_DARK_FRAMES
}

fn default_scene_change_ceiling() -> f32 {
    DEFAULT_SCENE_CHANGE_CEILING
}

fn default_scene_change_cooldown() -> Duration {
    Duration::from_millis(500)
}

fn default_min_solidity() -> f32 {
    DEFAULT_MIN_SOLIDITY
}

fn default_hold() -> Duration {
    Duration::from_secs_f32(DEFAULT_HOLD_SECS)
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_width: default_detection_width(),
            blur_sigma: default_blur_sigma(),
            pixel_threshold: default_pixel_threshold(),
            opening_radius: default_opening_radius(),
            dark_luma_threshold: default_dark_luma(),
            max_dark_frames: default_max_dark_frames(),
            scene_change_ceiling: default_scene_change_ceiling(),
            scene_change_cooldown: default_scene_change_cooldown(),
            min_solidity: default_min_solidity(),
            hold: default_hold(),
        }
    }
}

impl DetectorConfig {
    /// Defaults overridden by `DETECTOR_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("DETECTOR_WIDTH") {
            config.detection_width = v;
        }
        if let Some(v) = env_parse("DETECTOR_PIXEL_THRESHOLD") {
            config.pixel_threshold = v;
        }
        if let Some(v) = env_parse("DETECTOR_DARK_LUMA") {
            config.dark_luma_threshold = v;
        }
        if let Some(v) = env_parse("DETECTOR_MAX_DARK_FRAMES") {
            config.max_dark_frames = v;
        }
        if let Some(v) = env_parse("DETECTOR_SCENE_CHANGE_CEILING") {
            config.scene_change_ceiling = v;
        }
        if let Some(v) = env_parse("DETECTOR_MIN_SOLIDITY") {
            config.min_solidity = v;
        }
        if let Some(v) = env_parse::<f32>("DETECTOR_HOLD_SECS") {
            config.hold = Duration::from_secs_f32(v.max(0.0));
        }
        config
    }

    /// Apply the per-camera overrides from configuration.
    pub fn with_tuning(mut self, tuning: &MotionTuning) -> Self {
        if let Some(v) = tuning.hold_secs {
            self.hold = Duration::from_secs_f32(v.max(0.0));
        }
        if let Some(v) = tuning.dark_luma_threshold {
            self.dark_luma_threshold = v;
        }
        if let Some(v) = tuning.max_dark_frames {
            self.max_dark_frames = v;
        }
        if let Some(v) = tuning.scene_change_ceiling {
            self.scene_change_ceiling = v;
        }
        if let Some(v) = tuning.min_solidity {
            self.min_solidity = v;
        }
        self
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
