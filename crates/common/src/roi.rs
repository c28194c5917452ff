//! Regions of interest (areas) monitored by the motion detector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::validation::ValidationError;

/// A polygon vertex in normalized frame coordinates (`0.0..=1.0` on both
/// axes), so areas survive resolution changes of the detection frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Scale to pixel coordinates of a `width` x `height` frame.
    pub fn to_pixel(&self, width: u32, height: u32) -> (i32, i32) {
        let px = (self.x.clamp(0.0, 1.0) * (width.saturating_sub(1)) as f32).round() as i32;
        let py = (self.y.clamp(0.0, 1.0) * (height.saturating_sub(1)) as f32).round() as i32;
        (px, py)
    }
}

/// Display color of an area, written as `#rrggbb` in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoiColor(pub [u8; 3]);

impl Default for RoiColor {
    fn default() -> Self {
        RoiColor([0, 255, 0])
    }
}

impl FromStr for RoiColor {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidColor(s.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| ValidationError::InvalidColor(s.to_string()))
        };
        Ok(RoiColor([channel(0)?, channel(2)?, channel(4)?]))
    }
}

impl TryFrom<String> for RoiColor {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoiColor> for String {
    fn from(value: RoiColor) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RoiColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b] = self.0;
        write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
    }
}

/// Per-area detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoiSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Multiplier in `[0.1, 5.0]`; higher values accept smaller contours.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,
    /// Minimum contour area in pixels of the detection frame.
    #[serde(default = "default_min_area")]
    pub min_area: f32,
    /// Bounding-box width / height lower bound.
    #[serde(default = "default_min_aspect")]
    pub min_aspect_ratio: f32,
    /// Bounding-box width / height upper bound.
    #[serde(default = "default_max_aspect")]
    pub max_aspect_ratio: f32,
}

pub const MIN_SENSITIVITY: f32 = 0.1;
pub const MAX_SENSITIVITY: f32 = 5.0;

fn default_enabled() -> bool {
    true
}

fn default_sensitivity() -> f32 {
    1.0
}

fn default_min_area() -> f32 {
    150.0
}

fn default_min_aspect() -> f32 {
    0.2
}

fn default_max_aspect() -> f32 {
    5.0
}

impl Default for RoiSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sensitivity: default_sensitivity(),
            min_area: default_min_area(),
            min_aspect_ratio: default_min_aspect(),
            max_aspect_ratio: default_max_aspect(),
        }
    }
}

impl RoiSettings {
    /// Area threshold after applying sensitivity.
    pub fn effective_min_area(&self) -> f32 {
        self.min_area / self.sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
    }
}

/// A named polygon inside a camera frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Roi {
    pub id: String,
    pub name: String,
    pub points: Vec<Point>,
    #[serde(default)]
    pub color: RoiColor,
    #[serde(default)]
    pub settings: RoiSettings,
}
