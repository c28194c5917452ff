//! Region-of-interest motion detection.
//!
//! A [`MotionDetector`] is owned by exactly one camera pipeline. It keeps the
//! previous accepted frame and the per-area activity state, and turns each
//! new grayscale frame into zero or more [`MotionEvent`]s. It performs no
//! I/O; time is passed in by the caller.

pub mod config;
pub mod detector;
pub mod filter;
pub mod overlay;
pub mod preprocess;

pub use config::DetectorConfig;
pub use detector::{DetectorError, MotionDetector, MotionEvent, MotionEventKind};
pub use overlay::render_overlay;
pub use preprocess::{downscale, to_luma};
