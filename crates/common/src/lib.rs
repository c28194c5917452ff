pub mod camera;
pub mod events;
pub mod frame;
pub mod roi;
pub mod validation;

pub use camera::{Camera, ConnectionInfo, Credentials, MotionTuning, Protocol, RecordMode};
pub use events::{DetectionEvent, EventKind};
pub use frame::VideoFrame;
pub use roi::{Point, Roi, RoiColor, RoiSettings};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
