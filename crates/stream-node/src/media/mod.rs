//! Media input and output seams of a camera pipeline.
//!
//! The pipeline only talks to these traits. Production code uses the
//! ffmpeg-backed implementations in [`ffmpeg`]; tests plug in the scripted
//! doubles from `crate::testing`.

pub mod ffmpeg;
pub mod screenshot;

use common::{ConnectionInfo, Credentials, VideoFrame};
use image::RgbImage;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use ffmpeg::{FfmpegConnector, FfmpegSinkFactory};
pub use screenshot::ScreenshotRecorder;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("end of stream")]
    EndOfStream,

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Stream parameters discovered while connecting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate; `0.0` when the source does not report one.
    pub fps: f32,
}

/// Opens input connections.
pub trait MediaConnector: Send + Sync {
    /// Connect to a camera, giving up after `timeout`.
    fn connect(
        &self,
        connection: &ConnectionInfo,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> MediaResult<Box<dyn MediaSource>>;
}

/// An open input connection producing decoded frames.
pub trait MediaSource: Send {
    fn info(&self) -> SourceInfo;

    /// Next decoded frame. `Ok(None)` means nothing arrived within `timeout`;
    /// the caller is expected to recheck its flags and call again.
    fn read_frame(&mut self, timeout: Duration) -> MediaResult<Option<VideoFrame>>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Opens output (recording) containers.
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f32) -> MediaResult<Box<dyn VideoSink>>;
}

/// An open output container.
pub trait VideoSink: Send {
    /// Encode and mux one frame. Timestamps come from the sink's own counter.
    fn write(&mut self, frame: &RgbImage) -> MediaResult<()>;

    /// Flush buffered packets and finalize the container. Returns the number
    /// of packets written.
    fn finish(self: Box<Self>) -> MediaResult<u64>;
}
