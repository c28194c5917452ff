use anyhow::Context;
use common::Camera;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics::{OUTPUT_ERRORS, RECORDINGS_OPEN};
use tracing::{debug, info, warn};

use crate::media::{ScreenshotRecorder, SinkFactory, VideoSink};
use crate::storage::Storage;

enum Output {
    Video {
        sink: Box<dyn VideoSink>,
        path: PathBuf,
        opened_at: Instant,
    },
    Screenshots(ScreenshotRecorder),
}

/// Recording side of a pipeline: whether frames should be kept and the one
/// output they go to.
///
/// The output is opened lazily by the first [`write`](Recorder::write) after
/// arming, so at most one output exists at any time.
pub(crate) struct Recorder {
    sinks: Arc<dyn SinkFactory>,
    storage: Arc<dyn Storage>,
    armed_at: Option<Instant>,
    output: Option<Output>,
    retry_at: Option<Instant>,
    retry_backoff: Duration,
    screenshot_interval: Duration,
    fps: f32,
}

impl Recorder {
    pub(crate) fn new(
        sinks: Arc<dyn SinkFactory>,
        storage: Arc<dyn Storage>,
        retry_backoff: Duration,
        screenshot_interval: Duration,
        fps: f32,
    ) -> Self {
        Self {
            sinks,
            storage,
            armed_at: None,
            output: None,
            retry_at: None,
            retry_backoff,
            screenshot_interval,
            fps,
        }
    }

    /// Frame rate of outputs opened from now on.
    pub(crate) fn set_fps(&mut self, fps: f32) {
        self.fps = fps;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.output.is_some()
    }

    /// Start keeping frames. Returns `true` on the transition.
    pub(crate) fn arm(&mut self, now: Instant) -> bool {
        if self.armed_at.is_some() {
            return false;
        }
        self.armed_at = Some(now);
        self.retry_at = None;
        true
    }

    /// Stop keeping frames and finalize the output. Returns how long the
    /// recorder was armed, or `None` if it was not.
    pub(crate) fn disarm(&mut self, now: Instant) -> Option<f64> {
        let armed_at = self.armed_at.take()?;
        self.close_output();
        Some(now.saturating_duration_since(armed_at).as_secs_f64())
    }

    /// Keep `frame` if armed, opening the output first when needed.
    pub(crate) fn write(&mut self, camera: &Camera, frame: &RgbImage, now: Instant) {
        if self.armed_at.is_none() {
            return;
        }

        if self.output.is_none() {
            if self.retry_at.is_some_and(|at| now < at) {
                return;
            }
            match self.open(camera, frame, now) {
                Ok(output) => {
                    RECORDINGS_OPEN.inc();
                    self.retry_at = None;
                    self.output = Some(output);
                }
                Err(e) => {
                    self.fail(now, &e);
                    return;
                }
            }
        }

        let result = match self.output.as_mut() {
            Some(Output::Video { sink, .. }) => sink.write(frame).map_err(anyhow::Error::from),
            Some(Output::Screenshots(shots)) => shots.capture(self.storage.as_ref(), camera, frame, now).map(|_| ()),
            None => Ok(()),
        };

        if let Err(e) = result {
            // Only the output side is torn down; dropping a sink aborts it.
            if self.output.take().is_some() {
                RECORDINGS_OPEN.dec();
            }
            self.fail(now, &e);
        }
    }

    /// Close the current video segment once it is `segment` old. The next
    /// write opens a fresh one.
    pub(crate) fn rotate_if_due(&mut self, segment: Duration, now: Instant) {
        let due = matches!(
            &self.output,
            Some(Output::Video { opened_at, .. }) if now.saturating_duration_since(*opened_at) >= segment
        );
        if due {
            debug!(segment = ?segment, "rotating recording segment");
            self.close_output();
        }
    }

    /// Flush and finalize the output, if one is open.
    pub(crate) fn close_output(&mut self) {
        let Some(output) = self.output.take() else {
            return;
        };
        RECORDINGS_OPEN.dec();

        match output {
            Output::Video { sink, path, opened_at } => match sink.finish() {
                Ok(packets) => info!(
                    path = %path.display(),
                    packets,
                    seconds = opened_at.elapsed().as_secs_f64(),
                    "recording segment closed"
                ),
                Err(e) => {
                    OUTPUT_ERRORS.inc();
                    warn!(path = %path.display(), error = %e, "failed to finalize recording segment");
                }
            },
            Output::Screenshots(shots) => {
                debug!(written = shots.written(), "screenshot output closed");
            }
        }
    }

    fn open(&self, camera: &Camera, frame: &RgbImage, now: Instant) -> anyhow::Result<Output> {
        if !camera.record_mode.records_video() {
            debug!(interval = ?self.screenshot_interval, "screenshot output opened");
            return Ok(Output::Screenshots(ScreenshotRecorder::new(self.screenshot_interval)));
        }

        let path = self.storage.segment_output_path(camera)?;
        let sink = self
            .sinks
            .open(&path, frame.width(), frame.height(), self.fps)
            .with_context(|| format!("failed to open {}", path.display()))?;
        info!(path = %path.display(), width = frame.width(), height = frame.height(), fps = self.fps, "recording segment opened");

        Ok(Output::Video {
            sink,
            path,
            opened_at: now,
        })
    }

    fn fail(&mut self, now: Instant, error: &anyhow::Error) {
        OUTPUT_ERRORS.inc();
        self.retry_at = Some(now + self.retry_backoff);
        warn!(error = %format!("{:#}", error), retry_in = ?self.retry_backoff, "recording output failed");
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close_output();
    }
}
