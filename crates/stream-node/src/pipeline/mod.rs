//! Per-camera stream pipeline.
//!
//! A [`CameraPipeline`] is a handle to one dedicated OS thread that owns the
//! camera's input connection, motion detector and recording output. The
//! handle only exchanges messages and atomics with that thread; container
//! handles and detector state never leave it.
//!
//! ```text
//! CONNECTING -> STREAMING <-> RECONFIGURING
//!      ^            |
//!      +--- lost ---+        any state -> STOPPED
//! ```

mod recorder;
mod worker;

use anyhow::{bail, Context};
use common::{Camera, Credentials, Roi};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use motion_detector::DetectorConfig;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::media::{MediaConnector, SinkFactory};
use crate::notifier::EventSink;
use crate::registry::LifecycleFlag;
use crate::storage::Storage;

use worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Constructed, thread not started yet.
    Created,
    Connecting,
    Streaming,
    Reconfiguring,
    Stopped,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Connecting,
            2 => PipelineState::Streaming,
            3 => PipelineState::Reconfiguring,
            4 => PipelineState::Stopped,
            _ => PipelineState::Created,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Created => 0,
            PipelineState::Connecting => 1,
            PipelineState::Streaming => 2,
            PipelineState::Reconfiguring => 3,
            PipelineState::Stopped => 4,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Created => "created",
            PipelineState::Connecting => "connecting",
            PipelineState::Streaming => "streaming",
            PipelineState::Reconfiguring => "reconfiguring",
            PipelineState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Timing and tuning applied to every pipeline of a process.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Longest single wait on the input; flags are rechecked in between.
    pub read_timeout: Duration,
    /// No frame for this long counts as a lost connection.
    pub stall_timeout: Duration,
    pub cover_interval: Duration,
    pub screenshot_interval: Duration,
    /// Wait before reopening an output that failed to open or write.
    pub output_retry_backoff: Duration,
    /// Length of one `record_duration` unit. One minute in production.
    pub segment_unit: Duration,
    /// Output frame rate when the source does not report one.
    pub fallback_fps: f32,
    pub detector: DetectorConfig,
    /// Draw areas and contours on preview frames.
    pub debug_overlay: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(10),
            cover_interval: Duration::from_secs(60),
            screenshot_interval: Duration::from_secs(1),
            output_retry_backoff: Duration::from_secs(5),
            segment_unit: Duration::from_secs(60),
            fallback_fps: 15.0,
            detector: DetectorConfig::default(),
            debug_overlay: false,
        }
    }
}

/// Collaborators injected into every pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub connector: Arc<dyn MediaConnector>,
    pub sinks: Arc<dyn SinkFactory>,
    pub storage: Arc<dyn Storage>,
    pub events: Arc<dyn EventSink>,
}

pub(crate) enum Command {
    UpdateCamera(Box<Camera>, Option<Credentials>),
    UpdateRegions(Vec<Roi>),
}

/// State visible from outside the camera thread.
pub(crate) struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    recording: AtomicBool,
    lifecycle: Arc<LifecycleFlag>,
    latest: Mutex<Option<Arc<RgbImage>>>,
}

impl Shared {
    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.lifecycle.is_shutting_down()
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::SeqCst);
    }

    pub(crate) fn publish_frame(&self, frame: Arc<RgbImage>) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }
}

/// Last requested configuration, used to diff configuration reloads.
struct Desired {
    camera: Camera,
    credentials: Option<Credentials>,
    regions: Vec<Roi>,
}

pub struct CameraPipeline {
    camera_id: String,
    shared: Arc<Shared>,
    commands: Sender<Command>,
    desired: Mutex<Desired>,
    pending: Mutex<Option<Worker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Disconnected once the camera thread has exited.
    done: Receiver<()>,
}

impl CameraPipeline {
    /// Build a pipeline without starting its thread.
    pub fn new(
        camera: Camera,
        credentials: Option<Credentials>,
        regions: Vec<Roi>,
        settings: PipelineSettings,
        deps: PipelineDeps,
        lifecycle: Arc<LifecycleFlag>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(PipelineState::Created.as_u8()),
            stop: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            lifecycle,
            latest: Mutex::new(None),
        });
        let (commands, command_rx) = unbounded();
        let (done_tx, done) = crossbeam_channel::bounded(0);

        let worker = Worker::new(
            camera.clone(),
            credentials.clone(),
            regions.clone(),
            settings,
            deps,
            shared.clone(),
            command_rx,
            done_tx,
        );

        Self {
            camera_id: camera.id.clone(),
            shared,
            commands,
            desired: Mutex::new(Desired {
                camera,
                credentials,
                regions,
            }),
            pending: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
            done,
        }
    }

    /// Spawn the camera thread. Fails if already started.
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(worker) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            bail!("pipeline for camera {} already started", self.camera_id);
        };

        self.shared.set_state(PipelineState::Connecting);
        let handle = thread::Builder::new()
            .name(format!("camera-{}", self.camera_id))
            .spawn(move || worker.run())
            .with_context(|| format!("failed to spawn thread for camera {}", self.camera_id))?;

        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(camera_id = %self.camera_id, "pipeline thread started");
        Ok(())
    }

    /// Ask the camera thread to stop. Idempotent and non-blocking.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            debug!(camera_id = %self.camera_id, "stop requested");
        }
        // Never started: nothing will ever move it out of Created.
        if self.pending.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            self.shared.set_state(PipelineState::Stopped);
        }
    }

    /// Wait up to `timeout` for the camera thread to exit. Returns `true`
    /// once it has (or was never started).
    pub fn join(&self, timeout: Duration) -> bool {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = thread.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                *thread = Some(handle);
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(camera_id = %self.camera_id, "camera thread panicked");
                }
                true
            }
        }
    }

    /// `stop` followed by `join`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        self.join(timeout)
    }

    /// Hand a new camera snapshot to the thread. A connection, credentials
    /// or record mode change makes it reconnect; anything else is adopted in
    /// place.
    pub fn update_camera(&self, camera: Camera, credentials: Option<Credentials>) {
        {
            let mut desired = self.desired.lock().unwrap_or_else(PoisonError::into_inner);
            desired.camera = camera.clone();
            desired.credentials = credentials.clone();
        }
        if self.commands.send(Command::UpdateCamera(Box::new(camera), credentials)).is_err() {
            debug!(camera_id = %self.camera_id, "camera update after thread exit ignored");
        }
    }

    /// Replace the monitored areas without interrupting the stream.
    pub fn update_regions(&self, regions: Vec<Roi>) {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner).regions = regions.clone();
        if self.commands.send(Command::UpdateRegions(regions)).is_err() {
            debug!(camera_id = %self.camera_id, "region update after thread exit ignored");
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Most recently requested camera snapshot.
    pub fn camera(&self) -> Camera {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner).camera.clone()
    }

    /// Most recently requested credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner).credentials.clone()
    }

    /// Most recently requested area set.
    pub fn regions(&self) -> Vec<Roi> {
        self.desired.lock().unwrap_or_else(PoisonError::into_inner).regions.clone()
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Whether the recorder is armed.
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// Latest downsampled frame, if any was decoded yet.
    pub fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
