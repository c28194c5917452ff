//! Process-wide directory of running camera pipelines.
//!
//! The map is the only structure shared between camera threads and the
//! preview/shutdown side. Every access takes the one mutex; readers get a
//! copy and never hold the lock while calling into a pipeline.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::pipeline::CameraPipeline;

const PLACEHOLDER_SIZE: (u32, u32) = (640, 360);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Running,
    ShuttingDown,
}

/// Shared lifecycle flag polled by every camera thread.
#[derive(Debug, Default)]
pub struct LifecycleFlag(AtomicU8);

impl LifecycleFlag {
    pub fn get(&self) -> Lifecycle {
        match self.0.load(Ordering::SeqCst) {
            0 => Lifecycle::Running,
            _ => Lifecycle::ShuttingDown,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.get() == Lifecycle::ShuttingDown
    }

    /// Flip to `ShuttingDown`. Returns `true` on the first call.
    pub fn begin_shutdown(&self) -> bool {
        self.0.swap(1, Ordering::SeqCst) == 0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub timed_out: Vec<String>,
}

pub struct StreamRegistry {
    pipelines: Mutex<HashMap<String, Arc<CameraPipeline>>>,
    lifecycle: Arc<LifecycleFlag>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            lifecycle: Arc::new(LifecycleFlag::default()),
        }
    }

    /// Flag handed to pipelines built for this registry.
    pub fn lifecycle(&self) -> Arc<LifecycleFlag> {
        self.lifecycle.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Register a pipeline, returning the one it replaced.
    pub fn add(&self, pipeline: Arc<CameraPipeline>) -> Option<Arc<CameraPipeline>> {
        let id = pipeline.camera_id().to_string();
        let previous = self.lock().insert(id.clone(), pipeline);
        info!(camera_id = %id, replaced = previous.is_some(), "pipeline registered");
        previous
    }

    /// Unregister a pipeline. The caller decides whether to stop it.
    pub fn remove(&self, camera_id: &str) -> Option<Arc<CameraPipeline>> {
        let removed = self.lock().remove(camera_id);
        if removed.is_some() {
            info!(camera_id, "pipeline unregistered");
        }
        removed
    }

    pub fn find_by_camera_id(&self, camera_id: &str) -> Option<Arc<CameraPipeline>> {
        self.lock().get(camera_id).cloned()
    }

    /// Copy of the registered pipelines, sorted by camera id.
    pub fn list_all(&self) -> Vec<Arc<CameraPipeline>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.camera_id().cmp(b.camera_id()));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Latest preview frame of a camera. Registered cameras without a frame
    /// yet get the "no signal" placeholder; unknown ids get `None`.
    pub fn latest_frame(&self, camera_id: &str) -> Option<Arc<RgbImage>> {
        let pipeline = self.find_by_camera_id(camera_id)?;
        Some(pipeline.latest_frame().unwrap_or_else(|| Arc::new(no_signal())))
    }

    /// Flip the lifecycle flag. Pipelines notice it on their next iteration.
    pub fn begin_shutdown(&self) {
        if self.lifecycle.begin_shutdown() {
            info!("registry shutting down");
        }
    }

    /// Flip the flag, stop every pipeline and wait up to `timeout` in total
    /// for their threads to exit.
    pub fn shutdown_all(&self, timeout: Duration) -> ShutdownReport {
        self.begin_shutdown();
        let pipelines = self.list_all();
        for pipeline in &pipelines {
            pipeline.stop();
        }

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for pipeline in pipelines {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let id = pipeline.camera_id().to_string();
            if pipeline.join(remaining) {
                report.stopped.push(id);
            } else {
                warn!(camera_id = %id, "pipeline did not stop in time");
                report.timed_out.push(id);
            }
        }

        info!(
            stopped = report.stopped.len(),
            timed_out = report.timed_out.len(),
            "registry shutdown finished"
        );
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CameraPipeline>>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Gray frame crossed in red, served while a camera has no signal.
pub fn no_signal() -> RgbImage {
    let (w, h) = PLACEHOLDER_SIZE;
    let mut image = RgbImage::from_pixel(w, h, Rgb([48, 48, 48]));
    let red = Rgb([200, 30, 30]);
    let (wf, hf) = ((w - 1) as f32, (h - 1) as f32);
    draw_line_segment_mut(&mut image, (0.0, 0.0), (wf, hf), red);
    draw_line_segment_mut(&mut image, (wf, 0.0), (0.0, hf), red);
    image
}
