//! Keeps the registry in line with the camera configuration.

use anyhow::{Context, Result};
use common::Camera;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use notify::RecommendedWatcher;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::pipeline::{CameraPipeline, PipelineDeps, PipelineSettings};
use crate::registry::StreamRegistry;
use crate::store::{self, CameraStore, YamlCameraStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub reconfigured: Vec<String>,
    pub regions_updated: Vec<String>,
    pub removed: Vec<String>,
}

pub struct Supervisor {
    store: Arc<dyn CameraStore>,
    registry: Arc<StreamRegistry>,
    settings: PipelineSettings,
    deps: PipelineDeps,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn CameraStore>,
        registry: Arc<StreamRegistry>,
        settings: PipelineSettings,
        deps: PipelineDeps,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            deps,
            stop_timeout,
        }
    }

    /// Start pipelines for new active cameras, hand changed snapshots to
    /// running ones and stop the ones no longer active.
    pub fn sync(&self) -> SyncReport {
        let mut report = SyncReport::default();
        if self.registry.is_shutting_down() {
            return report;
        }

        let cameras = self.store.list_active_cameras();
        let wanted: HashSet<&str> = cameras.iter().map(|c| c.id.as_str()).collect();

        for pipeline in self.registry.list_all() {
            if wanted.contains(pipeline.camera_id()) {
                continue;
            }
            let id = pipeline.camera_id().to_string();
            self.registry.remove(&id);
            if !pipeline.shutdown(self.stop_timeout) {
                warn!(camera_id = %id, "removed pipeline still stopping");
            }
            report.removed.push(id);
        }

        for camera in cameras {
            let id = camera.id.clone();
            let regions = self.store.areas(&id);
            match self.registry.find_by_camera_id(&id) {
                Some(pipeline) => {
                    match self.store.resolve_credentials(&camera) {
                        Ok(credentials) => {
                            if pipeline.camera() != camera || pipeline.credentials() != credentials {
                                pipeline.update_camera(camera, credentials);
                                report.reconfigured.push(id.clone());
                            }
                        }
                        Err(e) => warn!(camera_id = %id, error = %format!("{:#}", e), "camera update skipped"),
                    }
                    if pipeline.regions() != regions {
                        pipeline.update_regions(regions);
                        report.regions_updated.push(id);
                    }
                }
                None => match self.start_camera(camera) {
                    Ok(()) => report.started.push(id),
                    Err(e) => error!(camera_id = %id, error = %format!("{:#}", e), "failed to start camera"),
                },
            }
        }

        info!(
            started = report.started.len(),
            reconfigured = report.reconfigured.len(),
            regions_updated = report.regions_updated.len(),
            removed = report.removed.len(),
            "camera sync complete"
        );
        report
    }

    fn start_camera(&self, camera: Camera) -> Result<()> {
        let credentials = self.store.resolve_credentials(&camera)?;
        let regions = self.store.areas(&camera.id);
        let pipeline = Arc::new(CameraPipeline::new(
            camera,
            credentials,
            regions,
            self.settings.clone(),
            self.deps.clone(),
            self.registry.lifecycle(),
        ));
        pipeline.start()?;
        self.registry.add(pipeline);
        Ok(())
    }
}

/// File watcher plus the thread that reloads and syncs on change.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
    _thread: JoinHandle<()>,
}

/// Reload `store` and sync whenever its file changes. Bursts of file events
/// within `debounce` cause one reload. Dropping the returned value stops
/// watching.
pub fn watch_config(
    store: Arc<YamlCameraStore>,
    supervisor: Arc<Supervisor>,
    debounce: Duration,
) -> Result<ConfigWatch> {
    let (tx, rx) = unbounded::<()>();
    let watcher = store::watch(store.path(), move || {
        tx.send(()).ok();
    })?;

    let thread = thread::Builder::new()
        .name("config-reload".to_string())
        .spawn(move || {
            while rx.recv().is_ok() {
                loop {
                    match rx.recv_timeout(debounce) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                match store.reload() {
                    Ok(true) => {
                        supervisor.sync();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %format!("{:#}", e), "configuration reload rejected, keeping previous"),
                }
            }
        })
        .context("failed to spawn config reload thread")?;

    Ok(ConfigWatch {
        _watcher: watcher,
        _thread: thread,
    })
}
