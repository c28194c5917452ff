//! Camera and area configuration.
//!
//! Cameras and their areas live in one YAML file. The file is validated as a
//! whole when loaded; a file that fails validation never replaces the
//! snapshot that is currently served.

use anyhow::{bail, Context, Result};
use common::validation::{validate_camera, validate_rois, ValidationError};
use common::{Camera, Credentials, Roi};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, PoisonError};
use std::{env, fs};
use tracing::{debug, info, warn};

/// Configuration lookups a pipeline supervisor and the notifier need.
pub trait CameraStore: Send + Sync {
    fn get_camera(&self, id: &str) -> Option<Camera>;
    fn list_active_cameras(&self) -> Vec<Camera>;
    fn areas(&self, camera_id: &str) -> Vec<Roi>;
    /// Plaintext credentials for the camera, if it needs any.
    fn resolve_credentials(&self, camera: &Camera) -> Result<Option<Credentials>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraEntry {
    #[serde(flatten)]
    pub camera: Camera,
    /// Inline password. Prefer `password_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Name of the environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default)]
    pub areas: Vec<Roi>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreFile {
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
}

impl StoreFile {
    pub fn parse(yaml: &str) -> Result<Self> {
        let file: StoreFile = serde_yaml::from_str(yaml).context("invalid camera configuration")?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for entry in &self.cameras {
            let id = &entry.camera.id;
            validate_camera(&entry.camera).with_context(|| format!("camera '{}'", id))?;
            validate_rois(&entry.areas).with_context(|| format!("areas of camera '{}'", id))?;
            if !ids.insert(id.as_str()) {
                return Err(ValidationError::Duplicate {
                    kind: "camera",
                    id: id.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

pub struct YamlCameraStore {
    path: PathBuf,
    entries: RwLock<StoreFile>,
}

impl YamlCameraStore {
    /// Load and validate the file at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = read_file(&path)?;
        info!(path = %path.display(), cameras = file.cameras.len(), "camera configuration loaded");
        Ok(Self {
            path,
            entries: RwLock::new(file),
        })
    }

    pub fn from_file(path: impl Into<PathBuf>, file: StoreFile) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file. Returns whether the content changed. On error the
    /// current snapshot is kept.
    pub fn reload(&self) -> Result<bool> {
        let next = read_file(&self.path)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if *entries == next {
            debug!(path = %self.path.display(), "camera configuration unchanged");
            return Ok(false);
        }
        info!(path = %self.path.display(), cameras = next.cameras.len(), "camera configuration reloaded");
        *entries = next;
        Ok(true)
    }

    fn with_entry<T>(&self, id: &str, f: impl FnOnce(&CameraEntry) -> T) -> Option<T> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.cameras.iter().find(|e| e.camera.id == id).map(f)
    }
}

impl CameraStore for YamlCameraStore {
    fn get_camera(&self, id: &str) -> Option<Camera> {
        self.with_entry(id, |e| e.camera.clone())
    }

    fn list_active_cameras(&self) -> Vec<Camera> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .cameras
            .iter()
            .filter(|e| e.camera.active)
            .map(|e| e.camera.clone())
            .collect()
    }

    fn areas(&self, camera_id: &str) -> Vec<Roi> {
        self.with_entry(camera_id, |e| e.areas.clone()).unwrap_or_default()
    }

    fn resolve_credentials(&self, camera: &Camera) -> Result<Option<Credentials>> {
        let Some(username) = camera.connection.username.clone() else {
            return Ok(None);
        };
        let Some((password, password_env)) = self.with_entry(&camera.id, |e| (e.password.clone(), e.password_env.clone()))
        else {
            bail!("unknown camera '{}'", camera.id);
        };

        let password = match (password, password_env) {
            (_, Some(var)) => env::var(&var).with_context(|| format!("password variable {} is not set", var))?,
            (Some(password), None) => password,
            (None, None) => String::new(),
        };
        Ok(Some(Credentials { username, password }))
    }
}

fn read_file(path: &Path) -> Result<StoreFile> {
    let yaml = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    StoreFile::parse(&yaml).with_context(|| format!("failed to load {}", path.display()))
}

/// Call `on_change` whenever the file at `path` is written or replaced.
///
/// The parent directory is watched so editors that save through a rename
/// are seen too. The returned watcher must be kept alive.
pub fn watch(path: &Path, on_change: impl Fn() + Send + 'static) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()));
            if relevant {
                on_change();
            }
        }
        Err(e) => warn!(error = %e, "configuration watch error"),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching camera configuration");
    Ok(watcher)
}
