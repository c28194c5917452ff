//! Recording layout on disk.
//!
//! ```text
//! <root>/<camera_id>/cover.jpg
//! <root>/<camera_id>/videos/<timestamp>_<seq>.mp4
//! <root>/<camera_id>/screenshots/<timestamp>_<seq>.jpg
//! ```
//!
//! A camera with an explicit `storage_path` uses it in place of
//! `<root>/<camera_id>`.

use anyhow::{Context, Result};
use chrono::Utc;
use common::Camera;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const JPEG_QUALITY: u8 = 85;
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

pub trait Storage: Send + Sync {
    /// Persist the periodic preview still of a camera.
    fn write_cover_image(&self, camera: &Camera, frame: &RgbImage) -> Result<()>;

    /// Path for a new video segment. Parent directories exist on return.
    fn segment_output_path(&self, camera: &Camera) -> Result<PathBuf>;

    /// Path for a new screenshot. Parent directories exist on return.
    fn screenshot_output_path(&self, camera: &Camera) -> Result<PathBuf>;

    fn write_screenshot(&self, camera: &Camera, frame: &RgbImage) -> Result<PathBuf> {
        let path = self.screenshot_output_path(camera)?;
        write_jpeg(&path, frame)?;
        Ok(path)
    }
}

#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
    /// Disambiguates files created within the same millisecond.
    seq: AtomicU64,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn camera_root(&self, camera: &Camera) -> PathBuf {
        camera
            .storage_path
            .clone()
            .unwrap_or_else(|| self.root.join(&camera.id))
    }

    pub fn cover_path(&self, camera: &Camera) -> PathBuf {
        self.camera_root(camera).join("cover.jpg")
    }

    fn timestamped(&self, camera: &Camera, dir: &str, ext: &str) -> Result<PathBuf> {
        let dir = self.camera_root(camera).join(dir);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        Ok(dir.join(format!("{}_{:06}.{}", Utc::now().format(TIMESTAMP_FORMAT), seq, ext)))
    }
}

impl Storage for FsStorage {
    fn write_cover_image(&self, camera: &Camera, frame: &RgbImage) -> Result<()> {
        let path = self.cover_path(camera);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // Preview readers must never see a half-written cover.
        let tmp = path.with_extension("jpg.tmp");
        write_jpeg(&tmp, frame)?;
        fs::rename(&tmp, &path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn segment_output_path(&self, camera: &Camera) -> Result<PathBuf> {
        self.timestamped(camera, "videos", "mp4")
    }

    fn screenshot_output_path(&self, camera: &Camera) -> Result<PathBuf> {
        self.timestamped(camera, "screenshots", "jpg")
    }
}

/// Encode `frame` as JPEG into `path`.
pub fn write_jpeg(path: &Path, frame: &RgbImage) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(frame)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Encode `frame` as JPEG in memory.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode_image(frame).context("failed to encode jpeg")?;
    Ok(buf)
}
