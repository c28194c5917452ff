use common::Camera;
use image::RgbImage;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::storage::Storage;

/// Output used by the screenshot record modes: one JPEG per interval while
/// the output is open.
#[derive(Debug)]
pub struct ScreenshotRecorder {
    interval: Duration,
    last: Option<Instant>,
    written: u64,
}

impl ScreenshotRecorder {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            written: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Store `frame` if the interval has elapsed. Returns whether a file was
    /// written.
    pub fn capture(
        &mut self,
        storage: &dyn Storage,
        camera: &Camera,
        frame: &RgbImage,
        now: Instant,
    ) -> anyhow::Result<bool> {
        if !self.is_due(now) {
            return Ok(false);
        }
        // Advance first so a failing disk is retried at the interval, not per frame.
        self.last = Some(now);
        let path = storage.write_screenshot(camera, frame)?;
        self.written += 1;
        debug!(camera_id = %camera.id, path = ?path, "screenshot stored");
        Ok(true)
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use common::{ConnectionInfo, MotionTuning, Protocol, RecordMode};

    fn camera() -> Camera {
        Camera {
            id: "cam-1".to_string(),
            name: "Gate".to_string(),
            connection: ConnectionInfo {
                protocol: Protocol::Usb,
                host: String::new(),
                port: None,
                path: "/dev/video0".to_string(),
                username: None,
            },
            storage_path: None,
            record_mode: RecordMode::Screenshots,
            record_duration: 10,
            active: true,
            motion: MotionTuning::default(),
        }
    }

    #[test]
    fn test_capture_respects_interval() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let cam = camera();
        let frame = RgbImage::new(8, 8);
        let mut recorder = ScreenshotRecorder::new(Duration::from_secs(1));
        let t0 = Instant::now();

        assert!(recorder.capture(&storage, &cam, &frame, t0).unwrap());
        assert!(!recorder.capture(&storage, &cam, &frame, t0 + Duration::from_millis(500)).unwrap());
        assert!(recorder.capture(&storage, &cam, &frame, t0 + Duration::from_millis(1000)).unwrap());
        assert_eq!(recorder.written(), 2);

        let files = std::fs::read_dir(dir.path().join("cam-1").join("screenshots"))
            .unwrap()
            .count();
        assert_eq!(files, 2);
    }
}
