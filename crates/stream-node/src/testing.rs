//! In-memory doubles for pipeline tests.
//!
//! Everything records into a shared [`OpLog`] so tests can assert the order
//! in which inputs and outputs were opened and closed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{Camera, ConnectionInfo, Credentials, DetectionEvent, EventKind, MotionTuning, Protocol, RecordMode, VideoFrame};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::media::{MediaConnector, MediaError, MediaResult, MediaSource, SinkFactory, SourceInfo, VideoSink};
use crate::notifier::EventSink;
use crate::storage::Storage;

/// Ordered list of operations shared by all doubles of one test.
#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// First word of every entry starting with `prefix`, in order.
    pub fn ops(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .filter_map(|e| e.split_whitespace().next().map(str::to_string))
            .collect()
    }

    /// Poll until `predicate` holds or `timeout` elapses.
    pub fn wait_until(&self, timeout: Duration, predicate: impl Fn(&[String]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.entries()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

// ============================================================================
// Frames and cameras
// ============================================================================

pub fn solid_frame(width: u32, height: u32, luma: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([luma, luma, luma]))
}

/// `background` frame with a `size` square of `foreground` at `(x, y)`.
pub fn frame_with_box(width: u32, height: u32, background: u8, foreground: u8, x: u32, y: u32, size: u32) -> RgbImage {
    let mut frame = solid_frame(width, height, background);
    for py in y..(y + size).min(height) {
        for px in x..(x + size).min(width) {
            frame.put_pixel(px, py, Rgb([foreground, foreground, foreground]));
        }
    }
    frame
}

pub fn test_camera(id: &str, record_mode: RecordMode) -> Camera {
    Camera {
        id: id.to_string(),
        name: format!("Camera {}", id),
        connection: ConnectionInfo {
            protocol: Protocol::File,
            host: String::new(),
            port: None,
            path: format!("/scripted/{}.mp4", id),
            username: None,
        },
        storage_path: None,
        record_mode,
        record_duration: 10,
        active: true,
        motion: MotionTuning::default(),
    }
}

// ============================================================================
// Scripted input
// ============================================================================

/// What a scripted source does once its frames run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    EndOfStream,
    /// Keep the connection open without delivering frames.
    Idle,
    RepeatLast,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub frames: Arc<Vec<RgbImage>>,
    pub frame_delay: Duration,
    pub fps: f32,
    pub on_exhausted: Exhausted,
}

impl Script {
    pub fn new(frames: Vec<RgbImage>, frame_delay: Duration) -> Self {
        Self {
            frames: Arc::new(frames),
            frame_delay,
            fps: 25.0,
            on_exhausted: Exhausted::Idle,
        }
    }

    /// A connection that never delivers a frame.
    pub fn idle() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    pub fn then(mut self, on_exhausted: Exhausted) -> Self {
        self.on_exhausted = on_exhausted;
        self
    }
}

/// Connector serving the same script on every successful connect.
pub struct ScriptedConnector {
    log: OpLog,
    script: Mutex<Script>,
    failures: AtomicUsize,
    panics: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Duration,
    last_credentials: Mutex<Option<Credentials>>,
    delivered: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl ScriptedConnector {
    pub fn new(log: OpLog, script: Script) -> Self {
        Self {
            log,
            script: Mutex::new(script),
            failures: AtomicUsize::new(0),
            panics: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            last_credentials: Mutex::new(None),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `n` connects.
    pub fn fail_connects(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Panic inside the next `n` connects.
    pub fn panic_connects(self, n: usize) -> Self {
        self.panics.store(n, Ordering::SeqCst);
        self
    }

    /// Take this long to connect; longer than the timeout fails.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Script served by later connects.
    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = script;
    }

    /// Successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Credentials passed to the latest successful connect.
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.last_credentials.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Capture time of every frame handed out, across all connections.
    pub fn delivered_at(&self) -> Vec<DateTime<Utc>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl MediaConnector for ScriptedConnector {
    fn connect(
        &self,
        connection: &ConnectionInfo,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> MediaResult<Box<dyn MediaSource>> {
        let panicked = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicked {
            self.log.push(format!("source.panic {}", connection.path));
            panic!("scripted connector panic");
        }

        if !self.connect_delay.is_zero() {
            thread::sleep(self.connect_delay.min(timeout));
            if self.connect_delay > timeout {
                self.log.push(format!("source.timeout {}", connection.path));
                return Err(MediaError::Timeout(timeout));
            }
        }

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.log.push(format!("source.fail {}", connection.path));
            return Err(MediaError::Connect("scripted failure".to_string()));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_credentials.lock().unwrap_or_else(PoisonError::into_inner) = credentials.cloned();
        self.log.push(format!("source.open {}", connection.path));
        let script = self.script.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let (width, height) = script.frames.first().map_or((0, 0), |f| f.dimensions());

        Ok(Box::new(ScriptedSource {
            info: SourceInfo {
                width,
                height,
                fps: script.fps,
            },
            script,
            index: 0,
            next_at: Instant::now(),
            log: self.log.clone(),
            delivered: self.delivered.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSource {
    info: SourceInfo,
    script: Script,
    index: usize,
    next_at: Instant,
    log: OpLog,
    delivered: Arc<Mutex<Vec<DateTime<Utc>>>>,
    closed: bool,
}

impl ScriptedSource {
    fn next_image(&mut self) -> Option<RgbImage> {
        if let Some(frame) = self.script.frames.get(self.index) {
            self.index += 1;
            return Some(frame.clone());
        }
        match self.script.on_exhausted {
            Exhausted::RepeatLast => self.script.frames.last().cloned(),
            Exhausted::EndOfStream | Exhausted::Idle => None,
        }
    }
}

impl MediaSource for ScriptedSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self, timeout: Duration) -> MediaResult<Option<VideoFrame>> {
        let exhausted = self.index >= self.script.frames.len();
        if exhausted {
            match self.script.on_exhausted {
                Exhausted::EndOfStream => return Err(MediaError::EndOfStream),
                Exhausted::Idle => {
                    thread::sleep(timeout);
                    return Ok(None);
                }
                Exhausted::RepeatLast if self.script.frames.is_empty() => {
                    thread::sleep(timeout);
                    return Ok(None);
                }
                Exhausted::RepeatLast => {}
            }
        }

        let now = Instant::now();
        if self.next_at > now {
            let wait = self.next_at - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }

        let Some(image) = self.next_image() else {
            return Ok(None);
        };
        self.next_at = Instant::now() + self.script.frame_delay;
        let frame = VideoFrame::new(image).with_pts(self.index as i64);
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.captured_at);
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.push("source.close");
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Memory output
// ============================================================================

/// Sink factory keeping only frame counts.
#[derive(Debug, Clone)]
pub struct MemorySinkFactory {
    log: OpLog,
    fail_after: Option<u64>,
    fail_opens: Arc<AtomicUsize>,
    finish_delay: Duration,
    flushed: Arc<Mutex<Vec<u64>>>,
}

impl MemorySinkFactory {
    pub fn new(log: OpLog) -> Self {
        Self {
            log,
            fail_after: None,
            fail_opens: Arc::new(AtomicUsize::new(0)),
            finish_delay: Duration::ZERO,
            flushed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every sink rejects writes after `frames` frames.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Fail the next `n` opens.
    pub fn fail_opens(self, n: usize) -> Self {
        self.fail_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Simulate an encoder draining its buffers on finish.
    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = delay;
        self
    }

    /// Frames flushed by every finished sink, in close order.
    pub fn flushed(&self) -> Vec<u64> {
        self.flushed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f32) -> MediaResult<Box<dyn VideoSink>> {
        let failed = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            self.log.push(format!("sink.fail {}", path.display()));
            return Err(MediaError::Encode("scripted open failure".to_string()));
        }

        self.log.push(format!("sink.open {} {}x{}@{}", path.display(), width, height, fps));
        Ok(Box::new(MemorySink {
            log: self.log.clone(),
            size: (width, height),
            written: 0,
            fail_after: self.fail_after,
            finish_delay: self.finish_delay,
            flushed: self.flushed.clone(),
        }))
    }
}

struct MemorySink {
    log: OpLog,
    size: (u32, u32),
    written: u64,
    fail_after: Option<u64>,
    finish_delay: Duration,
    flushed: Arc<Mutex<Vec<u64>>>,
}

impl VideoSink for MemorySink {
    fn write(&mut self, frame: &RgbImage) -> MediaResult<()> {
        if frame.dimensions() != self.size {
            return Err(MediaError::Encode(format!(
                "frame is {:?}, sink expects {:?}",
                frame.dimensions(),
                self.size
            )));
        }
        if self.fail_after.is_some_and(|n| self.written >= n) {
            self.log.push("sink.error");
            return Err(MediaError::Encode("scripted write failure".to_string()));
        }
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> MediaResult<u64> {
        if !self.finish_delay.is_zero() {
            thread::sleep(self.finish_delay);
        }
        self.flushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.written);
        self.log.push(format!("sink.close {}", self.written));
        Ok(self.written)
    }
}

// ============================================================================
// Storage and events
// ============================================================================

/// Storage that only counts what it was asked to write.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    covers: AtomicUsize,
    screenshots: AtomicUsize,
    seq: AtomicU64,
}

impl MemoryStorage {
    pub fn covers(&self) -> usize {
        self.covers.load(Ordering::SeqCst)
    }

    pub fn screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    fn next_path(&self, camera: &Camera, dir: &str, ext: &str) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        PathBuf::from(format!("/memory/{}/{}/{:06}.{}", camera.id, dir, seq, ext))
    }
}

impl Storage for MemoryStorage {
    fn write_cover_image(&self, _camera: &Camera, _frame: &RgbImage) -> Result<()> {
        self.covers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn segment_output_path(&self, camera: &Camera) -> Result<PathBuf> {
        Ok(self.next_path(camera, "videos", "mp4"))
    }

    fn screenshot_output_path(&self, camera: &Camera) -> Result<PathBuf> {
        Ok(self.next_path(camera, "screenshots", "jpg"))
    }

    fn write_screenshot(&self, camera: &Camera, _frame: &RgbImage) -> Result<PathBuf> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        self.screenshot_output_path(camera)
    }
}

/// Event sink collecting everything in arrival order.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DetectionEvent>>,
    changed: Condvar,
}

impl RecordingEventSink {
    fn push(&self, event: DetectionEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<DetectionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    /// Block until at least `n` events of `kind` arrived or `timeout` elapses.
    pub fn wait_for(&self, kind: EventKind, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if events.iter().filter(|e| e.kind == kind).count() >= n {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .changed
                .wait_timeout(events, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl EventSink for RecordingEventSink {
    fn motion_started(&self, event: DetectionEvent) {
        self.push(event);
    }

    fn motion_ended(&self, event: DetectionEvent) {
        self.push(event);
    }

    fn recording_started(&self, event: DetectionEvent) {
        self.push(event);
    }

    fn recording_ended(&self, event: DetectionEvent) {
        self.push(event);
    }
}
