use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use common::{DetectionEvent, EventKind, RecordMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::EventHandler;
use crate::event_bus::{BusMessage, EventBus};
use crate::storage::Storage;
use crate::store::CameraStore;

// ============================================================================
// Event log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Motion,
    Recording,
}

/// One persisted event. A record is appended when it opens and appended
/// again, with the same id, when it closes; the last line for an id wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub camera_id: String,
    pub camera_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi_id: Option<String>,
    pub kind: RecordKind,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

type OpenKey = (String, Option<String>);

struct LogState {
    file: File,
    open: HashMap<OpenKey, EventRecord>,
}

/// JSON-lines event persistence. Motion ends are correlated back to the
/// open motion start of the same camera and area.
pub struct EventLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl EventLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            state: Mutex::new(LogState {
                file,
                open: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records still waiting for their end event.
    pub fn open_records(&self) -> Vec<EventRecord> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open.values().cloned().collect()
    }

    /// Read a log file back, collapsing each record to its latest line.
    pub fn read_records(path: &Path) -> Result<Vec<EventRecord>> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut order: Vec<Uuid> = Vec::new();
        let mut latest: HashMap<Uuid, EventRecord> = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line)
                .with_context(|| format!("malformed event log line in {}", path.display()))?;
            if !latest.contains_key(&record.id) {
                order.push(record.id);
            }
            latest.insert(record.id, record);
        }
        Ok(order.into_iter().filter_map(|id| latest.remove(&id)).collect())
    }

    fn append(file: &mut File, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }
}

impl EventHandler for EventLog {
    fn name(&self) -> &str {
        "event_log"
    }

    fn handle_event(&self, event: &DetectionEvent) -> Result<()> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let key: OpenKey = (event.camera_id.clone(), event.roi_id.clone());

        match event.kind {
            EventKind::MotionStart | EventKind::RecordingStart => {
                let record = EventRecord {
                    id: event.id,
                    camera_id: event.camera_id.clone(),
                    camera_name: event.camera_name.clone(),
                    roi_id: event.roi_id.clone(),
                    kind: if event.kind.is_motion() {
                        RecordKind::Motion
                    } else {
                        RecordKind::Recording
                    },
                    started_at: event.timestamp,
                    ended_at: None,
                    duration_secs: None,
                };
                Self::append(&mut state.file, &record)?;
                if let Some(stale) = state.open.insert(key, record) {
                    warn!(record_id = %stale.id, camera_id = %stale.camera_id, "replaced record that never ended");
                }
            }
            EventKind::MotionEnd | EventKind::RecordingEnd => {
                let mut record = state.open.remove(&key).ok_or_else(|| {
                    anyhow!(
                        "{} for camera {} area {:?} without an open record",
                        event.kind,
                        event.camera_id,
                        event.roi_id
                    )
                })?;
                let elapsed = (event.timestamp - record.started_at).num_milliseconds().max(0) as f64 / 1000.0;
                record.ended_at = Some(event.timestamp);
                record.duration_secs = Some(event.duration_secs.unwrap_or(elapsed));
                Self::append(&mut state.file, &record)?;
                debug!(record_id = %record.id, duration_secs = ?record.duration_secs, "record closed");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Live subscribers
// ============================================================================

/// Fan-out to live clients (WebSocket, SSE). Slow subscribers lag and skip.
pub struct LiveBroadcast {
    tx: broadcast::Sender<DetectionEvent>,
}

impl LiveBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.tx.subscribe()
    }
}

impl EventHandler for LiveBroadcast {
    fn name(&self) -> &str {
        "live_broadcast"
    }

    fn handle_event(&self, event: &DetectionEvent) -> Result<()> {
        // No subscribers is not an error.
        self.tx.send(event.clone()).ok();
        Ok(())
    }
}

// ============================================================================
// Event bus
// ============================================================================

pub struct BusPublisher {
    bus: Arc<EventBus>,
}

impl BusPublisher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl EventHandler for BusPublisher {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn handle_event(&self, event: &DetectionEvent) -> Result<()> {
        self.bus.publish(BusMessage::from(event));
        Ok(())
    }
}

// ============================================================================
// Motion screenshots
// ============================================================================

/// Stores the frame attached to a motion start for cameras recording in
/// screenshot-on-detection mode.
pub struct ScreenshotHandler {
    store: Arc<dyn CameraStore>,
    storage: Arc<dyn Storage>,
}

impl ScreenshotHandler {
    pub fn new(store: Arc<dyn CameraStore>, storage: Arc<dyn Storage>) -> Self {
        Self { store, storage }
    }
}

impl EventHandler for ScreenshotHandler {
    fn name(&self) -> &str {
        "screenshot"
    }

    fn handle_event(&self, event: &DetectionEvent) -> Result<()> {
        if event.kind != EventKind::MotionStart || event.record_mode != RecordMode::DetectionScreenshots {
            return Ok(());
        }
        let Some(frame) = event.frame.as_ref() else {
            return Ok(());
        };
        let camera = self
            .store
            .get_camera(&event.camera_id)
            .ok_or_else(|| anyhow!("camera {} no longer configured", event.camera_id))?;
        let path = self.storage.write_screenshot(&camera, frame)?;
        debug!(camera_id = %camera.id, roi_id = ?event.roi_id, path = ?path, "motion screenshot stored");
        Ok(())
    }
}
