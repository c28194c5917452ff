//! Fire-and-forget dispatch of detection events.
//!
//! Camera pipelines call the [`EventSink`] methods synchronously from their
//! capture loop. [`Notifier`] queues the event onto a bounded worker pool and
//! returns immediately; handler errors and panics are logged and counted,
//! never propagated. Events of one camera always land on the same worker so
//! a motion end is handled after its start. A full queue drops start events
//! at once; end events wait up to [`END_EVENT_WAIT`] for a slot first.

pub mod handlers;

use common::{DetectionEvent, EventKind};
use crossbeam_channel::{bounded, SendTimeoutError, Sender, TrySendError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use telemetry::metrics::{NOTIFICATIONS_DROPPED, NOTIFICATION_FAILURES};
use tracing::{debug, error, info, warn};

pub use handlers::{BusPublisher, EventLog, EventRecord, LiveBroadcast, ScreenshotHandler};

/// How long an end event may block the caller waiting for queue space.
pub const END_EVENT_WAIT: Duration = Duration::from_millis(100);

/// Receiver of the events a camera pipeline produces.
pub trait EventSink: Send + Sync {
    fn motion_started(&self, event: DetectionEvent);
    fn motion_ended(&self, event: DetectionEvent);
    fn recording_started(&self, event: DetectionEvent);
    fn recording_ended(&self, event: DetectionEvent);
}

/// One side effect performed for every event.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle_event(&self, event: &DetectionEvent) -> anyhow::Result<()>;
}

pub struct Notifier {
    lanes: Mutex<Vec<Sender<DetectionEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Notifier {
    /// Spawn `workers` threads sharing `queue` slots of backlog.
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>, workers: usize, queue: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let per_lane = queue.div_ceil(workers).max(1);
        let handlers: Arc<[Arc<dyn EventHandler>]> = handlers.into();

        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, rx) = bounded::<DetectionEvent>(per_lane);
            let handlers = handlers.clone();
            let handle = thread::Builder::new()
                .name(format!("notifier-{}", lane))
                .spawn(move || {
                    for event in rx.iter() {
                        dispatch(&handlers, &event);
                    }
                })?;
            lanes.push(tx);
            handles.push(handle);
        }

        info!(workers, queue_per_worker = per_lane, handlers = handlers.len(), "notifier started");

        Ok(Self {
            lanes: Mutex::new(lanes),
            workers: Mutex::new(handles),
        })
    }

    /// Queue `event`. Start events never block; end events block for at
    /// most [`END_EVENT_WAIT`]. Returns `false` when the event was dropped.
    pub fn notify(&self, event: DetectionEvent) -> bool {
        let (lane, sender) = {
            let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            if lanes.is_empty() {
                debug!(event_id = %event.id, "notifier stopped, event discarded");
                return false;
            }
            let lane = lane_for(&event.camera_id, lanes.len());
            (lane, lanes[lane].clone())
        };

        let event = match sender.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(event)) if is_end(event.kind) => {
                match sender.send_timeout(event, END_EVENT_WAIT) {
                    Ok(()) => return true,
                    Err(SendTimeoutError::Timeout(event)) => event,
                    Err(SendTimeoutError::Disconnected(event)) => {
                        error!(event_id = %event.id, lane, "notifier worker gone, event dropped");
                        return false;
                    }
                }
            }
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Disconnected(event)) => {
                error!(event_id = %event.id, lane, "notifier worker gone, event dropped");
                return false;
            }
        };

        NOTIFICATIONS_DROPPED.with_label_values(&[event.kind.topic()]).inc();
        warn!(
            event_id = %event.id,
            camera_id = %event.camera_id,
            kind = %event.kind,
            "notifier queue full, event dropped"
        );
        false
    }

    /// Stop accepting events, let workers drain their queues and join them.
    pub fn shutdown(&self) {
        let lanes: Vec<_> = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        drop(lanes);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("notifier worker panicked");
            }
        }
        info!("notifier stopped");
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EventSink for Notifier {
    fn motion_started(&self, event: DetectionEvent) {
        self.notify(event);
    }

    fn motion_ended(&self, event: DetectionEvent) {
        self.notify(event);
    }

    fn recording_started(&self, event: DetectionEvent) {
        self.notify(event);
    }

    fn recording_ended(&self, event: DetectionEvent) {
        self.notify(event);
    }
}

fn is_end(kind: EventKind) -> bool {
    matches!(kind, EventKind::MotionEnd | EventKind::RecordingEnd)
}

fn lane_for(camera_id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    camera_id.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

fn dispatch(handlers: &[Arc<dyn EventHandler>], event: &DetectionEvent) {
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                NOTIFICATION_FAILURES.with_label_values(&[handler.name()]).inc();
                warn!(
                    handler = handler.name(),
                    event_id = %event.id,
                    camera_id = %event.camera_id,
                    roi_id = ?event.roi_id,
                    kind = %event.kind,
                    error = %format!("{:#}", e),
                    "event handler failed"
                );
            }
            Err(_) => {
                NOTIFICATION_FAILURES.with_label_values(&[handler.name()]).inc();
                error!(
                    handler = handler.name(),
                    event_id = %event.id,
                    camera_id = %event.camera_id,
                    kind = %event.kind,
                    "event handler panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{Camera, ConnectionInfo, MotionTuning, Protocol, RecordMode};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    fn camera(id: &str) -> Camera {
        Camera {
            id: id.to_string(),
            name: id.to_string(),
            connection: ConnectionInfo {
                protocol: Protocol::Rtsp,
                host: "10.0.0.5".to_string(),
                port: None,
                path: "/live".to_string(),
                username: None,
            },
            storage_path: None,
            record_mode: RecordMode::DetectionVideo,
            record_duration: 10,
            active: true,
            motion: MotionTuning::default(),
        }
    }

    struct Collect {
        tx: Sender<DetectionEvent>,
    }

    impl EventHandler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn handle_event(&self, event: &DetectionEvent) -> anyhow::Result<()> {
            self.tx.send(event.clone()).ok();
            Ok(())
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn handle_event(&self, _event: &DetectionEvent) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    struct Panicking;

    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn handle_event(&self, _event: &DetectionEvent) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    /// Blocks inside the handler until released.
    struct Gate {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl EventHandler for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn handle_event(&self, _event: &DetectionEvent) -> anyhow::Result<()> {
            self.entered.send(()).ok();
            self.release.recv().ok();
            Ok(())
        }
    }

    fn collector() -> (Arc<dyn EventHandler>, Receiver<DetectionEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(Collect { tx }), rx)
    }

    #[test]
    fn test_failures_do_not_stop_other_handlers() {
        let (collect, rx) = collector();
        let notifier = Notifier::new(vec![Arc::new(Failing), Arc::new(Panicking), collect], 2, 16).unwrap();

        let cam = camera("cam-1");
        notifier.motion_started(DetectionEvent::motion_start(&cam, "door", Utc::now(), None));
        notifier.motion_ended(DetectionEvent::motion_end(&cam, "door", Utc::now()));

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, common::EventKind::MotionStart);
        assert_eq!(second.kind, common::EventKind::MotionEnd);
        notifier.shutdown();
    }

    #[test]
    fn test_events_of_one_camera_stay_ordered() {
        let (collect, rx) = collector();
        let notifier = Notifier::new(vec![collect], 4, 256).unwrap();
        let cam = camera("cam-7");

        for i in 0..50 {
            notifier.notify(DetectionEvent::motion_start(&cam, format!("roi-{}", i), Utc::now(), None));
        }
        notifier.shutdown();

        let got: Vec<String> = rx.try_iter().filter_map(|e| e.roi_id).collect();
        let expected: Vec<String> = (0..50).map(|i| format!("roi-{}", i)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (notifier, entered_rx, release_tx, rx) = gated(1);
        let cam = camera("cam-2");

        assert!(notifier.notify(DetectionEvent::recording_start(&cam, Utc::now())));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // Worker is busy: one slot of backlog, then starts drop at once.
        let dropped = NOTIFICATIONS_DROPPED.with_label_values(&["recording.start"]).get();
        assert!(notifier.notify(DetectionEvent::recording_end(&cam, Utc::now(), 1.0)));
        let started = std::time::Instant::now();
        assert!(!notifier.notify(DetectionEvent::recording_start(&cam, Utc::now())));
        assert!(started.elapsed() < END_EVENT_WAIT);
        assert_eq!(NOTIFICATIONS_DROPPED.with_label_values(&["recording.start"]).get(), dropped + 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        notifier.shutdown();
        assert_eq!(rx.try_iter().count(), 2);
    }

    fn gated(queue: usize) -> (Notifier, Receiver<()>, Sender<()>, Receiver<DetectionEvent>) {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let (collect, rx) = collector();
        let gate: Arc<dyn EventHandler> = Arc::new(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        let notifier = Notifier::new(vec![gate, collect], 1, queue).unwrap();
        (notifier, entered_rx, release_tx, rx)
    }

    #[test]
    fn test_end_event_waits_for_queue_space() {
        let (notifier, entered, release, rx) = gated(1);
        let cam = camera("cam-3");

        assert!(notifier.notify(DetectionEvent::motion_start(&cam, "door", Utc::now(), None)));
        entered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(notifier.notify(DetectionEvent::recording_start(&cam, Utc::now())));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for _ in 0..3 {
                release.send(()).ok();
            }
        });
        assert!(notifier.notify(DetectionEvent::motion_end(&cam, "door", Utc::now())));
        releaser.join().unwrap();
        notifier.shutdown();

        let kinds: Vec<_> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::MotionStart, EventKind::RecordingStart, EventKind::MotionEnd]);
    }

    #[test]
    fn test_end_event_dropped_after_bounded_wait() {
        let (notifier, entered, release, rx) = gated(1);
        let cam = camera("cam-4");
        let dropped = NOTIFICATIONS_DROPPED.with_label_values(&["motion.end"]).get();

        assert!(notifier.notify(DetectionEvent::motion_start(&cam, "door", Utc::now(), None)));
        entered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(notifier.notify(DetectionEvent::recording_start(&cam, Utc::now())));

        let started = std::time::Instant::now();
        assert!(!notifier.notify(DetectionEvent::motion_end(&cam, "door", Utc::now())));
        let waited = started.elapsed();
        assert!(waited >= END_EVENT_WAIT);
        assert!(waited < Duration::from_secs(1));
        assert_eq!(NOTIFICATIONS_DROPPED.with_label_values(&["motion.end"]).get(), dropped + 1);

        release.send(()).unwrap();
        release.send(()).unwrap();
        notifier.shutdown();
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_notify_after_shutdown_is_discarded() {
        let (collect, rx) = collector();
        let notifier = Notifier::new(vec![collect], 1, 4).unwrap();
        notifier.shutdown();
        assert!(!notifier.notify(DetectionEvent::recording_start(&camera("c"), Utc::now())));
        assert!(rx.try_recv().is_err());
        // Second shutdown is a no-op.
        notifier.shutdown();
    }
}
