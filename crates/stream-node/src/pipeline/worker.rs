use chrono::Utc;
use common::{Camera, Credentials, DetectionEvent, Roi, VideoFrame};
use crossbeam_channel::{Receiver, Sender};
use image::RgbImage;
use motion_detector::{downscale, render_overlay, to_luma, MotionDetector, MotionEvent, MotionEventKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use telemetry::metrics::{CAMERAS_RUNNING, FRAMES_DECODED, MOTION_EVENTS, RECONNECTS};
use tracing::{debug, error, info, info_span, warn};

use super::recorder::Recorder;
use super::{Command, PipelineDeps, PipelineSettings, PipelineState, Shared};
use crate::media::{MediaError, MediaSource};

const POLL_SLICE: Duration = Duration::from_millis(50);

/// Why a streaming session ended.
enum StreamEnd {
    Stop,
    Reconfigure,
    Lost(String),
}

/// Everything owned by a camera thread.
pub(crate) struct Worker {
    camera: Camera,
    credentials: Option<Credentials>,
    settings: PipelineSettings,
    deps: PipelineDeps,
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    /// Dropped with the worker; wakes `CameraPipeline::join`.
    _done: Sender<()>,
    detector: MotionDetector,
    recorder: Recorder,
    last_cover: Option<Instant>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        camera: Camera,
        credentials: Option<Credentials>,
        regions: Vec<Roi>,
        settings: PipelineSettings,
        deps: PipelineDeps,
        shared: Arc<Shared>,
        commands: Receiver<Command>,
        done: Sender<()>,
    ) -> Self {
        let detector = MotionDetector::new(settings.detector.clone().with_tuning(&camera.motion), regions);
        let recorder = Recorder::new(
            deps.sinks.clone(),
            deps.storage.clone(),
            settings.output_retry_backoff,
            settings.screenshot_interval,
            settings.fallback_fps,
        );

        Self {
            camera,
            credentials,
            settings,
            deps,
            shared,
            commands,
            _done: done,
            detector,
            recorder,
            last_cover: None,
        }
    }

    pub(crate) fn run(mut self) {
        let span = info_span!("camera", camera_id = %self.camera.id);
        let _entered = span.enter();

        CAMERAS_RUNNING.inc();
        info!(
            uri = %self.camera.connection.redacted_uri(),
            record_mode = %self.camera.record_mode,
            areas = self.detector.rois().count(),
            "camera pipeline running"
        );

        while !self.shared.should_stop() {
            self.shared.set_state(PipelineState::Connecting);
            self.apply_pending_commands();

            let connected = catch_unwind(AssertUnwindSafe(|| {
                self.deps.connector.connect(
                    &self.camera.connection,
                    self.credentials.as_ref(),
                    self.settings.connect_timeout,
                )
            }));
            let mut source = match connected {
                Ok(Ok(source)) => source,
                Ok(Err(e)) => {
                    RECONNECTS.with_label_values(&[&self.camera.id]).inc();
                    warn!(error = %e, retry_in = ?self.settings.reconnect_backoff, "connect failed");
                    self.backoff();
                    continue;
                }
                Err(_) => {
                    RECONNECTS.with_label_values(&[&self.camera.id]).inc();
                    error!(retry_in = ?self.settings.reconnect_backoff, "connect panicked");
                    self.backoff();
                    continue;
                }
            };

            let info = source.info();
            info!(width = info.width, height = info.height, fps = info.fps, "camera connected");
            self.shared.set_state(PipelineState::Streaming);

            let outcome = match catch_unwind(AssertUnwindSafe(|| self.stream(source.as_mut()))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("capture loop panicked");
                    self.end_session(Instant::now());
                    StreamEnd::Lost("capture loop panicked".to_string())
                }
            };
            source.close();

            match outcome {
                StreamEnd::Stop => break,
                StreamEnd::Reconfigure => {
                    info!(uri = %self.camera.connection.redacted_uri(), record_mode = %self.camera.record_mode, "reconnecting with new configuration");
                }
                StreamEnd::Lost(reason) => {
                    RECONNECTS.with_label_values(&[&self.camera.id]).inc();
                    warn!(reason = %reason, retry_in = ?self.settings.reconnect_backoff, "connection lost");
                    self.backoff();
                }
            }
        }

        self.end_session(Instant::now());
        self.shared.set_state(PipelineState::Stopped);
        CAMERAS_RUNNING.dec();
        info!("camera pipeline stopped");
    }

    /// Pull and process frames until stopped, reconfigured or disconnected.
    fn stream(&mut self, source: &mut dyn MediaSource) -> StreamEnd {
        let fps = source.info().fps;
        self.recorder
            .set_fps(if fps > 0.0 { fps } else { self.settings.fallback_fps });
        self.detector.reset_history();
        let mut last_frame = Instant::now();

        loop {
            if self.shared.should_stop() {
                self.end_session(Instant::now());
                return StreamEnd::Stop;
            }
            if let Some(end) = self.drain_commands() {
                return end;
            }

            match source.read_frame(self.settings.read_timeout) {
                Ok(Some(frame)) => {
                    let now = Instant::now();
                    last_frame = now;
                    self.handle_frame(frame, now);
                }
                Ok(None) | Err(MediaError::Timeout(_)) => {
                    if last_frame.elapsed() >= self.settings.stall_timeout {
                        self.end_session(Instant::now());
                        return StreamEnd::Lost(format!("no frame for {:?}", self.settings.stall_timeout));
                    }
                }
                Err(e) => {
                    self.end_session(Instant::now());
                    return StreamEnd::Lost(e.to_string());
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: VideoFrame, now: Instant) {
        FRAMES_DECODED.with_label_values(&[&self.camera.id]).inc();
        let small = downscale(&frame.image, self.detector.config().detection_width);

        if self.camera.record_mode.is_permanent() {
            self.arm(now);
        }

        self.maybe_write_cover(&frame.image, now);

        if self.recorder.is_armed() {
            self.recorder.write(&self.camera, &frame.image, now);
        }

        if self.camera.record_mode.uses_detection() && !self.detector.is_paused(now) {
            match self.detector.process_frame(&to_luma(&small), now) {
                Ok(events) => self.dispatch_motion(events, Some(&frame.image)),
                Err(e) => debug!(error = %e, "frame skipped for detection"),
            }
            if self.detector.is_recording() {
                self.arm(now);
            } else {
                self.disarm(now);
            }
        }

        if self.camera.record_mode.is_permanent() && self.camera.record_mode.records_video() {
            let segment = self.settings.segment_unit * self.camera.record_duration.max(1);
            self.recorder.rotate_if_due(segment, now);
        }

        let preview = if self.settings.debug_overlay {
            let mut preview = small;
            let size = preview.dimensions();
            render_overlay(&mut preview, &self.detector, size);
            preview
        } else {
            small
        };
        self.shared.publish_frame(Arc::new(preview));
    }

    fn maybe_write_cover(&mut self, frame: &RgbImage, now: Instant) {
        let due = self
            .last_cover
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.cover_interval);
        if !due {
            return;
        }
        self.last_cover = Some(now);
        if let Err(e) = self.deps.storage.write_cover_image(&self.camera, frame) {
            warn!(error = %format!("{:#}", e), "failed to store cover image");
        }
    }

    fn dispatch_motion(&self, events: Vec<MotionEvent>, frame: Option<&Arc<RgbImage>>) {
        for event in events {
            match event.kind {
                MotionEventKind::Start => {
                    MOTION_EVENTS.with_label_values(&["motion.start"]).inc();
                    info!(roi_id = %event.roi_id, "motion started");
                    self.deps.events.motion_started(DetectionEvent::motion_start(
                        &self.camera,
                        event.roi_id,
                        Utc::now(),
                        frame.cloned(),
                    ));
                }
                MotionEventKind::End => {
                    MOTION_EVENTS.with_label_values(&["motion.end"]).inc();
                    info!(roi_id = %event.roi_id, active_for = ?event.active_for, "motion ended");
                    self.deps
                        .events
                        .motion_ended(DetectionEvent::motion_end(&self.camera, event.roi_id, Utc::now()));
                }
            }
        }
    }

    fn arm(&mut self, now: Instant) {
        if self.recorder.arm(now) {
            self.shared.set_recording(true);
            info!("recording armed");
            self.deps
                .events
                .recording_started(DetectionEvent::recording_start(&self.camera, Utc::now()));
        }
    }

    fn disarm(&mut self, now: Instant) {
        if let Some(duration_secs) = self.recorder.disarm(now) {
            self.shared.set_recording(false);
            info!(duration_secs, "recording disarmed");
            self.deps
                .events
                .recording_ended(DetectionEvent::recording_end(&self.camera, Utc::now(), duration_secs));
        }
    }

    /// End active motion, disarm and close the output. Safe to call twice.
    fn end_session(&mut self, now: Instant) {
        let ended = self.detector.end_all(now);
        self.dispatch_motion(ended, None);
        self.detector.reset_history();
        self.disarm(now);
    }

    /// Apply queued commands while streaming. Returns `Some` when the change
    /// needs the connection torn down.
    fn drain_commands(&mut self) -> Option<StreamEnd> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::UpdateRegions(regions) => {
                    info!(areas = regions.len(), "areas updated");
                    self.detector.update_regions(regions);
                }
                Command::UpdateCamera(camera, credentials) => {
                    let reconnect =
                        self.camera.requires_reconfigure(&camera) || self.credentials != credentials;
                    if reconnect {
                        self.shared.set_state(PipelineState::Reconfiguring);
                        info!(
                            from = %self.camera.record_mode,
                            to = %camera.record_mode,
                            "reconfiguring camera"
                        );
                        self.end_session(Instant::now());
                        self.adopt(*camera, credentials);
                        return Some(StreamEnd::Reconfigure);
                    }
                    self.adopt(*camera, credentials);
                }
            }
        }
        None
    }

    /// Apply queued commands while no session is open.
    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::UpdateRegions(regions) => self.detector.update_regions(regions),
                Command::UpdateCamera(camera, credentials) => self.adopt(*camera, credentials),
            }
        }
    }

    fn adopt(&mut self, camera: Camera, credentials: Option<Credentials>) {
        if camera.motion != self.camera.motion {
            self.detector
                .set_config(self.settings.detector.clone().with_tuning(&camera.motion));
        }
        debug!(name = %camera.name, "camera snapshot adopted");
        self.camera = camera;
        self.credentials = credentials;
    }

    /// Sleep for the reconnect backoff, waking early on stop or a new command.
    fn backoff(&self) {
        let deadline = Instant::now() + self.settings.reconnect_backoff;
        while !self.shared.should_stop() && self.commands.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}
