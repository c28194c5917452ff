use common::Roi;
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::open;
use imageproc::point::Point;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::DetectorConfig;
use crate::filter::{surviving_blobs, Blob};
use crate::preprocess::mean_luma;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEventKind {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionEvent {
    pub roi_id: String,
    pub kind: MotionEventKind,
    pub at: Instant,
    /// Time between motion start and the last active tick, set on `End`.
    pub active_for: Option<Duration>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("frame has no pixels")]
    EmptyFrame,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    since: Instant,
    last_seen: Instant,
}

struct Region {
    roi: Roi,
    /// Polygon mask rasterized for the last seen frame size.
    mask: Option<GrayImage>,
}

impl Region {
    fn new(roi: Roi) -> Self {
        Self { roi, mask: None }
    }

    fn mask_for(&mut self, width: u32, height: u32) -> &GrayImage {
        let stale = self
            .mask
            .as_ref()
            .map_or(true, |m| m.dimensions() != (width, height));
        if stale {
            self.mask = Some(rasterize(&self.roi, width, height));
        }
        // Populated right above.
        self.mask.get_or_insert_with(|| GrayImage::new(width, height))
    }
}

fn rasterize(roi: &Roi, width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let mut points: Vec<Point<i32>> = Vec::with_capacity(roi.points.len());
    for p in &roi.points {
        let (x, y) = p.to_pixel(width, height);
        let pt = Point::new(x, y);
        if points.last() != Some(&pt) {
            points.push(pt);
        }
    }
    // The polygon is implicitly closed; an explicit closing vertex is dropped.
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() >= 3 {
        draw_polygon_mut(&mut mask, &points, Luma([255]));
    }
    mask
}

/// Per-camera motion detector over a mutable set of areas.
pub struct MotionDetector {
    config: DetectorConfig,
    regions: Vec<Region>,
    active: HashMap<String, Activity>,
    /// Blurred previous accepted frame.
    reference: Option<GrayImage>,
    /// Last frame that was bright enough to analyze.
    last_good: Option<GrayImage>,
    dark_streak: u32,
    paused_until: Option<Instant>,
    last_blobs: HashMap<String, Vec<Blob>>,
}

impl MotionDetector {
    pub fn new(config: DetectorConfig, rois: Vec<Roi>) -> Self {
        Self {
            config,
            regions: rois.into_iter().map(Region::new).collect(),
            active: HashMap::new(),
            reference: None,
            last_good: None,
            dark_streak: 0,
            paused_until: None,
            last_blobs: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Swap tuning in place; area activity is kept.
    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
    }

    /// Forget frame history (reference, dark-frame state, cooldown), for
    /// example after the input was reconnected. Area activity is kept and
    /// ends through the normal hold period.
    pub fn reset_history(&mut self) {
        self.reference = None;
        self.last_good = None;
        self.dark_streak = 0;
        self.paused_until = None;
        self.last_blobs.clear();
    }

    /// End every active area immediately, e.g. when detection is switched
    /// off for the camera.
    pub fn end_all(&mut self, now: Instant) -> Vec<MotionEvent> {
        let mut events: Vec<MotionEvent> = self
            .active
            .drain()
            .map(|(roi_id, activity)| MotionEvent {
                roi_id,
                kind: MotionEventKind::End,
                at: now,
                active_for: Some(activity.last_seen.saturating_duration_since(activity.since)),
            })
            .collect();
        events.sort_by(|a, b| a.roi_id.cmp(&b.roi_id));
        self.last_blobs.clear();
        events
    }

    pub fn rois(&self) -> impl Iterator<Item = &Roi> {
        self.regions.iter().map(|r| &r.roi)
    }

    /// Replace the area set. Activity of areas whose id survives the swap is
    /// kept; removed areas are dropped from the active set without emitting
    /// a motion end.
    pub fn update_regions(&mut self, rois: Vec<Roi>) {
        let ids: HashSet<&str> = rois.iter().map(|r| r.id.as_str()).collect();
        self.active.retain(|id, _| ids.contains(id.as_str()));
        self.last_blobs.retain(|id, _| ids.contains(id.as_str()));
        self.regions = rois.into_iter().map(Region::new).collect();
        debug!(regions = self.regions.len(), active = self.active.len(), "regions updated");
    }

    /// Whether any area is active, including areas inside their hold period.
    pub fn is_recording(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn is_active(&self, roi_id: &str) -> bool {
        self.active.contains_key(roi_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True while the detector is cooling down after a scene-wide change.
    pub fn is_paused(&self, now: Instant) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// Contours that made each area active on the last analyzed tick.
    pub fn last_blobs(&self) -> &HashMap<String, Vec<Blob>> {
        &self.last_blobs
    }

    /// Analyze one grayscale frame taken at `now`.
    pub fn process_frame(&mut self, frame: &GrayImage, now: Instant) -> Result<Vec<MotionEvent>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyFrame);
        }

        let current = match self.accept_frame(frame) {
            Some(current) => current,
            None => return Ok(self.expire(now)),
        };

        let blurred = if self.config.blur_sigma > 0.0 {
            gaussian_blur_f32(&current, self.config.blur_sigma)
        } else {
            current
        };

        let reference = match self.reference.replace(blurred) {
            Some(r) if r.dimensions() == (width, height) => r,
            _ => {
                trace!("detector baseline established");
                return Ok(self.expire(now));
            }
        };

        if self.is_paused(now) {
            return Ok(self.expire(now));
        }

        let Some(blurred) = self.reference.as_ref() else {
            return Ok(Vec::new());
        };
        let (diff, mean_diff) = difference(blurred, &reference);

        if mean_diff > self.config.scene_change_ceiling {
            debug!(mean_diff, ceiling = self.config.scene_change_ceiling, "scene-wide change, tick discarded");
            self.last_good = None;
            self.dark_streak = 0;
            self.last_blobs.clear();
            self.paused_until = Some(now + self.config.scene_change_cooldown);
            return Ok(Vec::new());
        }

        let binary = threshold(&diff, self.config.pixel_threshold);
        let binary = if self.config.opening_radius > 0 {
            open(&binary, Norm::LInf, self.config.opening_radius)
        } else {
            binary
        };

        let mut seen = HashSet::new();
        self.last_blobs.clear();
        for region in self.regions.iter_mut() {
            if !region.roi.settings.enabled {
                continue;
            }
            let mask = region.mask_for(width, height);
            let masked = apply_mask(&binary, mask);
            let blobs = surviving_blobs(&masked, &region.roi.settings, self.config.min_solidity);
            if !blobs.is_empty() {
                seen.insert(region.roi.id.clone());
                self.last_blobs.insert(region.roi.id.clone(), blobs);
            }
        }

        let mut events = Vec::new();
        for id in seen {
            match self.active.get_mut(&id) {
                Some(activity) => activity.last_seen = now,
                None => {
                    self.active.insert(id.clone(), Activity { since: now, last_seen: now });
                    events.push(MotionEvent {
                        roi_id: id,
                        kind: MotionEventKind::Start,
                        at: now,
                        active_for: None,
                    });
                }
            }
        }
        events.extend(self.expire(now));
        events.sort_by(|a, b| a.roi_id.cmp(&b.roi_id));
        Ok(events)
    }

    /// Dark-frame handling. Returns the frame to analyze, or `None` when the
    /// tick must be skipped.
    fn accept_frame(&mut self, frame: &GrayImage) -> Option<GrayImage> {
        if mean_luma(frame) >= self.config.dark_luma_threshold {
            self.dark_streak = 0;
            self.last_good = Some(frame.clone());
            return Some(frame.clone());
        }

        self.dark_streak += 1;
        if self.dark_streak > self.config.max_dark_frames {
            trace!(streak = self.dark_streak, "dark frame limit reached, skipping detection");
            return None;
        }
        self.last_good.clone()
    }

    /// End areas whose hold period has elapsed without renewed activity.
    fn expire(&mut self, now: Instant) -> Vec<MotionEvent> {
        let hold = self.config.hold;
        let expired: Vec<(String, Activity)> = self
            .active
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.last_seen) >= hold && a.last_seen != now)
            .map(|(id, a)| (id.clone(), *a))
            .collect();

        let mut events = Vec::with_capacity(expired.len());
        for (id, activity) in expired {
            self.active.remove(&id);
            events.push(MotionEvent {
                roi_id: id,
                kind: MotionEventKind::End,
                at: now,
                active_for: Some(activity.last_seen.saturating_duration_since(activity.since)),
            });
        }
        events
    }
}

fn difference(a: &GrayImage, b: &GrayImage) -> (GrayImage, f32) {
    let mut total: u64 = 0;
    let diff = GrayImage::from_fn(a.width(), a.height(), |x, y| {
        let d = a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0]);
        total += d as u64;
        Luma([d])
    });
    let count = (a.width() as u64 * a.height() as u64).max(1);
    (diff, total as f32 / count as f32)
}

fn threshold(diff: &GrayImage, level: u8) -> GrayImage {
    let mut out = diff.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] > level { 255 } else { 0 };
    }
    out
}

fn apply_mask(binary: &GrayImage, mask: &GrayImage) -> GrayImage {
    let mut out = binary.clone();
    for (p, m) in out.pixels_mut().zip(mask.pixels()) {
        if m[0] == 0 {
            p[0] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Point as RoiPoint, RoiColor, RoiSettings};

    const W: u32 = 160;
    const H: u32 = 120;

    fn left_half(id: &str) -> Roi {
        Roi {
            id: id.to_string(),
            name: id.to_string(),
            points: vec![
                RoiPoint::new(0.0, 0.0),
                RoiPoint::new(0.5, 0.0),
                RoiPoint::new(0.5, 1.0),
                RoiPoint::new(0.0, 1.0),
            ],
            color: RoiColor::default(),
            settings: RoiSettings::default(),
        }
    }

    fn right_half(id: &str) -> Roi {
        let mut roi = left_half(id);
        roi.points = vec![
            RoiPoint::new(0.5, 0.0),
            RoiPoint::new(1.0, 0.0),
            RoiPoint::new(1.0, 1.0),
            RoiPoint::new(0.5, 1.0),
        ];
        roi
    }

    fn background() -> GrayImage {
        GrayImage::from_pixel(W, H, Luma([60]))
    }

    fn with_box(x: u32, y: u32, size: u32) -> GrayImage {
        let mut img = background();
        for px in x..x + size {
            for py in y..y + size {
                img.put_pixel(px, py, Luma([240]));
            }
        }
        img
    }

    fn detector(rois: Vec<Roi>) -> MotionDetector {
        let config = DetectorConfig {
            hold: Duration::from_secs(2),
            scene_change_cooldown: Duration::from_millis(200),
            ..DetectorConfig::default()
        };
        MotionDetector::new(config, rois)
    }

    fn tick(n: u64) -> Duration {
        Duration::from_millis(100 * n)
    }

    #[test]
    fn test_identical_frames_yield_no_events() {
        let mut det = detector(vec![left_half("a"), right_half("b")]);
        let t0 = Instant::now();
        for i in 0..30 {
            let events = det.process_frame(&background(), t0 + tick(i)).unwrap();
            assert!(events.is_empty());
        }
        assert!(!det.is_recording());
    }

    #[test]
    fn test_motion_start_fires_once_per_activation() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();

        let events = det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MotionEventKind::Start);
        assert_eq!(events[0].roi_id, "a");
        assert!(det.is_recording());

        // Box moves again, still active: no second start.
        let events = det.process_frame(&with_box(40, 10, 20), t0 + tick(2)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_motion_outside_roi_is_ignored() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        let events = det.process_frame(&with_box(110, 40, 20), t0 + tick(1)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_motion_end_waits_for_hold() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        // Box disappears: a differing frame, the area stays active.
        det.process_frame(&background(), t0 + tick(2)).unwrap();

        // Quiet frames within the hold period: nothing.
        for i in 3..21 {
            let events = det.process_frame(&background(), t0 + tick(i)).unwrap();
            assert!(events.is_empty(), "no end before hold at tick {}", i);
            assert!(det.is_recording());
        }

        // Hold (2s) measured from the last active tick (tick 2).
        let events = det.process_frame(&background(), t0 + tick(22)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MotionEventKind::End);
        assert_eq!(events[0].active_for, Some(tick(1)));
        assert!(!det.is_recording());

        let events = det.process_frame(&background(), t0 + tick(40)).unwrap();
        assert!(events.is_empty(), "end fires only once");
    }

    #[test]
    fn test_renewed_activity_resets_hold() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        det.process_frame(&background(), t0 + tick(2)).unwrap();
        det.process_frame(&background(), t0 + tick(15)).unwrap();
        // Motion again before the hold elapsed.
        let events = det.process_frame(&with_box(30, 30, 20), t0 + tick(18)).unwrap();
        assert!(events.is_empty());
        let events = det.process_frame(&with_box(30, 30, 20), t0 + tick(23)).unwrap();
        assert!(events.is_empty(), "hold restarted at tick 18");
    }

    #[test]
    fn test_scene_change_discards_tick_and_resets_history() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();

        let bright = GrayImage::from_pixel(W, H, Luma([220]));
        let events = det.process_frame(&bright, t0 + tick(1)).unwrap();
        assert!(events.is_empty());
        assert!(!det.is_recording());
        assert!(det.is_paused(t0 + tick(2)));

        // Real motion against the new baseline once the cooldown is over.
        det.process_frame(&bright, t0 + tick(4)).unwrap();
        let mut moved = bright.clone();
        for px in 10..30 {
            for py in 10..30 {
                moved.put_pixel(px, py, Luma([20]));
            }
        }
        let events = det.process_frame(&moved, t0 + tick(5)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MotionEventKind::Start);
    }

    #[test]
    fn test_dark_frames_are_substituted_then_skipped() {
        let mut det = detector(vec![left_half("a")]);
        det.config.max_dark_frames = 2;
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();

        let dark = GrayImage::from_pixel(W, H, Luma([2]));
        for i in 1..6 {
            let events = det.process_frame(&dark, t0 + tick(i)).unwrap();
            assert!(events.is_empty());
        }
        assert_eq!(det.dark_streak, 5);

        // Light returns: analyzed against the last good frame, no motion.
        let events = det.process_frame(&background(), t0 + tick(6)).unwrap();
        assert!(events.is_empty());
        assert_eq!(det.dark_streak, 0);
    }

    #[test]
    fn test_update_regions_drops_removed_active_roi() {
        let mut det = detector(vec![left_half("a"), right_half("b")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        assert!(det.is_active("a"));

        det.update_regions(vec![right_half("b")]);
        assert!(!det.is_active("a"));

        for i in 2..60 {
            let events = det.process_frame(&background(), t0 + tick(i)).unwrap();
            assert!(events.iter().all(|e| e.roi_id != "a"));
        }
    }

    #[test]
    fn test_update_regions_keeps_state_for_surviving_ids() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();

        let mut resized = left_half("a");
        resized.points[1] = RoiPoint::new(0.6, 0.0);
        det.update_regions(vec![resized, right_half("b")]);
        assert!(det.is_active("a"));

        // Continued motion does not produce a second start.
        let events = det.process_frame(&with_box(20, 20, 20), t0 + tick(2)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_disabled_roi_never_activates() {
        let mut roi = left_half("a");
        roi.settings.enabled = false;
        let mut det = detector(vec![roi]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        let events = det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_end_all_flushes_active_areas() {
        let mut det = detector(vec![left_half("a"), right_half("b")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();

        let events = det.end_all(t0 + tick(2));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].roi_id, "a");
        assert_eq!(events[0].kind, MotionEventKind::End);
        assert!(!det.is_recording());
        assert!(det.end_all(t0 + tick(3)).is_empty());
    }

    #[test]
    fn test_reset_history_rebaselines() {
        let mut det = detector(vec![left_half("a")]);
        let t0 = Instant::now();
        det.process_frame(&background(), t0).unwrap();
        det.reset_history();
        // First frame after a reset only sets the baseline.
        let events = det.process_frame(&with_box(10, 10, 20), t0 + tick(1)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_empty_frame_is_an_error() {
        let mut det = detector(vec![left_half("a")]);
        assert_eq!(
            det.process_frame(&GrayImage::new(0, 0), Instant::now()),
            Err(DetectorError::EmptyFrame)
        );
    }
}
