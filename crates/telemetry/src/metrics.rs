#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Camera pipelines ====
    pub static ref CAMERAS_RUNNING: IntGauge = {
        let metric = IntGauge::new("stream_node_cameras_running", "Number of running camera pipelines")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FRAMES_DECODED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("stream_node_frames_decoded_total", "Total decoded video frames"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECONNECTS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("stream_node_reconnects_total", "Connection attempts after a failure or lost stream"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref MOTION_EVENTS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("stream_node_motion_events_total", "Detection events emitted by camera pipelines"),
            &["kind"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Recording outputs ====
    pub static ref RECORDINGS_OPEN: IntGauge = {
        let metric = IntGauge::new("stream_node_recordings_open", "Output containers currently open")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref OUTPUT_ERRORS: IntCounter = {
        let metric = IntCounter::new(
            "stream_node_output_errors_total",
            "Recording outputs torn down after a write or open failure",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Notifier ====
    pub static ref NOTIFICATIONS_DROPPED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "stream_node_notifications_dropped_total",
                "Events dropped because the notifier queue was full",
            ),
            &["kind"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref NOTIFICATION_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("stream_node_notification_failures_total", "Event handler failures"),
            &["handler"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode all registered metrics in the prometheus text format
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_accessible() {
        CAMERAS_RUNNING.set(3);
        assert_eq!(CAMERAS_RUNNING.get(), 3);

        FRAMES_DECODED.with_label_values(&["cam-test"]).inc_by(5);
        assert_eq!(FRAMES_DECODED.with_label_values(&["cam-test"]).get(), 5);
    }

    #[test]
    fn test_encode_metrics_contains_registered_names() {
        MOTION_EVENTS.with_label_values(&["motion.start"]).inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("stream_node_motion_events_total"));
    }
}
