//! Registry-driven shutdown against slow camera I/O.

use common::RecordMode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_node::testing::{
    solid_frame, test_camera, Exhausted, MemorySinkFactory, MemoryStorage, OpLog, RecordingEventSink, Script,
    ScriptedConnector,
};
use stream_node::{CameraPipeline, PipelineDeps, PipelineSettings, PipelineState, StreamRegistry};

#[test]
fn test_shutdown_all_reaches_stopped_within_timeout() {
    let registry = StreamRegistry::new();
    let log = OpLog::default();
    let settings = PipelineSettings {
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_millis(200),
        ..PipelineSettings::default()
    };

    let cameras = [
        ("idle-1", RecordMode::DetectionVideo, Script::idle()),
        ("idle-2", RecordMode::DetectionScreenshots, Script::idle()),
        (
            "video-1",
            RecordMode::Video,
            Script::new(vec![solid_frame(64, 48, 90)], Duration::from_millis(150)).then(Exhausted::RepeatLast),
        ),
        (
            "video-2",
            RecordMode::Video,
            Script::new(vec![solid_frame(64, 48, 90)], Duration::from_millis(150)).then(Exhausted::RepeatLast),
        ),
    ];

    for (id, mode, script) in cameras {
        let connector = ScriptedConnector::new(log.clone(), script).with_connect_delay(Duration::from_millis(300));
        let deps = PipelineDeps {
            connector: Arc::new(connector),
            // Encoder takes a while to drain on close.
            sinks: Arc::new(MemorySinkFactory::new(log.clone()).with_finish_delay(Duration::from_millis(100))),
            storage: Arc::new(MemoryStorage::default()),
            events: Arc::new(RecordingEventSink::default()),
        };
        let pipeline = Arc::new(CameraPipeline::new(
            test_camera(id, mode),
            None,
            Vec::new(),
            settings.clone(),
            deps,
            registry.lifecycle(),
        ));
        pipeline.start().unwrap();
        registry.add(pipeline);
    }

    assert!(log.wait_until(Duration::from_secs(5), |ops| {
        ops.iter().filter(|o| o.starts_with("sink.open")).count() == 2
    }));

    let started = Instant::now();
    let report = registry.shutdown_all(Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(report.timed_out.is_empty(), "timed out: {:?}", report.timed_out);
    assert_eq!(report.stopped.len(), 4);
    for pipeline in registry.list_all() {
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(!pipeline.is_recording());
    }
    assert_eq!(log.count("sink.open"), log.count("sink.close"));
    assert_eq!(log.count("source.open"), log.count("source.close"));
    assert!(registry.is_shutting_down());
}

#[test]
fn test_shutdown_interrupts_reconnect_backoff() {
    let registry = StreamRegistry::new();
    let log = OpLog::default();
    let deps = PipelineDeps {
        connector: Arc::new(ScriptedConnector::new(log.clone(), Script::idle()).fail_connects(usize::MAX)),
        sinks: Arc::new(MemorySinkFactory::new(log.clone())),
        storage: Arc::new(MemoryStorage::default()),
        events: Arc::new(RecordingEventSink::default()),
    };
    let settings = PipelineSettings {
        reconnect_backoff: Duration::from_secs(60),
        ..PipelineSettings::default()
    };
    let pipeline = Arc::new(CameraPipeline::new(
        test_camera("offline", RecordMode::Video),
        None,
        Vec::new(),
        settings,
        deps,
        registry.lifecycle(),
    ));
    pipeline.start().unwrap();
    registry.add(pipeline.clone());
    assert!(log.wait_until(Duration::from_secs(2), |ops| !ops.is_empty()));

    let report = registry.shutdown_all(Duration::from_secs(2));
    assert_eq!(report.stopped, vec!["offline".to_string()]);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(log.count("source.open"), 0);
}
