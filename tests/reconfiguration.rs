//! Camera snapshot swaps while a recording is open.

use common::{EventKind, RecordMode};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stream_node::testing::{
    solid_frame, test_camera, Exhausted, MemorySinkFactory, MemoryStorage, OpLog, RecordingEventSink, Script,
    ScriptedConnector,
};
use stream_node::{CameraPipeline, LifecycleFlag, PipelineDeps, PipelineSettings, PipelineState};

struct Rig {
    log: OpLog,
    connector: Arc<ScriptedConnector>,
    events: Arc<RecordingEventSink>,
    pipeline: CameraPipeline,
}

fn rig(mode: RecordMode) -> Rig {
    let log = OpLog::default();
    let connector = Arc::new(ScriptedConnector::new(
        log.clone(),
        Script::new(vec![solid_frame(96, 64, 100)], Duration::from_millis(10)).then(Exhausted::RepeatLast),
    ));
    let events = Arc::new(RecordingEventSink::default());
    let deps = PipelineDeps {
        connector: connector.clone(),
        sinks: Arc::new(MemorySinkFactory::new(log.clone())),
        storage: Arc::new(MemoryStorage::default()),
        events: events.clone(),
    };
    let settings = PipelineSettings {
        read_timeout: Duration::from_millis(20),
        reconnect_backoff: Duration::from_millis(50),
        ..PipelineSettings::default()
    };
    let pipeline = CameraPipeline::new(
        test_camera("porch", mode),
        None,
        Vec::new(),
        settings,
        deps,
        Arc::new(LifecycleFlag::default()),
    );
    Rig {
        log,
        connector,
        events,
        pipeline,
    }
}

fn wait(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Open/close entries never show two opens without a close in between.
fn assert_alternating(ops: &[String]) {
    let mut open = false;
    for op in ops {
        match op.as_str() {
            "sink.open" => {
                assert!(!open, "second open without close: {:?}", ops);
                open = true;
            }
            "sink.close" => {
                assert!(open, "close without open: {:?}", ops);
                open = false;
            }
            _ => {}
        }
    }
}

#[test]
fn test_record_mode_change_closes_exactly_once() {
    let rig = rig(RecordMode::Video);
    rig.pipeline.start().unwrap();
    assert!(rig.log.wait_until(Duration::from_secs(3), |ops| ops.iter().any(|o| o.starts_with("sink.open"))));

    let mut next = rig.pipeline.camera();
    next.record_mode = RecordMode::DetectionVideo;
    rig.pipeline.update_camera(next, None);

    assert!(wait(Duration::from_secs(3), || rig.connector.connects() == 2
        && rig.pipeline.state() == PipelineState::Streaming));
    thread::sleep(Duration::from_millis(200));
    assert!(rig.pipeline.shutdown(Duration::from_secs(3)));

    let sink_ops = rig.log.ops("sink.");
    assert_eq!(sink_ops, vec!["sink.open", "sink.close"]);
    assert_eq!(
        rig.events.kinds(),
        vec![EventKind::RecordingStart, EventKind::RecordingEnd]
    );
    // Output is closed before the input is torn down.
    let ops = rig.log.ops("");
    let close = ops.iter().position(|o| o == "sink.close").unwrap();
    let first_source_close = ops.iter().position(|o| o == "source.close").unwrap();
    assert!(close < first_source_close);
}

#[test]
fn test_connection_change_closes_then_reopens() {
    let rig = rig(RecordMode::Video);
    rig.pipeline.start().unwrap();
    assert!(rig.log.wait_until(Duration::from_secs(3), |ops| ops.iter().any(|o| o.starts_with("sink.open"))));

    let mut next = rig.pipeline.camera();
    next.connection.path = "/scripted/porch-hd.mp4".to_string();
    rig.pipeline.update_camera(next, None);

    assert!(rig.log.wait_until(Duration::from_secs(3), |ops| {
        ops.iter().filter(|o| o.starts_with("sink.open")).count() == 2
    }));
    assert!(rig.pipeline.shutdown(Duration::from_secs(3)));

    let sink_ops = rig.log.ops("sink.");
    assert_eq!(sink_ops, vec!["sink.open", "sink.close", "sink.open", "sink.close"]);
    assert_alternating(&sink_ops);
    assert!(rig
        .log
        .entries()
        .iter()
        .any(|e| e == "source.open /scripted/porch-hd.mp4"));
}

#[test]
fn test_rename_does_not_touch_containers() {
    let rig = rig(RecordMode::Video);
    rig.pipeline.start().unwrap();
    assert!(rig.log.wait_until(Duration::from_secs(3), |ops| ops.iter().any(|o| o.starts_with("sink.open"))));

    let mut next = rig.pipeline.camera();
    next.name = "Back porch".to_string();
    rig.pipeline.update_camera(next, None);
    thread::sleep(Duration::from_millis(150));

    assert_eq!(rig.log.ops("sink."), vec!["sink.open"]);
    assert_eq!(rig.connector.connects(), 1);
    assert!(rig.pipeline.shutdown(Duration::from_secs(3)));
    assert_eq!(rig.log.ops("sink."), vec!["sink.open", "sink.close"]);
}
