//! A live pipeline behind the HTTP surface, with events flowing through the
//! notifier into the event log and live subscribers.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{EventKind, RecordMode};
use std::sync::Arc;
use std::time::Duration;
use stream_node::api::{self, AppState};
use stream_node::notifier::handlers::RecordKind;
use stream_node::notifier::{EventHandler, EventLog, LiveBroadcast, Notifier};
use stream_node::testing::{
    solid_frame, test_camera, Exhausted, MemorySinkFactory, MemoryStorage, OpLog, Script, ScriptedConnector,
};
use stream_node::{CameraPipeline, PipelineDeps, PipelineSettings, StreamRegistry};
use tower::ServiceExt;

async fn get_json(app: axum::Router, uri: &str) -> serde_json::Value {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_camera_visible_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("events.jsonl");

    let live = Arc::new(LiveBroadcast::new(16));
    let mut live_rx = live.subscribe();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(EventLog::open(&log_path).unwrap()), live.clone()];
    let notifier = Arc::new(Notifier::new(handlers, 2, 32).unwrap());

    let registry = Arc::new(StreamRegistry::new());
    let ops = OpLog::default();
    let deps = PipelineDeps {
        connector: Arc::new(ScriptedConnector::new(
            ops.clone(),
            Script::new(vec![solid_frame(64, 48, 120)], Duration::from_millis(20)).then(Exhausted::RepeatLast),
        )),
        sinks: Arc::new(MemorySinkFactory::new(ops.clone())),
        storage: Arc::new(MemoryStorage::default()),
        events: notifier.clone(),
    };
    let settings = PipelineSettings {
        read_timeout: Duration::from_millis(50),
        ..PipelineSettings::default()
    };
    let pipeline = Arc::new(CameraPipeline::new(
        test_camera("lobby", RecordMode::Video),
        None,
        Vec::new(),
        settings,
        deps,
        registry.lifecycle(),
    ));
    pipeline.start().unwrap();
    registry.add(pipeline.clone());

    let started = tokio::time::timeout(Duration::from_secs(5), live_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started.kind, EventKind::RecordingStart);
    assert_eq!(started.camera_id, "lobby");
    while pipeline.latest_frame().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let app = api::router(AppState {
        registry: registry.clone(),
        live: live.clone(),
    });
    let streams = get_json(app.clone(), "/streams").await;
    assert_eq!(streams[0]["camera_id"], "lobby");
    assert_eq!(streams[0]["state"], "streaming");
    assert_eq!(streams[0]["recording"], true);

    let response = app
        .oneshot(Request::builder().uri("/cameras/lobby/frame.jpg").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let jpeg = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let preview = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((preview.width(), preview.height()), (64, 48));

    let reg = registry.clone();
    let report = tokio::task::spawn_blocking(move || reg.shutdown_all(Duration::from_secs(3)))
        .await
        .unwrap();
    assert!(report.timed_out.is_empty());

    let ended = tokio::time::timeout(Duration::from_secs(2), live_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ended.kind, EventKind::RecordingEnd);

    let n = notifier.clone();
    tokio::task::spawn_blocking(move || n.shutdown()).await.unwrap();

    let records = EventLog::read_records(&log_path).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, RecordKind::Recording);
    assert!(records[0].ended_at.is_some());
    assert!(records[0].duration_secs.unwrap() > 0.0);
}
