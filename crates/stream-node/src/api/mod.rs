//! Thin preview surface over the stream registry.

mod dto;
mod routes;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use telemetry::trace_http_request;
use tower::ServiceBuilder;

use crate::notifier::LiveBroadcast;
use crate::registry::StreamRegistry;

pub use dto::StreamDto;

#[derive(Clone)]
pub struct AppState {
  pub registry: Arc<StreamRegistry>,
  pub live: Arc<LiveBroadcast>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/healthz", get(routes::healthz))
    .route("/readyz", get(routes::readyz))
    .route("/streams", get(routes::list_streams))
    .route("/cameras/:id/frame.jpg", get(routes::latest_frame))
    .route("/events", get(routes::events))
    .route("/metrics", get(routes::metrics))
    .with_state(state)
    .layer(ServiceBuilder::new().layer(middleware::from_fn(trace_http_request)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::{CameraPipeline, PipelineDeps, PipelineSettings};
  use crate::testing::{test_camera, MemorySinkFactory, MemoryStorage, OpLog, RecordingEventSink, Script, ScriptedConnector};
  use axum::body::{to_bytes, Body};
  use axum::http::{header, Request, StatusCode};
  use common::RecordMode;
  use tower::ServiceExt;

  fn state() -> AppState {
    let registry = Arc::new(StreamRegistry::new());
    let log = OpLog::default();
    let deps = PipelineDeps {
      connector: Arc::new(ScriptedConnector::new(log.clone(), Script::idle())),
      sinks: Arc::new(MemorySinkFactory::new(log)),
      storage: Arc::new(MemoryStorage::default()),
      events: Arc::new(RecordingEventSink::default()),
    };
    registry.add(Arc::new(CameraPipeline::new(
      test_camera("cam-1", RecordMode::DetectionVideo),
      None,
      Vec::new(),
      PipelineSettings::default(),
      deps,
      registry.lifecycle(),
    )));
    AppState {
      registry,
      live: Arc::new(LiveBroadcast::new(16)),
    }
  }

  async fn get(app: Router, uri: &str) -> axum::response::Response {
    app
      .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_health_and_readiness() {
    let state = state();
    let app = router(state.clone());
    assert_eq!(get(app.clone(), "/healthz").await.status(), StatusCode::OK);
    assert_eq!(get(app.clone(), "/readyz").await.status(), StatusCode::OK);

    state.registry.begin_shutdown();
    assert_eq!(get(app, "/readyz").await.status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn test_list_streams() {
    let app = router(state());
    let response = get(app, "/streams").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let streams: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0]["camera_id"], "cam-1");
    assert_eq!(streams[0]["state"], "created");
    assert_eq!(streams[0]["record_mode"], "DETECTION_VIDEO");
  }

  #[tokio::test]
  async fn test_frame_placeholder_and_unknown_camera() {
    let app = router(state());
    let response = get(app.clone(), "/cameras/cam-1/frame.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    assert_eq!(get(app, "/cameras/nope/frame.jpg").await.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn test_metrics_endpoint() {
    telemetry::metrics::RECORDINGS_OPEN.get();
    let app = router(state());
    let response = get(app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("stream_node_"));
  }
}
