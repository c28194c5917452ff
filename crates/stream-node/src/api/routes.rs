use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, warn};

use super::{AppState, StreamDto};
use crate::storage::encode_jpeg;

pub async fn healthz() -> impl IntoResponse {
  (StatusCode::OK, "ok")
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
  if state.registry.is_shutting_down() {
    return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
  }
  (StatusCode::OK, "ready")
}

/// GET /streams - one entry per registered camera
pub async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
  let out: Vec<StreamDto> = state
    .registry
    .list_all()
    .iter()
    .map(|p| StreamDto::from(p.as_ref()))
    .collect();
  (StatusCode::OK, Json(out))
}

/// GET /cameras/:id/frame.jpg - latest preview frame or the no-signal image
pub async fn latest_frame(State(state): State<AppState>, Path(id): Path<String>) -> Response {
  let Some(frame) = state.registry.latest_frame(&id) else {
    return (StatusCode::NOT_FOUND, format!("unknown camera {id}")).into_response();
  };

  match tokio::task::spawn_blocking(move || encode_jpeg(&frame)).await {
    Ok(Ok(jpeg)) => (
      StatusCode::OK,
      [(header::CONTENT_TYPE, "image/jpeg"), (header::CACHE_CONTROL, "no-store")],
      jpeg,
    )
      .into_response(),
    Ok(Err(e)) => {
      error!(camera_id = %id, error = %e, "failed to encode preview frame");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
    Err(e) => {
      error!(camera_id = %id, error = %e, "preview encoder task failed");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}

/// GET /events - detection events as server-sent events
pub async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let stream = BroadcastStream::new(state.live.subscribe()).filter_map(|msg| match msg {
    Ok(event) => Event::default()
      .event(event.kind.topic())
      .json_data(&event)
      .ok()
      .map(Ok),
    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
      warn!(skipped, "event stream client lagging");
      None
    }
  });
  Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn metrics() -> Response {
  match telemetry::metrics::encode_metrics() {
    Ok(body) => (
      StatusCode::OK,
      [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
      body,
    )
      .into_response(),
    Err(e) => {
      error!(error = %e, "failed to encode metrics");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}
