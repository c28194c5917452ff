use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// HTTP header carrying the request id
pub const X_REQUEST_ID: &str = "x-request-id";

/// Axum middleware logging one line per preview/API request
pub async fn trace_http_request(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let response = next.run(req).await;

    let latency_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    if status >= 400 {
        warn!(method = %method, uri = %uri, status, latency_ms, request_id = %request_id, "HTTP request failed");
    } else {
        info!(method = %method, uri = %uri, status, latency_ms, request_id = %request_id, "HTTP request completed");
    }

    response
}
