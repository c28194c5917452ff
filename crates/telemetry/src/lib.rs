pub mod http_tracing;
pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use http_tracing::{trace_http_request, X_REQUEST_ID};
pub use logging::{init_structured_logging, LogConfig, LogFormat};
pub use metrics::{encode_metrics, REGISTRY};
