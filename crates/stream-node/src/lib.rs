//! Per-camera stream pipelines: connection and reconnection, the
//! decode/analyze/encode frame loop, motion-triggered recording, event
//! notification and the registry that coordinates them.

pub mod api;
pub mod config;
pub mod event_bus;
pub mod media;
pub mod notifier;
pub mod pipeline;
pub mod registry;
pub mod shutdown;
pub mod storage;
pub mod store;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use pipeline::{CameraPipeline, PipelineDeps, PipelineSettings, PipelineState};
pub use registry::{Lifecycle, LifecycleFlag, ShutdownReport, StreamRegistry};
