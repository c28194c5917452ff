use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use telemetry::LogConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use stream_node::api::{self, AppState};
use stream_node::config::Config;
use stream_node::event_bus::EventBus;
use stream_node::media::{FfmpegConnector, FfmpegSinkFactory};
use stream_node::notifier::{BusPublisher, EventHandler, EventLog, LiveBroadcast, Notifier, ScreenshotHandler};
use stream_node::pipeline::PipelineDeps;
use stream_node::registry::StreamRegistry;
use stream_node::shutdown;
use stream_node::storage::{FsStorage, Storage};
use stream_node::store::{CameraStore, YamlCameraStore};
use stream_node::supervisor::{self, Supervisor};

const LIVE_EVENT_CAPACITY: usize = 256;
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let _log_guard = telemetry::init_structured_logging(
    LogConfig::new("stream-node").with_version(env!("CARGO_PKG_VERSION")),
  );

  let config = Config::from_env()?;
  info!(cameras_config = %config.cameras_config.display(), recordings_root = %config.recordings_root.display(), "stream-node starting");

  let store = Arc::new(YamlCameraStore::load(&config.cameras_config)?);
  let storage = Arc::new(FsStorage::new(&config.recordings_root));

  // Event side effects
  let live = Arc::new(LiveBroadcast::new(LIVE_EVENT_CAPACITY));
  let bus = Arc::new(EventBus::default());
  let handlers: Vec<Arc<dyn EventHandler>> = vec![
    Arc::new(EventLog::open(config.recordings_root.join("events.jsonl"))?),
    live.clone(),
    Arc::new(BusPublisher::new(bus)),
    Arc::new(ScreenshotHandler::new(
      store.clone() as Arc<dyn CameraStore>,
      storage.clone() as Arc<dyn Storage>,
    )),
  ];
  let notifier = Arc::new(
    Notifier::new(handlers, config.notifier_workers, config.notifier_queue).context("failed to start notifier")?,
  );

  // Pipelines
  let registry = Arc::new(StreamRegistry::new());
  let deps = PipelineDeps {
    connector: Arc::new(FfmpegConnector::new()),
    sinks: Arc::new(FfmpegSinkFactory::new()),
    storage: storage.clone(),
    events: notifier.clone(),
  };
  let supervisor = Arc::new(Supervisor::new(
    store.clone(),
    registry.clone(),
    config.pipeline_settings(),
    deps,
    config.shutdown_timeout,
  ));
  supervisor.sync();
  let _config_watch = supervisor::watch_config(store, supervisor.clone(), config.reload_debounce)?;

  // HTTP
  let app = api::router(AppState {
    registry: registry.clone(),
    live,
  });
  let listener = TcpListener::bind(&config.bind_addr).await?;
  info!(addr = %config.bind_addr, "stream-node started");

  let (stop_tx, mut stop_rx) = watch::channel(false);
  let server = tokio::spawn(async move {
    axum::serve(listener, app)
      .with_graceful_shutdown(async move {
        let _ = stop_rx.changed().await;
      })
      .await
  });

  shutdown::wait_for_signal().await;

  let report = shutdown::shutdown_registry(registry, config.shutdown_timeout).await?;
  if !report.timed_out.is_empty() {
    warn!(cameras = ?report.timed_out, "cameras still stopping at exit");
  }

  let _ = stop_tx.send(true);
  match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, server).await {
    Ok(Ok(Ok(()))) => {}
    Ok(Ok(Err(e))) => error!(error = %e, "http server failed"),
    Ok(Err(e)) => error!(error = %e, "http server task failed"),
    Err(_) => warn!("http connections still open at exit"),
  }

  // Pipelines are gone; let queued events drain.
  tokio::task::spawn_blocking(move || notifier.shutdown())
    .await
    .context("notifier shutdown task failed")?;

  info!("stream-node stopped");
  Ok(())
}
