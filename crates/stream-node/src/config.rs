use motion_detector::DetectorConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::PipelineSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub cameras_config: PathBuf,
    pub recordings_root: PathBuf,
    pub connect_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub read_timeout: Duration,
    pub stall_timeout: Duration,
    pub cover_interval: Duration,
    pub screenshot_interval: Duration,
    pub notifier_workers: usize,
    pub notifier_queue: usize,
    pub shutdown_timeout: Duration,
    pub reload_debounce: Duration,
    pub debug_overlay: bool,
    pub detector: DetectorConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env::var("STREAM_NODE_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let cameras_config = env::var("CAMERAS_CONFIG").unwrap_or_else(|_| "./cameras.yaml".to_string());
        let recordings_root = env::var("RECORDINGS_ROOT").unwrap_or_else(|_| "./data/recordings".to_string());

        Ok(Config {
            bind_addr,
            cameras_config: PathBuf::from(cameras_config),
            recordings_root: PathBuf::from(recordings_root),
            connect_timeout: millis("CONNECT_TIMEOUT_MS", 5000)?,
            reconnect_backoff: millis("RECONNECT_BACKOFF_MS", 5000)?,
            read_timeout: millis("READ_TIMEOUT_MS", 1000)?,
            stall_timeout: secs("STALL_TIMEOUT_SECS", 10)?,
            cover_interval: secs("COVER_INTERVAL_SECS", 60)?,
            screenshot_interval: secs("SCREENSHOT_INTERVAL_SECS", 1)?,
            notifier_workers: parse("NOTIFIER_WORKERS", 4)?,
            notifier_queue: parse("NOTIFIER_QUEUE", 256)?,
            shutdown_timeout: secs("SHUTDOWN_TIMEOUT_SECS", 10)?,
            reload_debounce: millis("RELOAD_DEBOUNCE_MS", 250)?,
            debug_overlay: parse("DEBUG_OVERLAY", false)?,
            detector: DetectorConfig::from_env(),
        })
    }

    /// Settings shared by every camera pipeline of this process.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            connect_timeout: self.connect_timeout,
            reconnect_backoff: self.reconnect_backoff,
            read_timeout: self.read_timeout,
            stall_timeout: self.stall_timeout,
            cover_interval: self.cover_interval,
            screenshot_interval: self.screenshot_interval,
            detector: self.detector.clone(),
            debug_overlay: self.debug_overlay,
            ..PipelineSettings::default()
        }
    }
}

fn parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn millis(key: &str, default: u64) -> anyhow::Result<Duration> {
    parse(key, default).map(Duration::from_millis)
}

fn secs(key: &str, default: u64) -> anyhow::Result<Duration> {
    parse(key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_and_override() {
        env::remove_var("CONFIG_TEST_WORKERS");
        assert_eq!(parse("CONFIG_TEST_WORKERS", 4usize).unwrap(), 4);

        env::set_var("CONFIG_TEST_WORKERS", " 8 ");
        assert_eq!(parse("CONFIG_TEST_WORKERS", 4usize).unwrap(), 8);

        env::set_var("CONFIG_TEST_WORKERS", "many");
        let err = parse("CONFIG_TEST_WORKERS", 4usize).unwrap_err();
        assert!(err.to_string().contains("CONFIG_TEST_WORKERS"));
        env::remove_var("CONFIG_TEST_WORKERS");
    }

    #[test]
    fn test_durations() {
        env::set_var("CONFIG_TEST_BACKOFF_MS", "1500");
        assert_eq!(millis("CONFIG_TEST_BACKOFF_MS", 5000).unwrap(), Duration::from_millis(1500));
        assert_eq!(secs("CONFIG_TEST_UNSET_SECS", 10).unwrap(), Duration::from_secs(10));
        env::remove_var("CONFIG_TEST_BACKOFF_MS");
    }

    #[test]
    fn test_pipeline_settings_carry_timeouts() {
        let config = Config::from_env().unwrap();
        let settings = config.pipeline_settings();
        assert_eq!(settings.connect_timeout, config.connect_timeout);
        assert_eq!(settings.read_timeout, config.read_timeout);
        assert_eq!(settings.segment_unit, Duration::from_secs(60));
    }
}
