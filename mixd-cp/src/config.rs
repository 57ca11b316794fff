//! Control-plane configuration
//!
//! Resolution priority, highest first: command line > environment > TOML
//! config file > compiled default. Every recognised option has a compiled
//! default so a bare `mixd-cp` starts against a local worker and engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use mixd_common::{config as common_config, Error, Result};

fn default_bind_addr() -> String {
    "127.0.0.1:5740".to_string()
}
fn default_database_path() -> PathBuf {
    common_config::default_data_dir().join("mixd.db")
}
fn default_stem_cache_dir() -> PathBuf {
    common_config::default_data_dir().join("stems")
}
fn default_max_concurrent() -> usize {
    2
}
fn default_tick_interval_ms() -> u64 {
    5_000
}
fn default_grace_period_ms() -> u64 {
    60_000
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_processing_timeout_ms() -> u64 {
    600_000
}
fn default_queued_timeout_ms() -> u64 {
    3_600_000
}
fn default_worker_url() -> String {
    "http://127.0.0.1:5741".to_string()
}
fn default_worker_request_timeout_ms() -> u64 {
    30_000
}
fn default_worker_upload_timeout_ms() -> u64 {
    300_000
}
fn default_engine_ws_url() -> String {
    "ws://127.0.0.1:5742/app".to_string()
}
fn default_engine_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_engine_max_reconnect_delay_ms() -> u64 {
    30_000
}
fn default_engine_ping_interval_ms() -> u64 {
    30_000
}
fn default_engine_connect_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_worker_max_restarts() -> u32 {
    5
}
fn default_worker_restart_window_ms() -> u64 {
    300_000
}
fn default_worker_startup_timeout_ms() -> u64 {
    10_000
}
fn default_worker_monitor_interval_ms() -> u64 {
    30_000
}
fn default_stem_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_stem_download_timeout_ms() -> u64 {
    60_000
}
fn default_converter_executable() -> String {
    "ffmpeg".to_string()
}
fn default_job_cleanup_days() -> i64 {
    30
}

/// All recognised control-plane options
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Callback URL handed to the worker; defaults to this process's bind
    /// address when unset.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_analysis: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub analysis_tick_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub analysis_grace_period_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub analysis_retry_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub analysis_max_retries: u32,
    #[serde(default = "default_processing_timeout_ms")]
    pub analysis_processing_timeout_ms: u64,
    #[serde(default = "default_queued_timeout_ms")]
    pub analysis_queued_timeout_ms: u64,
    #[serde(default = "default_job_cleanup_days")]
    pub job_cleanup_days: i64,

    #[serde(default = "default_worker_url")]
    pub worker_server_url: String,
    #[serde(default)]
    pub worker_server_remote: bool,
    #[serde(default = "default_worker_request_timeout_ms")]
    pub worker_request_timeout_ms: u64,
    #[serde(default = "default_worker_upload_timeout_ms")]
    pub worker_upload_timeout_ms: u64,

    #[serde(default = "default_engine_ws_url")]
    pub engine_ws_url: String,
    #[serde(default = "default_engine_reconnect_delay_ms")]
    pub engine_reconnect_delay: u64,
    #[serde(default = "default_engine_max_reconnect_delay_ms")]
    pub engine_max_reconnect_delay: u64,
    #[serde(default = "default_engine_ping_interval_ms")]
    pub engine_ping_interval: u64,
    #[serde(default = "default_engine_connect_timeout_ms")]
    pub engine_connect_timeout_ms: u64,

    #[serde(default)]
    pub worker_autostart: bool,
    #[serde(default = "default_true")]
    pub worker_autorestart: bool,
    #[serde(default)]
    pub worker_executable: Option<String>,
    #[serde(default)]
    pub worker_working_dir: Option<PathBuf>,
    #[serde(default)]
    pub worker_log_path: Option<PathBuf>,
    #[serde(default = "default_worker_max_restarts")]
    pub worker_max_restarts: u32,
    #[serde(default = "default_worker_restart_window_ms")]
    pub worker_restart_window_ms: u64,
    #[serde(default = "default_worker_startup_timeout_ms")]
    pub worker_startup_timeout_ms: u64,
    #[serde(default = "default_worker_monitor_interval_ms")]
    pub worker_monitor_interval_ms: u64,

    #[serde(default = "default_stem_cache_dir")]
    pub stem_cache_dir: PathBuf,
    #[serde(default = "default_stem_cache_max_bytes")]
    pub stem_cache_max_bytes: u64,
    #[serde(default = "default_stem_download_timeout_ms")]
    pub stem_download_timeout_ms: u64,
    #[serde(default = "default_converter_executable")]
    pub converter_executable: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes via field defaults")
    }
}

impl ControlPlaneConfig {
    /// Load configuration: TOML file (if resolved), then env overrides
    pub fn load(cli_config: Option<&str>) -> Result<Self> {
        let mut config = match common_config::resolve_config_file(cli_config) {
            Some(path) => common_config::load_toml(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// The callback URL to hand the worker
    pub fn effective_callback_url(&self) -> String {
        self.callback_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/callbacks/analysis", self.bind_addr))
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_analysis == 0 {
            return Err(Error::Config(
                "max_concurrent_analysis must be at least 1".to_string(),
            ));
        }
        if self.worker_autostart && self.worker_executable.is_none() {
            return Err(Error::Config(
                "worker_autostart requires worker_executable".to_string(),
            ));
        }
        Ok(())
    }

    /// Environment overrides, `MIXD_`-prefixed upper-case option names
    fn apply_env(&mut self) {
        fn env_u64(name: &str, target: &mut u64) {
            if let Some(v) = std::env::var(name).ok().and_then(|s| s.parse().ok()) {
                *target = v;
            }
        }
        fn env_string(name: &str, target: &mut String) {
            if let Ok(v) = std::env::var(name) {
                *target = v;
            }
        }
        fn env_bool(name: &str, target: &mut bool) {
            if let Some(v) = std::env::var(name).ok().and_then(|s| s.parse().ok()) {
                *target = v;
            }
        }

        env_string("MIXD_BIND_ADDR", &mut self.bind_addr);
        if let Ok(v) = std::env::var("MIXD_CALLBACK_URL") {
            self.callback_url = Some(v);
        }
        if let Ok(v) = std::env::var("MIXD_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = std::env::var("MIXD_MAX_CONCURRENT_ANALYSIS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.max_concurrent_analysis = v;
        }
        env_u64("MIXD_ANALYSIS_RETRY_DELAY_MS", &mut self.analysis_retry_delay_ms);
        env_u64(
            "MIXD_ANALYSIS_PROCESSING_TIMEOUT_MS",
            &mut self.analysis_processing_timeout_ms,
        );
        env_u64(
            "MIXD_ANALYSIS_QUEUED_TIMEOUT_MS",
            &mut self.analysis_queued_timeout_ms,
        );
        env_string("MIXD_WORKER_SERVER_URL", &mut self.worker_server_url);
        env_bool("MIXD_WORKER_SERVER_REMOTE", &mut self.worker_server_remote);
        env_u64(
            "MIXD_WORKER_REQUEST_TIMEOUT_MS",
            &mut self.worker_request_timeout_ms,
        );
        env_string("MIXD_ENGINE_WS_URL", &mut self.engine_ws_url);
        env_u64("MIXD_ENGINE_RECONNECT_DELAY", &mut self.engine_reconnect_delay);
        env_u64(
            "MIXD_ENGINE_MAX_RECONNECT_DELAY",
            &mut self.engine_max_reconnect_delay,
        );
        env_u64("MIXD_ENGINE_PING_INTERVAL", &mut self.engine_ping_interval);
        env_bool("MIXD_WORKER_AUTOSTART", &mut self.worker_autostart);
        env_bool("MIXD_WORKER_AUTORESTART", &mut self.worker_autorestart);
        if let Ok(v) = std::env::var("MIXD_WORKER_EXECUTABLE") {
            self.worker_executable = Some(v);
        }
        if let Ok(v) = std::env::var("MIXD_WORKER_WORKING_DIR") {
            self.worker_working_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MIXD_STEM_CACHE_DIR") {
            self.stem_cache_dir = PathBuf::from(v);
        }
        env_u64("MIXD_STEM_CACHE_MAX_BYTES", &mut self.stem_cache_max_bytes);
        env_string("MIXD_CONVERTER_EXECUTABLE", &mut self.converter_executable);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_tick_interval_ms)
    }
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.analysis_grace_period_ms as i64)
    }
    pub fn processing_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.analysis_processing_timeout_ms as i64)
    }
    pub fn queued_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.analysis_queued_timeout_ms as i64)
    }
    pub fn retry_base_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.analysis_retry_delay_ms as i64)
    }
}
