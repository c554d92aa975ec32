//! Configuration for the thumbgate gateway.

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thumbgate_core::{GatewayError, ResizeDefaults};
use tracing::Level;

/// 40 MiB, the default cap for both source and output images
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 40 * 1024 * 1024;

/// Fetch timeout used when none (or zero) is configured
pub const DEFAULT_FETCH_TIME_MS: u64 = 1000;

/// Gateway configuration
#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    /// Port to listen on
    pub port: u16,

    /// Concurrent pipeline executions; 0 means one per CPU
    pub max_concurrency: usize,

    /// Concurrent admitted clients; 0 means unlimited
    pub max_clients: usize,

    /// Per-attempt upstream fetch timeout in milliseconds
    pub max_image_fetch_time_ms: u64,

    /// Extra fetch attempts after the first
    pub max_url_fetch_retries: u32,

    /// Comma-separated host globs allowed as image sources
    pub domain_whitelist: String,

    /// Coalesce identical concurrent requests
    pub share_concurrent_requests: bool,

    /// Keep upstream connections alive
    pub enable_connection_keep_alive: bool,

    /// Maximum source image size in bytes
    pub max_input_image_size: u64,

    /// Maximum encoded output size in bytes
    pub max_output_image_size: u64,

    /// Leave diagnostic detail out of error bodies
    pub suppress_error_diagnostics: bool,

    /// Level at which serviced requests are logged; below INFO disables it
    #[serde(serialize_with = "serialize_display")]
    pub request_log_level: Level,

    /// Emit per-stage timing headers
    pub verbose: bool,

    /// Surface unhandled error detail in responses
    pub developer_mode: bool,

    /// Enable POST /test
    pub enable_test_page: bool,

    /// Optional JSON file of default resize parameters
    pub defaults_file: Option<PathBuf>,

    /// Default resize parameters, loaded from `defaults_file`
    pub resize_defaults: ResizeDefaults,
}

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            max_concurrency: 0,
            max_clients: 0,
            max_image_fetch_time_ms: DEFAULT_FETCH_TIME_MS,
            max_url_fetch_retries: 0,
            domain_whitelist: "*".to_string(),
            share_concurrent_requests: true,
            enable_connection_keep_alive: false,
            max_input_image_size: DEFAULT_MAX_IMAGE_SIZE,
            max_output_image_size: DEFAULT_MAX_IMAGE_SIZE,
            suppress_error_diagnostics: false,
            request_log_level: Level::WARN,
            verbose: false,
            developer_mode: false,
            enable_test_page: false,
            defaults_file: None,
            resize_defaults: ResizeDefaults::default(),
        }
    }
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("THUMBGATE_PORT") {
            config.port = port;
        }
        if let Some(n) = env_parse("THUMBGATE_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        if let Some(n) = env_parse("THUMBGATE_MAX_CLIENTS") {
            config.max_clients = n;
        }
        if let Some(ms) = env_parse("THUMBGATE_MAX_IMAGE_FETCH_TIME_MS") {
            config.max_image_fetch_time_ms = ms;
        }
        if let Some(n) = env_parse("THUMBGATE_MAX_URL_FETCH_RETRIES") {
            config.max_url_fetch_retries = n;
        }
        if let Ok(val) = std::env::var("THUMBGATE_DOMAIN_WHITELIST") {
            config.domain_whitelist = val;
        }
        if let Some(flag) = env_flag("THUMBGATE_SHARE_CONCURRENT_REQUESTS") {
            config.share_concurrent_requests = flag;
        }
        if let Some(flag) = env_flag("THUMBGATE_ENABLE_CONNECTION_KEEP_ALIVE") {
            config.enable_connection_keep_alive = flag;
        }
        if let Some(n) = env_parse("THUMBGATE_MAX_INPUT_IMAGE_SIZE") {
            config.max_input_image_size = n;
        }
        if let Some(n) = env_parse("THUMBGATE_MAX_OUTPUT_IMAGE_SIZE") {
            config.max_output_image_size = n;
        }
        if let Some(flag) = env_flag("THUMBGATE_SUPPRESS_ERROR_DIAGNOSTICS") {
            config.suppress_error_diagnostics = flag;
        }
        if let Some(level) = env_parse("THUMBGATE_REQUEST_LOG_LEVEL") {
            config.request_log_level = level;
        }
        if let Some(flag) = env_flag("THUMBGATE_VERBOSE") {
            config.verbose = flag;
        }
        if let Some(flag) = env_flag("THUMBGATE_DEVELOPER_MODE") {
            config.developer_mode = flag;
        }
        if let Some(flag) = env_flag("THUMBGATE_ENABLE_TEST_PAGE") {
            config.enable_test_page = flag;
        }
        if let Ok(path) = std::env::var("THUMBGATE_DEFAULTS_FILE") {
            if !path.trim().is_empty() {
                config.defaults_file = Some(PathBuf::from(path));
            }
        }

        config
    }

    /// Read `defaults_file` into `resize_defaults`
    pub fn load_defaults(mut self) -> Result<Self, GatewayError> {
        if let Some(path) = &self.defaults_file {
            let json = std::fs::read_to_string(path).map_err(|e| {
                GatewayError::validation(format!(
                    "Unable to read defaults file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            self.resize_defaults = ResizeDefaults::from_json_str(&json)?;
        }
        Ok(self)
    }

    /// Replace "use the platform default" zeros with concrete values
    pub fn normalized(mut self) -> Self {
        if self.max_concurrency == 0 {
            self.max_concurrency = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.max_image_fetch_time_ms == 0 {
            self.max_image_fetch_time_ms = DEFAULT_FETCH_TIME_MS;
        }
        self
    }

    /// Per-attempt fetch timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.max_image_fetch_time_ms.max(1))
    }

    /// Whether serviced requests should be logged at all
    pub fn logs_requests(&self) -> bool {
        self.request_log_level >= Level::INFO
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}
