//! Configuration for the gateway
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/crossgate/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Models that require a Pro+ credential (`opus_enabled`) beyond the
/// substring checks in [`requires_pro_plus`].
pub const PRO_PLUS_MODELS: &[&str] = &["claude-opus-4", "claude-opus-4-5", "claude-sonnet-4-6"];

/// Models that routinely pause mid-generation on large contexts and get a
/// longer inter-chunk timeout.
pub const SLOW_MODELS: &[&str] = &["claude-opus-4", "claude-opus-4-5"];

/// Check whether a model is restricted to Pro+ credentials.
pub fn requires_pro_plus(model: &str) -> bool {
    if model.is_empty() {
        return false;
    }
    if PRO_PLUS_MODELS.contains(&model) {
        return true;
    }
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        return true;
    }
    // The sonnet-4.6 family is Pro+-gated upstream
    lower.contains("sonnet") && (lower.contains("4-6") || lower.contains("4.6"))
}

/// Per-model multiplier over the base stream-read timeout.
///
/// Slow models and Pro+-tier models get more headroom between chunks.
pub fn adaptive_timeout(model: &str, base: Duration) -> Duration {
    let lower = model.to_lowercase();
    let slow = SLOW_MODELS.iter().any(|m| lower.contains(m)) || requires_pro_plus(model);
    if slow {
        base.mul_f64(2.0)
    } else {
        base
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the gateway server to
    pub bind_addr: SocketAddr,

    /// SQLite database path for credentials and accounts
    pub database_path: PathBuf,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// Secret used to derive the at-rest encryption key for stored tokens
    pub encryption_secret: String,

    /// Gateway master API key; requests presenting it use the public pool
    pub proxy_api_key: Option<String>,

    /// Default upstream region when a credential does not specify one
    pub region: String,

    /// Profile ARN passed through to upstream requests when set
    pub profile_arn: Option<String>,

    /// Timeout waiting for the first upstream byte before retrying
    pub first_token_timeout: Duration,

    /// Number of full-request retries when no first byte arrives
    pub first_token_max_retries: u32,

    /// Base per-chunk read timeout (scaled per model)
    pub stream_read_timeout: Duration,

    /// Consecutive chunk timeouts tolerated before the stream is dead
    pub max_consecutive_timeouts: u32,

    /// Minimum success rate before a credential is heavily penalized
    pub token_min_success_rate: f64,

    /// Interval between background credential health sweeps
    pub token_health_check_interval: Duration,

    /// Maximum cached credential managers (LRU)
    pub auth_manager_cache_max_size: usize,

    /// Tool descriptions longer than this are relocated to the system prompt
    pub tool_description_max_length: usize,

    /// Self-use mode: the public pool is disabled and anonymous requests fail
    pub self_use: bool,

    /// Show internal error details to clients
    pub debug_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".parse().unwrap(),
            database_path: PathBuf::from("./crossgate.db"),
            log_dir: PathBuf::from("./logs"),
            encryption_secret: String::new(),
            proxy_api_key: None,
            region: "us-east-1".to_string(),
            profile_arn: None,
            first_token_timeout: Duration::from_secs(60),
            first_token_max_retries: 2,
            stream_read_timeout: Duration::from_secs(30),
            max_consecutive_timeouts: 3,
            token_min_success_rate: 0.5,
            token_health_check_interval: Duration::from_secs(600),
            auth_manager_cache_max_size: 100,
            tool_description_max_length: 4096,
            self_use: false,
            debug_mode: false,
        }
    }
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    database_path: Option<String>,
    log_dir: Option<String>,
    encryption_secret: Option<String>,
    proxy_api_key: Option<String>,
    region: Option<String>,
    profile_arn: Option<String>,
    first_token_timeout_secs: Option<u64>,
    first_token_max_retries: Option<u32>,
    stream_read_timeout_secs: Option<u64>,
    max_consecutive_timeouts: Option<u32>,
    token_min_success_rate: Option<f64>,
    token_health_check_interval_secs: Option<u64>,
    auth_manager_cache_max_size: Option<usize>,
    tool_description_max_length: Option<usize>,
    self_use: Option<bool>,
    debug_mode: Option<bool>,
}

impl Config {
    /// Load configuration: defaults, then config file, then environment.
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(file) = read_config_file() {
            config.apply_file(file);
        }
        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(addr) = file.bind_addr.and_then(|s| s.parse().ok()) {
            self.bind_addr = addr;
        }
        if let Some(path) = file.database_path {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = file.log_dir {
            self.log_dir = PathBuf::from(path);
        }
        if let Some(secret) = file.encryption_secret {
            self.encryption_secret = secret;
        }
        if let Some(key) = file.proxy_api_key {
            self.proxy_api_key = Some(key);
        }
        if let Some(region) = file.region {
            self.region = region;
        }
        if let Some(arn) = file.profile_arn {
            self.profile_arn = Some(arn);
        }
        if let Some(secs) = file.first_token_timeout_secs {
            self.first_token_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = file.first_token_max_retries {
            self.first_token_max_retries = n;
        }
        if let Some(secs) = file.stream_read_timeout_secs {
            self.stream_read_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = file.max_consecutive_timeouts {
            self.max_consecutive_timeouts = n;
        }
        if let Some(rate) = file.token_min_success_rate {
            self.token_min_success_rate = rate;
        }
        if let Some(secs) = file.token_health_check_interval_secs {
            self.token_health_check_interval = Duration::from_secs(secs);
        }
        if let Some(n) = file.auth_manager_cache_max_size {
            self.auth_manager_cache_max_size = n;
        }
        if let Some(n) = file.tool_description_max_length {
            self.tool_description_max_length = n;
        }
        if let Some(b) = file.self_use {
            self.self_use = b;
        }
        if let Some(b) = file.debug_mode {
            self.debug_mode = b;
        }
    }

    fn apply_env(&mut self) {
        if let Some(addr) = env_parse::<SocketAddr>("CROSSGATE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("CROSSGATE_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CROSSGATE_LOG_DIR") {
            self.log_dir = PathBuf::from(path);
        }
        if let Ok(secret) = std::env::var("CROSSGATE_ENCRYPTION_SECRET") {
            self.encryption_secret = secret;
        }
        if let Ok(key) = std::env::var("CROSSGATE_PROXY_API_KEY") {
            self.proxy_api_key = Some(key);
        }
        if let Ok(region) = std::env::var("CROSSGATE_REGION") {
            self.region = region;
        }
        if let Ok(arn) = std::env::var("CROSSGATE_PROFILE_ARN") {
            self.profile_arn = Some(arn);
        }
        if let Some(secs) = env_parse::<u64>("CROSSGATE_FIRST_TOKEN_TIMEOUT") {
            self.first_token_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("CROSSGATE_FIRST_TOKEN_MAX_RETRIES") {
            self.first_token_max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("CROSSGATE_STREAM_READ_TIMEOUT") {
            self.stream_read_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("CROSSGATE_MAX_CONSECUTIVE_TIMEOUTS") {
            self.max_consecutive_timeouts = n;
        }
        if let Some(rate) = env_parse::<f64>("CROSSGATE_TOKEN_MIN_SUCCESS_RATE") {
            self.token_min_success_rate = rate;
        }
        if let Some(secs) = env_parse::<u64>("CROSSGATE_TOKEN_HEALTH_CHECK_INTERVAL") {
            self.token_health_check_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("CROSSGATE_AUTH_MANAGER_CACHE_MAX_SIZE") {
            self.auth_manager_cache_max_size = n;
        }
        if let Some(n) = env_parse::<usize>("CROSSGATE_TOOL_DESCRIPTION_MAX_LENGTH") {
            self.tool_description_max_length = n;
        }
        if let Some(b) = env_parse::<bool>("CROSSGATE_SELF_USE") {
            self.self_use = b;
        }
        if let Some(b) = env_parse::<bool>("CROSSGATE_DEBUG_MODE") {
            self.debug_mode = b;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn read_config_file() -> Option<FileConfig> {
    let path = dirs::config_dir()?.join("crossgate").join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&contents) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}
