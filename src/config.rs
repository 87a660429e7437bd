use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime tuning for the cache and fetch pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Messages per page for initial loads and `fetch_more`.
    pub page_size: usize,
    pub message_ttl: Duration,
    pub conversation_ttl: Duration,
    /// How long a completed fetch keeps absorbing late duplicate callers.
    pub dedup_grace: Duration,
    /// Delay between revealing unread messages and marking them read.
    pub mark_read_delay: Duration,
    /// Consecutive message-fetch failures before back-off kicks in.
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Automatic retries for the conversation list.
    pub max_retry_attempts: u32,
    /// Recent messages fetched per conversation for the inbox list.
    pub conversation_message_limit: usize,
    /// Permit the final message query that runs without a requesting-profile
    /// scope. Only ever attempted after ownership was verified.
    pub allow_unscoped_fallback: bool,
    /// Directory for the cache database; XDG data dir when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 15,
            message_ttl: Duration::from_secs(30 * 60),
            conversation_ttl: Duration::from_secs(5 * 60),
            dedup_grace: Duration::from_millis(500),
            mark_read_delay: Duration::from_millis(1500),
            failure_threshold: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_retry_attempts: 3,
            conversation_message_limit: 20,
            allow_unscoped_fallback: true,
            cache_dir: None,
        }
    }
}

/// On-disk representation. Every field is optional; missing ones keep the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_grace_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_read_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_cap_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_message_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unscoped_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heartline")
        .join("config.json")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
        Self::parse(&data).map(Some)
    }

    pub fn parse(data: &str) -> Result<Self, String> {
        serde_json::from_str(data).map_err(|e| format!("parse config: {e}"))
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(path, data).map_err(|e| format!("write config: {e}"))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparsable {name}={raw:?}");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "true" || v == "1")
}

impl Config {
    /// Overlay the values present in `fc`.
    pub fn apply_file(&mut self, fc: &FileConfig) {
        if let Some(v) = fc.page_size {
            self.page_size = v;
        }
        if let Some(v) = fc.message_ttl_secs {
            self.message_ttl = Duration::from_secs(v);
        }
        if let Some(v) = fc.conversation_ttl_secs {
            self.conversation_ttl = Duration::from_secs(v);
        }
        if let Some(v) = fc.dedup_grace_ms {
            self.dedup_grace = Duration::from_millis(v);
        }
        if let Some(v) = fc.mark_read_delay_ms {
            self.mark_read_delay = Duration::from_millis(v);
        }
        if let Some(v) = fc.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = fc.backoff_base_ms {
            self.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = fc.backoff_cap_ms {
            self.backoff_cap = Duration::from_millis(v);
        }
        if let Some(v) = fc.max_retry_attempts {
            self.max_retry_attempts = v;
        }
        if let Some(v) = fc.conversation_message_limit {
            self.conversation_message_limit = v;
        }
        if let Some(v) = fc.allow_unscoped_fallback {
            self.allow_unscoped_fallback = v;
        }
        if let Some(v) = &fc.cache_dir {
            self.cache_dir = Some(v.clone());
        }
    }

    /// Overlay `HEARTLINE_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("HEARTLINE_PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = env_parse("HEARTLINE_MESSAGE_TTL_SECS") {
            self.message_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("HEARTLINE_CONVERSATION_TTL_SECS") {
            self.conversation_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("HEARTLINE_MARK_READ_DELAY_MS") {
            self.mark_read_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("HEARTLINE_MAX_RETRY_ATTEMPTS") {
            self.max_retry_attempts = v;
        }
        if let Some(v) = env_bool("HEARTLINE_ALLOW_UNSCOPED_FALLBACK") {
            self.allow_unscoped_fallback = v;
        }
        if let Ok(v) = std::env::var("HEARTLINE_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
    }

    /// Resolution order: env vars → config file → defaults.
    pub fn resolve() -> Self {
        let mut config = Config::default();

        match FileConfig::load() {
            Ok(Some(fc)) => {
                log::info!("Config loaded from {}", config_path().display());
                config.apply_file(&fc);
            }
            Ok(None) => {
                log::debug!("No config file found, using defaults");
            }
            Err(e) => {
                log::warn!("Config file error, using defaults: {}", e);
            }
        }

        config.apply_env();
        config
    }
}
