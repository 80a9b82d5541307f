//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The key encryption secret is loaded from KEY_ENCRYPTION_SECRET only,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use key_pool::{CreditPolicy, SearchSourceMode, SelectionStrategy};
use provider::{BRAVE_BASE_URL, TAVILY_BASE_URL, UsageFetchOptions};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tavily: TavilyConfig,
    #[serde(default)]
    pub brave: BraveConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub client_rate_limit: ClientRateLimitConfig,
    #[serde(skip)]
    pub encryption_key: Option<Secret<Vec<u8>>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Key and settings persistence. `url = "memory"` keeps everything in process.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_database_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct TavilyConfig {
    #[serde(default = "default_tavily_base_url")]
    pub base_url: String,
    #[serde(default = "default_tavily_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Optional pacing for Tavily calls. Ungated when unset.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
}

/// What a Brave search does when the rate gate queue is too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BraveOverflowMode {
    /// Wait up to `max_queue_ms`, then fail.
    Queue,
    /// Fail immediately when the gate is busy.
    Error,
    /// Wait up to `max_queue_ms`, then answer from Tavily.
    #[default]
    FallbackToTavily,
}

#[derive(Debug, Deserialize)]
pub struct BraveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_brave_base_url")]
    pub base_url: String,
    #[serde(default = "default_brave_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_brave_qps")]
    pub max_qps: f64,
    /// Takes precedence over `max_qps` when set.
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    #[serde(default)]
    pub overflow: BraveOverflowMode,
    #[serde(default = "default_brave_max_queue")]
    pub max_queue_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_stale_grace")]
    pub stale_grace_ms: u64,
    #[serde(default = "default_min_remaining")]
    pub min_remaining: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default = "default_refresh_lock")]
    pub refresh_lock_ms: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_ms: u64,
    #[serde(default = "default_refresh_max_retries")]
    pub refresh_max_retries: u32,
    #[serde(default = "default_refresh_retry_delay")]
    pub refresh_retry_delay_ms: u64,
}

/// Static fallbacks for the server-wide settings table.
#[derive(Debug, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_refresh")]
    pub refresh_ms: u64,
    #[serde(default)]
    pub selection_strategy: Option<String>,
    #[serde(default)]
    pub search_source_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClientRateLimitConfig {
    #[serde(default = "default_client_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_client_window")]
    pub window_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_database_url() -> String {
    "sqlite:search-gateway.db?mode=rwc".into()
}

fn default_database_connections() -> u32 {
    5
}

fn default_tavily_base_url() -> String {
    TAVILY_BASE_URL.into()
}

fn default_tavily_timeout() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_brave_base_url() -> String {
    BRAVE_BASE_URL.into()
}

fn default_brave_timeout() -> u64 {
    20_000
}

fn default_brave_qps() -> f64 {
    1.0
}

fn default_brave_max_queue() -> u64 {
    30_000
}

fn default_cache_ttl() -> u64 {
    60_000
}

fn default_stale_grace() -> u64 {
    300_000
}

fn default_min_remaining() -> f64 {
    1.0
}

fn default_cooldown() -> u64 {
    300_000
}

fn default_refresh_lock() -> u64 {
    15_000
}

fn default_refresh_timeout() -> u64 {
    5_000
}

fn default_refresh_max_retries() -> u32 {
    3
}

fn default_refresh_retry_delay() -> u64 {
    1_000
}

fn default_settings_refresh() -> u64 {
    5_000
}

fn default_client_max_requests() -> u32 {
    60
}

fn default_client_window() -> u64 {
    60_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_database_connections(),
        }
    }
}

impl Default for TavilyConfig {
    fn default() -> Self {
        Self {
            base_url: default_tavily_base_url(),
            timeout_ms: default_tavily_timeout(),
            max_retries: default_max_retries(),
            min_interval_ms: None,
        }
    }
}

impl Default for BraveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_brave_base_url(),
            timeout_ms: default_brave_timeout(),
            max_retries: default_max_retries(),
            max_qps: default_brave_qps(),
            min_interval_ms: None,
            overflow: BraveOverflowMode::default(),
            max_queue_ms: default_brave_max_queue(),
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
            stale_grace_ms: default_stale_grace(),
            min_remaining: default_min_remaining(),
            cooldown_ms: default_cooldown(),
            refresh_lock_ms: default_refresh_lock(),
            refresh_timeout_ms: default_refresh_timeout(),
            refresh_max_retries: default_refresh_max_retries(),
            refresh_retry_delay_ms: default_refresh_retry_delay(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_settings_refresh(),
            selection_strategy: None,
            search_source_mode: None,
        }
    }
}

impl Default for ClientRateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_client_max_requests(),
            window_ms: default_client_window(),
        }
    }
}

/// Replace `slot` with the parsed value of env var `name`, if set.
/// Unparseable values keep the current value.
fn overlay<T: FromStr>(slot: &mut T, name: &str) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(var = name, value = %raw, "ignoring unparseable environment value"),
    }
}

fn overlay_opt<T: FromStr>(slot: &mut Option<T>, name: &str) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = Some(value),
        Err(_) => warn!(var = name, value = %raw, "ignoring unparseable environment value"),
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env();
        config.validate()?;

        if let Ok(raw) = std::env::var("KEY_ENCRYPTION_SECRET") {
            config.encryption_key = Some(common::parse_encryption_key(&raw)?);
        }

        Ok(config)
    }

    fn apply_env(&mut self) {
        overlay(&mut self.database.url, "DATABASE_URL");

        let credits = &mut self.credits;
        overlay(&mut credits.cache_ttl_ms, "TAVILY_CREDITS_CACHE_TTL_MS");
        overlay(&mut credits.stale_grace_ms, "TAVILY_CREDITS_STALE_GRACE_MS");
        overlay(&mut credits.min_remaining, "TAVILY_CREDITS_MIN_REMAINING");
        overlay(&mut credits.cooldown_ms, "TAVILY_CREDITS_COOLDOWN_MS");
        overlay(&mut credits.refresh_lock_ms, "TAVILY_CREDITS_REFRESH_LOCK_MS");
        overlay(&mut credits.refresh_timeout_ms, "TAVILY_CREDITS_REFRESH_TIMEOUT_MS");
        overlay(
            &mut credits.refresh_max_retries,
            "TAVILY_CREDITS_REFRESH_MAX_RETRIES",
        );
        overlay(
            &mut credits.refresh_retry_delay_ms,
            "TAVILY_CREDITS_REFRESH_RETRY_DELAY_MS",
        );

        overlay(&mut self.tavily.max_retries, "TAVILY_MAX_RETRIES");
        overlay(&mut self.brave.max_retries, "BRAVE_MAX_RETRIES");
        overlay(&mut self.brave.max_qps, "BRAVE_MAX_QPS");
        overlay_opt(&mut self.brave.min_interval_ms, "BRAVE_MIN_INTERVAL_MS");
        overlay(&mut self.brave.timeout_ms, "BRAVE_HTTP_TIMEOUT_MS");

        overlay(&mut self.settings.refresh_ms, "SERVER_SETTINGS_REFRESH_MS");
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("tavily.base_url", &self.tavily.base_url),
            ("brave.base_url", &self.brave.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(common::Error::Config(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.tavily.timeout_ms == 0 || self.brave.timeout_ms == 0 {
            return Err(common::Error::Config(
                "upstream timeouts must be greater than 0".into(),
            ));
        }

        if self.credits.refresh_timeout_ms == 0 || self.credits.refresh_max_retries == 0 {
            return Err(common::Error::Config(
                "credit refresh timeout and attempts must be greater than 0".into(),
            ));
        }

        if !self.credits.min_remaining.is_finite() || self.credits.min_remaining < 0.0 {
            return Err(common::Error::Config(format!(
                "credits.min_remaining must be a non-negative number, got: {}",
                self.credits.min_remaining
            )));
        }

        if self.client_rate_limit.max_requests == 0 || self.client_rate_limit.window_ms == 0 {
            return Err(common::Error::Config(
                "client_rate_limit requires max_requests and window_ms greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("search-gateway.toml")
    }

    /// Credit cache tuning for the Tavily pool.
    pub fn credit_policy(&self) -> CreditPolicy {
        let c = &self.credits;
        CreditPolicy {
            ttl: Duration::from_millis(c.cache_ttl_ms),
            stale_grace: Duration::from_millis(c.stale_grace_ms),
            min_remaining: c.min_remaining,
            cooldown: Duration::from_millis(c.cooldown_ms),
            refresh_lock: Duration::from_millis(c.refresh_lock_ms),
        }
    }

    /// Options for `GET /usage` calls made during credit refresh.
    pub fn usage_options(&self) -> UsageFetchOptions {
        UsageFetchOptions {
            timeout: Duration::from_millis(self.credits.refresh_timeout_ms),
            max_attempts: self.credits.refresh_max_retries,
            retry_delay: Duration::from_millis(self.credits.refresh_retry_delay_ms),
        }
    }

    /// Spacing between Brave calls: explicit interval, else derived from QPS.
    pub fn brave_min_interval(&self) -> Duration {
        match self.brave.min_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => provider::min_interval_from_qps(self.brave.max_qps),
        }
    }

    /// How long a Brave search may queue on the rate gate.
    pub fn brave_max_wait(&self) -> Duration {
        match self.brave.overflow {
            BraveOverflowMode::Error => Duration::from_millis(1),
            BraveOverflowMode::Queue | BraveOverflowMode::FallbackToTavily => {
                Duration::from_millis(self.brave.max_queue_ms)
            }
        }
    }

    pub fn fallback_strategy(&self) -> SelectionStrategy {
        SelectionStrategy::parse_or(
            self.settings.selection_strategy.as_deref(),
            SelectionStrategy::default(),
        )
    }

    pub fn fallback_search_source_mode(&self) -> SearchSourceMode {
        SearchSourceMode::parse_or(
            self.settings.search_source_mode.as_deref(),
            SearchSourceMode::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const OVERLAY_VARS: &[&str] = &[
        "DATABASE_URL",
        "KEY_ENCRYPTION_SECRET",
        "TAVILY_CREDITS_CACHE_TTL_MS",
        "TAVILY_CREDITS_MIN_REMAINING",
        "TAVILY_MAX_RETRIES",
        "BRAVE_MAX_QPS",
        "BRAVE_MIN_INTERVAL_MS",
        "SERVER_SETTINGS_REFRESH_MS",
    ];

    fn clear_env() {
        for var in OVERLAY_VARS {
            unsafe { remove_env(var) };
        }
    }

    fn minimal_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"
"#
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search-gateway.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(minimal_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.database.url, "sqlite:search-gateway.db?mode=rwc");
        assert_eq!(config.tavily.base_url, "https://api.tavily.com");
        assert_eq!(config.tavily.max_retries, 2);
        assert!(config.brave.enabled);
        assert_eq!(config.brave.overflow, BraveOverflowMode::FallbackToTavily);
        assert_eq!(config.credits.cache_ttl_ms, 60_000);
        assert_eq!(config.credits.refresh_max_retries, 3);
        assert_eq!(config.client_rate_limit.max_requests, 60);
        assert_eq!(config.brave_min_interval(), Duration::from_millis(1000));
        assert_eq!(config.brave_max_wait(), Duration::from_millis(30_000));
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(
            r#"
[server]
listen_addr = "0.0.0.0:9000"
max_connections = 50

[database]
url = "memory"

[tavily]
base_url = "http://127.0.0.1:7001"
max_retries = 4
min_interval_ms = 100

[brave]
enabled = false
max_qps = 4.0
overflow = "error"

[credits]
min_remaining = 2.5
cooldown_ms = 1000

[settings]
selection_strategy = "random"
search_source_mode = "combined"

[client_rate_limit]
max_requests = 10
window_ms = 1000
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.database.url, "memory");
        assert_eq!(config.tavily.min_interval_ms, Some(100));
        assert!(!config.brave.enabled);
        assert_eq!(config.brave_min_interval(), Duration::from_millis(250));
        assert_eq!(config.brave_max_wait(), Duration::from_millis(1));
        assert_eq!(config.fallback_strategy(), SelectionStrategy::Random);
        assert_eq!(
            config.fallback_search_source_mode(),
            SearchSourceMode::Combined
        );

        let policy = config.credit_policy();
        assert_eq!(policy.min_remaining, 2.5);
        assert_eq!(policy.cooldown, Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(minimal_toml());

        unsafe {
            set_env("DATABASE_URL", "memory");
            set_env("TAVILY_CREDITS_CACHE_TTL_MS", "1234");
            set_env("TAVILY_CREDITS_MIN_REMAINING", "3");
            set_env("TAVILY_MAX_RETRIES", "0");
            set_env("BRAVE_MIN_INTERVAL_MS", "40");
            set_env("SERVER_SETTINGS_REFRESH_MS", "100");
        }
        let config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(config.database.url, "memory");
        assert_eq!(config.credits.cache_ttl_ms, 1234);
        assert_eq!(config.credits.min_remaining, 3.0);
        assert_eq!(config.tavily.max_retries, 0);
        assert_eq!(config.brave_min_interval(), Duration::from_millis(40));
        assert_eq!(config.settings.refresh_ms, 100);
    }

    #[test]
    fn test_unparseable_env_keeps_file_value() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(minimal_toml());

        unsafe {
            set_env("TAVILY_CREDITS_CACHE_TTL_MS", "soon");
            set_env("BRAVE_MAX_QPS", "fast");
        }
        let config = Config::load(&path).unwrap();
        clear_env();

        assert_eq!(config.credits.cache_ttl_ms, 60_000);
        assert_eq!(config.brave.max_qps, 1.0);
    }

    #[test]
    fn test_encryption_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(minimal_toml());

        unsafe { set_env("KEY_ENCRYPTION_SECRET", &"ab".repeat(32)) };
        let config = Config::load(&path).unwrap();
        clear_env();

        let key = config.encryption_key.unwrap();
        assert_eq!(key.expose().len(), 32);
        assert_eq!(key.expose()[0], 0xab);
    }

    #[test]
    fn test_malformed_encryption_key_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(minimal_toml());

        unsafe { set_env("KEY_ENCRYPTION_SECRET", "too-short") };
        let result = Config::load(&path);
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[tavily]
base_url = "ftp://api.tavily.com"
"#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("tavily.base_url"), "got: {err}");
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let (_dir, path) = write_config(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[client_rate_limit]
max_requests = 0
"#,
        );

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("search-gateway.toml")
        );

        unsafe { set_env("CONFIG_PATH", "/etc/gateway.toml") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/gateway.toml")
        );
        assert_eq!(
            Config::resolve_path(Some("/cli.toml")),
            PathBuf::from("/cli.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
