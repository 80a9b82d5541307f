//! Cached server-wide settings
//!
//! Each setting is cached independently for `max(250ms, refresh)`. Reads of the
//! same setting are single-flight: the per-setting mutex is held across the
//! store read, so concurrent callers wait and then hit the refreshed cache. A
//! failed read keeps serving the last known value (or the static default) and
//! is retried after another TTL. Getters never fail.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use key_store::SettingsStore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::strategy::SelectionStrategy;

const SELECTION_STRATEGY_KEY: &str = "key_selection_strategy";
const SEARCH_SOURCE_MODE_KEY: &str = "search_source_mode";
const MIN_CACHE_TTL: Duration = Duration::from_millis(250);

/// Which upstream serves web and local search tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchSourceMode {
    TavilyOnly,
    BraveOnly,
    /// Query both and merge results, deduplicated by URL.
    Combined,
    /// Brave first, Tavily when Brave is unavailable or fails.
    #[default]
    BravePreferTavilyFallback,
}

impl SearchSourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchSourceMode::TavilyOnly => "tavily_only",
            SearchSourceMode::BraveOnly => "brave_only",
            SearchSourceMode::Combined => "combined",
            SearchSourceMode::BravePreferTavilyFallback => "brave_prefer_tavily_fallback",
        }
    }

    /// Parse with fallback. Case-insensitive; `-` is accepted for `_`.
    pub fn parse_or(raw: Option<&str>, fallback: SearchSourceMode) -> SearchSourceMode {
        let Some(raw) = raw else {
            return fallback;
        };
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tavily_only" => SearchSourceMode::TavilyOnly,
            "brave_only" => SearchSourceMode::BraveOnly,
            "combined" => SearchSourceMode::Combined,
            "brave_prefer_tavily_fallback" => SearchSourceMode::BravePreferTavilyFallback,
            _ => fallback,
        }
    }
}

impl fmt::Display for SearchSourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
    value: T,
    expires_at: Instant,
}

/// Settings cache in front of a `SettingsStore`.
pub struct ServerSettings {
    store: Arc<dyn SettingsStore>,
    ttl: Duration,
    fallback_strategy: SelectionStrategy,
    fallback_mode: SearchSourceMode,
    strategy: Mutex<Option<Cached<SelectionStrategy>>>,
    mode: Mutex<Option<Cached<SearchSourceMode>>>,
}

impl ServerSettings {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        refresh: Duration,
        fallback_strategy: SelectionStrategy,
        fallback_mode: SearchSourceMode,
    ) -> Self {
        Self {
            store,
            ttl: refresh.max(MIN_CACHE_TTL),
            fallback_strategy,
            fallback_mode,
            strategy: Mutex::new(None),
            mode: Mutex::new(None),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn selection_strategy(&self) -> SelectionStrategy {
        let fallback = self.fallback_strategy;
        self.read_cached(&self.strategy, SELECTION_STRATEGY_KEY, fallback, |raw| {
            SelectionStrategy::parse_or(raw, fallback)
        })
        .await
    }

    pub async fn search_source_mode(&self) -> SearchSourceMode {
        let fallback = self.fallback_mode;
        self.read_cached(&self.mode, SEARCH_SOURCE_MODE_KEY, fallback, |raw| {
            SearchSourceMode::parse_or(raw, fallback)
        })
        .await
    }

    /// Persist a new strategy and serve it immediately.
    pub async fn set_selection_strategy(&self, next: SelectionStrategy) -> Result<SelectionStrategy> {
        let mut slot = self.strategy.lock().await;
        self.store
            .put_setting(SELECTION_STRATEGY_KEY, next.as_str())
            .await?;
        *slot = Some(self.cached(next));
        debug!(strategy = %next, "selection strategy updated");
        Ok(next)
    }

    /// Persist a new search source mode and serve it immediately.
    pub async fn set_search_source_mode(&self, next: SearchSourceMode) -> Result<SearchSourceMode> {
        let mut slot = self.mode.lock().await;
        self.store
            .put_setting(SEARCH_SOURCE_MODE_KEY, next.as_str())
            .await?;
        *slot = Some(self.cached(next));
        debug!(mode = %next, "search source mode updated");
        Ok(next)
    }

    fn cached<T>(&self, value: T) -> Cached<T> {
        Cached {
            value,
            expires_at: Instant::now() + self.ttl,
        }
    }

    async fn read_cached<T: Copy>(
        &self,
        slot: &Mutex<Option<Cached<T>>>,
        name: &str,
        fallback: T,
        parse: impl Fn(Option<&str>) -> T,
    ) -> T {
        let mut slot = slot.lock().await;
        if let Some(cached) = *slot
            && Instant::now() < cached.expires_at
        {
            return cached.value;
        }

        let value = match self.store.get_setting(name).await {
            Ok(raw) => parse(raw.as_deref()),
            Err(e) => {
                let last = slot.map(|c| c.value).unwrap_or(fallback);
                warn!(setting = name, error = %e, "settings read failed, serving last known value");
                last
            }
        };
        *slot = Some(self.cached(value));
        value
    }
}
