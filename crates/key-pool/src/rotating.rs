//! Rotating upstream clients
//!
//! Each logical call runs in a loop of at most `max_retries + 1` attempts.
//! Every attempt asks the pool for a fresh key, builds a client bound to it
//! and invokes the operation. A failure is classified: rejected credentials
//! invalidate the key, rate limits and server errors demote it (cooldown for
//! Tavily, failure score for Brave), and the loop moves on to another key.
//! Anything else is returned to the caller as is.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use provider::{BraveClient, QueuedRateGate, TavilyClient};
use serde_json::Value;
use tracing::{debug, warn};

use crate::classify::{ErrorClassification, classify_error};
use crate::cost::{Operation, OperationParams};
use crate::credit_pool::CreditPool;
use crate::error::{Error, Result};
use crate::failure_pool::FailurePool;
use crate::selected::SelectedKey;

const TAVILY: &str = "tavily";
const BRAVE: &str = "brave";

fn record_attempt(provider: &'static str, tool: &'static str, outcome: &'static str, started: Instant) {
    metrics::counter!(
        "gateway_upstream_calls_total",
        "provider" => provider,
        "tool" => tool,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "gateway_upstream_call_duration_seconds",
        "provider" => provider,
        "tool" => tool
    )
    .record(started.elapsed().as_secs_f64());
}

fn record_rotation(provider: &'static str, class: ErrorClassification) {
    metrics::counter!(
        "gateway_key_rotations_total",
        "provider" => provider,
        "reason" => class.reason()
    )
    .increment(1);
}

/// Tavily client that fails over across the credit pool.
pub struct RotatingTavilyClient {
    pool: Arc<CreditPool>,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    gate: Option<Arc<QueuedRateGate>>,
}

impl RotatingTavilyClient {
    pub fn new(
        pool: Arc<CreditPool>,
        http: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            http,
            base_url: base_url.into(),
            timeout,
            max_retries,
            gate: None,
        }
    }

    /// Pace every attempt through a shared gate.
    pub fn with_gate(mut self, gate: Arc<QueuedRateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn pool(&self) -> &Arc<CreditPool> {
        &self.pool
    }

    pub async fn search(&self, payload: &Value) -> Result<Value> {
        self.call_metered(Operation::Search, payload, |c| async move { c.search(payload).await })
            .await
    }

    pub async fn extract(&self, payload: &Value) -> Result<Value> {
        self.call_metered(Operation::Extract, payload, |c| async move { c.extract(payload).await })
            .await
    }

    pub async fn crawl(&self, payload: &Value) -> Result<Value> {
        self.call_metered(Operation::Crawl, payload, |c| async move { c.crawl(payload).await })
            .await
    }

    pub async fn map(&self, payload: &Value) -> Result<Value> {
        self.call_metered(Operation::Map, payload, |c| async move { c.map(payload).await })
            .await
    }

    pub async fn research_start(&self, payload: &Value) -> Result<Value> {
        self.call_metered(Operation::Research, payload, |c| async move {
            c.research_start(payload).await
        })
        .await
    }

    /// Poll a research task. Polling is not billed, so any key with credits
    /// above the floor will do.
    pub async fn research_poll(&self, request_id: &str) -> Result<Value> {
        self.with_rotation("research_poll", None, &OperationParams::default(), |c| async move {
            c.research_poll(request_id).await
        })
        .await
    }

    async fn call_metered<F, Fut>(&self, operation: Operation, payload: &Value, call: F) -> Result<Value>
    where
        F: Fn(TavilyClient) -> Fut,
        Fut: Future<Output = provider::Result<Value>>,
    {
        let params = OperationParams::from_payload(payload);
        self.with_rotation(operation.as_str(), Some(operation), &params, call)
            .await
    }

    fn client_for(&self, key: &SelectedKey) -> TavilyClient {
        let client = TavilyClient::new(
            self.http.clone(),
            self.base_url.clone(),
            key.secret.clone(),
            self.timeout,
        );
        match &self.gate {
            Some(gate) => client.with_gate(gate.clone()),
            None => client,
        }
    }

    async fn with_rotation<F, Fut>(
        &self,
        tool: &'static str,
        operation: Option<Operation>,
        params: &OperationParams,
        call: F,
    ) -> Result<Value>
    where
        F: Fn(TavilyClient) -> Fut,
        Fut: Future<Output = provider::Result<Value>>,
    {
        for attempt in 1..=self.max_retries.saturating_add(1) {
            let Some(key) = self.pool.select_eligible_key(operation, params).await? else {
                return Err(Error::NoKeysAvailable("Tavily"));
            };

            let started = Instant::now();
            let err = match call(self.client_for(&key)).await {
                Ok(value) => {
                    record_attempt(TAVILY, tool, "ok", started);
                    debug!(key_id = key.short_id(), tool, attempt, "tavily call succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify_error(&err);
            record_attempt(TAVILY, tool, class.reason(), started);
            match class {
                ErrorClassification::Permanent => self.pool.mark_invalid(&key.id).await?,
                ErrorClassification::QuotaExceeded => {
                    let until = common::now_millis() + self.pool.policy().cooldown_ms();
                    self.pool.mark_cooldown(&key.id, until).await?;
                }
                ErrorClassification::Passthrough => {
                    warn!(key_id = key.short_id(), tool, error = %err, "tavily call failed");
                    return Err(err.into());
                }
            }
            record_rotation(TAVILY, class);
            warn!(
                key_id = key.short_id(),
                tool,
                attempt,
                reason = class.reason(),
                error = %err,
                "tavily key failed, rotating"
            );
        }

        Err(Error::NoKeysAvailable("Tavily"))
    }
}

/// Brave client that fails over across the failure-score pool.
pub struct RotatingBraveClient {
    pool: Arc<FailurePool>,
    http: reqwest::Client,
    base_url: String,
    gate: Arc<QueuedRateGate>,
    timeout: Duration,
    max_retries: u32,
}

impl RotatingBraveClient {
    pub fn new(
        pool: Arc<FailurePool>,
        http: reqwest::Client,
        base_url: impl Into<String>,
        gate: Arc<QueuedRateGate>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            http,
            base_url: base_url.into(),
            gate,
            timeout,
            max_retries,
        }
    }

    pub fn pool(&self) -> &Arc<FailurePool> {
        &self.pool
    }

    /// Web search. `max_wait` caps the time spent queued on the rate gate.
    pub async fn web_search(&self, params: &Value, max_wait: Option<Duration>) -> Result<Value> {
        self.with_rotation("web_search", |c| async move { c.web_search(params, max_wait).await })
            .await
    }

    pub async fn local_search(&self, params: &Value, max_wait: Option<Duration>) -> Result<Value> {
        self.with_rotation("local_search", |c| async move {
            c.local_search(params, max_wait).await
        })
        .await
    }

    async fn with_rotation<F, Fut>(&self, tool: &'static str, call: F) -> Result<Value>
    where
        F: Fn(BraveClient) -> Fut,
        Fut: Future<Output = provider::Result<Value>>,
    {
        let mut tried = Vec::new();
        for attempt in 1..=self.max_retries.saturating_add(1) {
            let Some(key) = self.pool.select_excluding(&tried).await? else {
                return Err(Error::NoKeysAvailable("Brave"));
            };
            let client = BraveClient::new(
                self.http.clone(),
                self.base_url.clone(),
                key.secret.clone(),
                self.gate.clone(),
                self.timeout,
            );

            let started = Instant::now();
            let err = match call(client).await {
                Ok(value) => {
                    record_attempt(BRAVE, tool, "ok", started);
                    debug!(key_id = key.short_id(), tool, attempt, "brave call succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify_error(&err);
            record_attempt(BRAVE, tool, class.reason(), started);
            match class {
                ErrorClassification::Permanent => self.pool.mark_invalid(&key.id).await?,
                ErrorClassification::QuotaExceeded => {
                    self.pool.increment_failure_score(&key.id).await?
                }
                ErrorClassification::Passthrough => {
                    warn!(key_id = key.short_id(), tool, error = %err, "brave call failed");
                    return Err(err.into());
                }
            }
            record_rotation(BRAVE, class);
            tried.push(key.id.clone());
            warn!(
                key_id = key.short_id(),
                tool,
                attempt,
                reason = class.reason(),
                error = %err,
                "brave key failed, rotating"
            );
        }

        Err(Error::NoKeysAvailable("Brave"))
    }
}
