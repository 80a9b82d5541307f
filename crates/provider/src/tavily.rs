//! Tavily HTTP client
//!
//! Tavily bills every call in credits. Besides the tool endpoints, the client
//! reads `GET /usage`, which reports per-key and per-account usage and limits;
//! the key pool turns that into a `remaining` balance for admission decisions.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::rate_gate::QueuedRateGate;
use crate::{ProviderError, Result, error_message, read_body, transport_error};

/// Production API root.
pub const TAVILY_BASE_URL: &str = "https://api.tavily.com";

/// Client bound to one Tavily API key.
#[derive(Debug, Clone)]
pub struct TavilyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    gate: Option<Arc<QueuedRateGate>>,
    timeout: Duration,
}

impl TavilyClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Secret<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            gate: None,
            timeout,
        }
    }

    /// Pace every call through a shared gate.
    pub fn with_gate(mut self, gate: Arc<QueuedRateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub async fn search(&self, payload: &Value) -> Result<Value> {
        self.post("/search", payload).await
    }

    pub async fn extract(&self, payload: &Value) -> Result<Value> {
        self.post("/extract", payload).await
    }

    pub async fn crawl(&self, payload: &Value) -> Result<Value> {
        self.post("/crawl", payload).await
    }

    pub async fn map(&self, payload: &Value) -> Result<Value> {
        self.post("/map", payload).await
    }

    pub async fn research_start(&self, payload: &Value) -> Result<Value> {
        self.post("/research", payload).await
    }

    pub async fn research_poll(&self, request_id: &str) -> Result<Value> {
        if request_id.is_empty() || request_id.contains('/') {
            return Err(ProviderError::Decode(format!(
                "invalid research request id: {request_id:?}"
            )));
        }
        self.get(&format!("/research/{request_id}")).await
    }

    /// Read the credit balance for this key.
    pub async fn usage(&self) -> Result<UsageSnapshot> {
        let body = self.get("/usage").await?;
        Ok(UsageSnapshot::from_usage_body(&body))
    }

    /// Read the credit balance with a per-attempt timeout and bounded retries.
    ///
    /// Authentication and quota failures are final and returned immediately;
    /// transport errors, timeouts and 5xx responses are retried up to
    /// `max_attempts` total with a fixed delay in between.
    pub async fn usage_with_retry(&self, opts: &UsageFetchOptions) -> Result<UsageSnapshot> {
        let attempts = opts.max_attempts.max(1);
        let mut last_err = ProviderError::Transport("no attempt made".into());

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(opts.timeout, self.usage()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(opts.timeout)),
            };

            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(e @ (ProviderError::InvalidApiKey | ProviderError::UsageLimitExceeded)) => {
                    return Err(e);
                }
                Err(e) if e.status().is_some_and(|status| status < 500) => return Err(e),
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "credits fetch failed");
                    last_err = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(opts.retry_delay).await;
            }
        }

        Err(last_err)
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        self.wait_for_gate().await?;
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "tavily POST");
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        parse_or_error(response).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.wait_for_gate().await?;
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "tavily GET");
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.api_key.expose())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        parse_or_error(response).await
    }

    async fn wait_for_gate(&self) -> Result<()> {
        match &self.gate {
            Some(gate) => gate.acquire(None).await,
            None => Ok(()),
        }
    }
}

async fn parse_or_error(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = read_body(response).await;
    if status.is_success() {
        return Ok(body);
    }
    match status.as_u16() {
        401 => Err(ProviderError::InvalidApiKey),
        429 | 432 | 433 => Err(ProviderError::UsageLimitExceeded),
        code => Err(ProviderError::Http {
            status: code,
            message: error_message(&body, status.canonical_reason().unwrap_or("error")),
        }),
    }
}

/// Timeout and retry policy for credit reads.
#[derive(Debug, Clone)]
pub struct UsageFetchOptions {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for UsageFetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Credit balances reported by `/usage`.
///
/// Every field is optional: Tavily omits limits for unlimited plans. `remaining`
/// is the tightest known balance across the key limit and the account pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub key_usage: Option<f64>,
    pub key_limit: Option<f64>,
    pub key_remaining: Option<f64>,
    pub account_plan_usage: Option<f64>,
    pub account_plan_limit: Option<f64>,
    pub account_paygo_usage: Option<f64>,
    pub account_paygo_limit: Option<f64>,
    pub account_remaining: Option<f64>,
    pub remaining: Option<f64>,
}

impl UsageSnapshot {
    /// Build a snapshot from the `/usage` response body.
    ///
    /// Shape: `{"key": {"usage", "limit"}, "account": {"plan_usage",
    /// "plan_limit", "paygo_usage", "paygo_limit"}}`. Numbers may arrive as
    /// JSON numbers or numeric strings.
    pub fn from_usage_body(body: &Value) -> Self {
        let key_usage = number_at(body, "/key/usage");
        let key_limit = number_at(body, "/key/limit");
        let account_plan_usage = number_at(body, "/account/plan_usage");
        let account_plan_limit = number_at(body, "/account/plan_limit");
        let account_paygo_usage = number_at(body, "/account/paygo_usage");
        let account_paygo_limit = number_at(body, "/account/paygo_limit");

        let key_remaining = match (key_limit, key_usage) {
            (Some(limit), Some(usage)) => Some((limit - usage).max(0.0)),
            (Some(limit), None) => Some(limit.max(0.0)),
            _ => None,
        };

        let plan_remaining = account_plan_limit
            .map(|limit| (limit - account_plan_usage.unwrap_or(0.0)).max(0.0));
        let paygo_remaining = account_paygo_limit
            .map(|limit| (limit - account_paygo_usage.unwrap_or(0.0)).max(0.0));
        let account_remaining = match (plan_remaining, paygo_remaining) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };

        let remaining = match (key_remaining, account_remaining) {
            (Some(k), Some(a)) => Some(k.min(a)),
            (Some(k), None) => Some(k),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };

        Self {
            key_usage,
            key_limit,
            key_remaining,
            account_plan_usage,
            account_plan_limit,
            account_paygo_usage,
            account_paygo_limit,
            account_remaining,
            remaining,
        }
    }
}

fn number_at(body: &Value, pointer: &str) -> Option<f64> {
    match body.pointer(pointer)? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}
