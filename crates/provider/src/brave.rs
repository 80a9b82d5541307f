//! Brave Search HTTP client
//!
//! Brave enforces a per-subscription QPS budget rather than credits, so every
//! call waits on the shared `QueuedRateGate` before going out. Callers can cap
//! that wait with `max_wait`.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde_json::Value;
use tracing::debug;

use crate::rate_gate::QueuedRateGate;
use crate::{ProviderError, Result, error_message, read_body, transport_error};

/// Production API root.
pub const BRAVE_BASE_URL: &str = "https://api.search.brave.com";

const WEB_SEARCH_PATH: &str = "/res/v1/web/search";

/// Client bound to one Brave subscription token.
#[derive(Debug, Clone)]
pub struct BraveClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Secret<String>,
    gate: Arc<QueuedRateGate>,
    timeout: Duration,
}

impl BraveClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Secret<String>,
        gate: Arc<QueuedRateGate>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            gate,
            timeout,
        }
    }

    /// Web search. `params` is a JSON object of query parameters (`q`,
    /// `count`, `offset`, ...).
    pub async fn web_search(&self, params: &Value, max_wait: Option<Duration>) -> Result<Value> {
        let query = query_pairs(params)?;
        self.get(WEB_SEARCH_PATH, &query, max_wait).await
    }

    /// Local (points of interest) search, served by the web endpoint filtered
    /// to location results.
    pub async fn local_search(&self, params: &Value, max_wait: Option<Duration>) -> Result<Value> {
        let mut query = query_pairs(params)?;
        query.retain(|(k, _)| k != "result_filter");
        query.push(("result_filter".into(), "locations".into()));
        self.get(WEB_SEARCH_PATH, &query, max_wait).await
    }

    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        max_wait: Option<Duration>,
    ) -> Result<Value> {
        self.gate.acquire(max_wait).await?;

        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, params = query.len(), "brave GET");
        let response = self
            .http
            .get(&url)
            .header("X-Subscription-Token", self.api_key.expose())
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        let body = read_body(response).await;
        if status.is_success() {
            return Ok(body);
        }
        Err(ProviderError::Http {
            status: status.as_u16(),
            message: error_message(&body, status.canonical_reason().unwrap_or("error")),
        })
    }
}

/// Flatten a JSON object into query pairs. Arrays become repeated keys, nulls
/// are dropped, nested objects are rejected.
fn query_pairs(params: &Value) -> Result<Vec<(String, String)>> {
    let object = match params {
        Value::Object(map) => map,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(ProviderError::Decode(format!(
                "search params must be a JSON object, got {other}"
            )));
        }
    };

    let mut pairs = Vec::with_capacity(object.len());
    for (key, value) in object {
        match value {
            Value::Null => {}
            Value::String(s) => pairs.push((key.clone(), s.clone())),
            Value::Number(_) | Value::Bool(_) => pairs.push((key.clone(), value.to_string())),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(s) => pairs.push((key.clone(), s.clone())),
                        Value::Null => {}
                        other => pairs.push((key.clone(), other.to_string())),
                    }
                }
            }
            Value::Object(_) => {
                return Err(ProviderError::Decode(format!(
                    "search param {key:?} must not be an object"
                )));
            }
        }
    }
    Ok(pairs)
}
