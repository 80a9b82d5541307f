//! Tool call dispatch
//!
//! `POST /tools/{tool}` runs one tool call: bearer identity, per-client rate
//! limit, credits preflight for Tavily tools, then the rotating client. Web
//! search is routed by the server-wide search source mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode, header};
use key_pool::{
    Operation, OperationParams, RotatingBraveClient, RotatingTavilyClient, SearchSourceMode,
    ServerSettings,
};
use provider::ProviderError;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::BraveOverflowMode;
use crate::error::ToolError;
use crate::metrics;
use crate::rate_limit::{FixedWindowRateLimiter, RateLimitDecision};

const BRAVE_NOT_CONFIGURED: &str =
    "Brave Search is not configured. Please add a Brave API key or change the search source mode.";

/// Tools exposed on `/tools/{tool}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    TavilySearch,
    TavilyExtract,
    TavilyCrawl,
    TavilyMap,
    TavilyResearch,
    TavilyResearchStatus,
    BraveWebSearch,
    BraveLocalSearch,
}

impl Tool {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tavily_search" => Some(Tool::TavilySearch),
            "tavily_extract" => Some(Tool::TavilyExtract),
            "tavily_crawl" => Some(Tool::TavilyCrawl),
            "tavily_map" => Some(Tool::TavilyMap),
            "tavily_research" => Some(Tool::TavilyResearch),
            "tavily_research_status" => Some(Tool::TavilyResearchStatus),
            "brave_web_search" => Some(Tool::BraveWebSearch),
            "brave_local_search" => Some(Tool::BraveLocalSearch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::TavilySearch => "tavily_search",
            Tool::TavilyExtract => "tavily_extract",
            Tool::TavilyCrawl => "tavily_crawl",
            Tool::TavilyMap => "tavily_map",
            Tool::TavilyResearch => "tavily_research",
            Tool::TavilyResearchStatus => "tavily_research_status",
            Tool::BraveWebSearch => "brave_web_search",
            Tool::BraveLocalSearch => "brave_local_search",
        }
    }
}

/// Everything a tool call needs.
pub struct Gateway {
    pub tavily: Arc<RotatingTavilyClient>,
    /// `None` when Brave is disabled.
    pub brave: Option<Arc<RotatingBraveClient>>,
    pub settings: Arc<ServerSettings>,
    pub limiter: FixedWindowRateLimiter,
    pub brave_overflow: BraveOverflowMode,
    pub brave_max_wait: Duration,
}

/// Rate limit identity for a bearer token. The raw token is never kept.
fn client_identity(token: &str) -> String {
    hex::encode(&Sha256::digest(token.as_bytes())[..16])
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl Gateway {
    /// Run one tool call end to end and record it.
    pub async fn handle(
        &self,
        tool_name: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Value, ToolError> {
        let started = Instant::now();
        let tool = Tool::parse(tool_name);
        let label = tool.map_or("unknown", |t| t.as_str());

        let result = self.dispatch(tool, tool_name, headers, body).await;

        let status = match &result {
            Ok(_) => StatusCode::OK,
            Err(e) => e.status,
        };
        metrics::record_request(label, status.as_u16(), started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(
        &self,
        tool: Option<Tool>,
        tool_name: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Value, ToolError> {
        let Some(token) = bearer_token(headers) else {
            return Err(ToolError::new(
                StatusCode::UNAUTHORIZED,
                "Missing bearer token",
            ));
        };

        if let RateLimitDecision::Limited { retry_after_ms } = self
            .limiter
            .check(&client_identity(token), common::now_millis())
        {
            metrics::record_rate_limited();
            return Err(
                ToolError::new(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
                    .with_retry_after(Some(retry_after_ms)),
            );
        }

        let Some(tool) = tool else {
            return Err(ToolError::new(
                StatusCode::NOT_FOUND,
                format!("Unknown tool: {tool_name}"),
            ));
        };

        let payload = parse_payload(body)?;
        debug!(tool = tool.as_str(), "tool call");

        match tool {
            Tool::TavilySearch => self.tavily_metered(Operation::Search, &payload).await,
            Tool::TavilyExtract => self.tavily_metered(Operation::Extract, &payload).await,
            Tool::TavilyCrawl => self.tavily_metered(Operation::Crawl, &payload).await,
            Tool::TavilyMap => self.tavily_metered(Operation::Map, &payload).await,
            Tool::TavilyResearch => self.tavily_metered(Operation::Research, &payload).await,
            Tool::TavilyResearchStatus => {
                let Some(request_id) = payload.get("request_id").and_then(Value::as_str) else {
                    return Err(ToolError::new(
                        StatusCode::BAD_REQUEST,
                        "request_id is required",
                    ));
                };
                self.tavily
                    .research_poll(request_id)
                    .await
                    .map_err(|e| ToolError::from_pool("Tavily", e))
            }
            Tool::BraveWebSearch => self.web_search(&payload).await,
            Tool::BraveLocalSearch => self.local_search(&payload).await,
        }
    }

    /// Credits preflight, then the rotating Tavily call.
    async fn tavily_metered(&self, operation: Operation, payload: &Value) -> Result<Value, ToolError> {
        let params = OperationParams::from_payload(payload);
        let preflight = self
            .tavily
            .pool()
            .preflight_credits_check(Some(operation), &params)
            .await
            .map_err(|e| ToolError::from_pool("Tavily", e))?;
        if let Some(blocked) = ToolError::from_preflight(preflight) {
            info!(
                operation = %operation,
                status = blocked.status.as_u16(),
                "tool call blocked by credits preflight"
            );
            return Err(blocked);
        }

        let tavily = &self.tavily;
        let result = match operation {
            Operation::Search => tavily.search(payload).await,
            Operation::Extract => tavily.extract(payload).await,
            Operation::Crawl => tavily.crawl(payload).await,
            Operation::Map => tavily.map(payload).await,
            Operation::Research => tavily.research_start(payload).await,
        };
        result.map_err(|e| ToolError::from_pool("Tavily", e))
    }

    /// Web search through Tavily, shaped like a search tool result.
    async fn tavily_web_search(&self, payload: &Value) -> Result<Value, ToolError> {
        let mut request = json!({ "query": payload.get("query").cloned().unwrap_or(Value::Null) });
        if let Some(count) = payload.get("count") {
            request["max_results"] = count.clone();
        }
        let body = self.tavily_metered(Operation::Search, &request).await?;
        Ok(search_result("tavily", merge_results(&[&body])))
    }

    async fn brave_web_search(&self, brave: &RotatingBraveClient, payload: &Value) -> key_pool::Result<Value> {
        brave
            .web_search(&brave_params(payload), Some(self.brave_max_wait))
            .await
    }

    async fn web_search(&self, payload: &Value) -> Result<Value, ToolError> {
        let mode = self.settings.search_source_mode().await;
        debug!(mode = %mode, "routing web search");

        match mode {
            SearchSourceMode::TavilyOnly => self.tavily_web_search(payload).await,
            SearchSourceMode::BraveOnly => {
                let Some(brave) = &self.brave else {
                    return Err(ToolError::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        BRAVE_NOT_CONFIGURED,
                    ));
                };
                let body = self
                    .brave_web_search(brave, payload)
                    .await
                    .map_err(|e| ToolError::from_pool("Brave", e))?;
                Ok(search_result("brave", merge_results(&[&body])))
            }
            SearchSourceMode::Combined => {
                let Some(brave) = &self.brave else {
                    return self.tavily_web_search(payload).await;
                };
                let (tavily, brave) = tokio::join!(
                    self.tavily_web_search(payload),
                    self.brave_web_search(brave, payload)
                );
                let tavily = tavily.unwrap_or_else(|e| {
                    warn!(error = %e.message, "tavily leg of combined search failed");
                    json!({})
                });
                let brave = brave.unwrap_or_else(|e| {
                    warn!(error = %e, "brave leg of combined search failed");
                    json!({})
                });
                // The Tavily leg is already normalized; its `results` merge
                // the same way as a raw body.
                Ok(search_result("combined", merge_results(&[&tavily, &brave])))
            }
            SearchSourceMode::BravePreferTavilyFallback => {
                let Some(brave) = &self.brave else {
                    return self.tavily_web_search(payload).await;
                };
                match self.brave_web_search(brave, payload).await {
                    Ok(body) => Ok(search_result("brave", merge_results(&[&body]))),
                    Err(e) if self.should_fall_back(&e) => {
                        info!(error = %e, "brave search unavailable, falling back to tavily");
                        self.tavily_web_search(payload).await
                    }
                    Err(e) => Err(ToolError::from_pool("Brave", e)),
                }
            }
        }
    }

    fn should_fall_back(&self, err: &key_pool::Error) -> bool {
        match err {
            key_pool::Error::NoKeysAvailable(_) => true,
            key_pool::Error::Upstream(
                ProviderError::RateGateTimeout(_) | ProviderError::Http { .. },
            ) => self.brave_overflow == BraveOverflowMode::FallbackToTavily,
            _ => false,
        }
    }

    /// Local search has no Tavily equivalent; it always needs Brave.
    async fn local_search(&self, payload: &Value) -> Result<Value, ToolError> {
        let Some(brave) = &self.brave else {
            return Err(ToolError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                BRAVE_NOT_CONFIGURED,
            ));
        };
        brave
            .local_search(&brave_params(payload), Some(self.brave_max_wait))
            .await
            .map_err(|e| ToolError::from_pool("Brave", e))
    }
}

fn parse_payload(body: &[u8]) -> Result<Value, ToolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ToolError::new(
            StatusCode::BAD_REQUEST,
            "tool arguments must be a JSON object",
        )),
        Err(e) => Err(ToolError::new(
            StatusCode::BAD_REQUEST,
            format!("invalid JSON body: {e}"),
        )),
    }
}

/// Brave query parameters from tool arguments: `query` becomes `q`, other
/// scalar arguments pass through.
fn brave_params(payload: &Value) -> Value {
    let mut params = Map::new();
    if let Some(object) = payload.as_object() {
        for (key, value) in object {
            let key = if key == "query" { "q" } else { key.as_str() };
            if !value.is_object() {
                params.insert(key.to_string(), value.clone());
            }
        }
    }
    Value::Object(params)
}

fn search_result(source: &str, results: Vec<Value>) -> Value {
    json!({ "source": source, "results": results })
}

/// Flatten upstream result lists into `{title, url, description}`, keeping
/// the first occurrence of each URL.
fn merge_results(bodies: &[&Value]) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();

    for body in bodies {
        let items = body
            .pointer("/web/results")
            .or_else(|| body.get("results"))
            .and_then(Value::as_array);
        for item in items.into_iter().flatten() {
            let Some(url) = item.get("url").and_then(Value::as_str) else {
                continue;
            };
            if !seen.insert(url.to_string()) {
                continue;
            }
            let description = ["content", "description", "snippet"]
                .iter()
                .find_map(|k| item.get(*k).and_then(Value::as_str))
                .unwrap_or("");
            merged.push(json!({
                "title": item.get("title").and_then(Value::as_str).unwrap_or(""),
                "url": url,
                "description": description,
            }));
        }
    }
    merged
}
