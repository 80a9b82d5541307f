//! Upstream search provider clients
//!
//! Thin HTTP clients for the two upstreams the gateway fronts. Each client is
//! bound to exactly one decrypted API key and is meant to be built per attempt
//! by the rotating clients, then dropped. Payloads are opaque JSON; the
//! gateway does not define the tool wire format.
//!
//! - `TavilyClient`: credit-metered API (search, extract, crawl, map,
//!   research) plus the `/usage` credits endpoint
//! - `BraveClient`: web/local search, paced through a shared `QueuedRateGate`

pub mod brave;
pub mod rate_gate;
pub mod tavily;

pub use brave::{BRAVE_BASE_URL, BraveClient};
pub use rate_gate::{QueuedRateGate, min_interval_from_qps};
pub use tavily::{TAVILY_BASE_URL, TavilyClient, UsageFetchOptions, UsageSnapshot};

use std::time::Duration;

/// Errors from upstream provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Upstream rejected the key (Tavily 401).
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Upstream reports the key's quota is spent (Tavily 429/432/433).
    #[error("Usage limit exceeded")]
    UsageLimitExceeded,

    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate gate did not release within {0:?}")]
    RateGateTimeout(Duration),

    #[error("invalid upstream response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// HTTP status associated with this error, if the upstream produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::InvalidApiKey => Some(401),
            ProviderError::UsageLimitExceeded => Some(429),
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Read a response body as JSON, falling back to `{"message": <text>}` for
/// non-JSON bodies so error messages survive.
pub(crate) async fn read_body(response: reqwest::Response) -> serde_json::Value {
    match response.text().await {
        Ok(text) => serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({ "message": text })),
        Err(e) => serde_json::json!({ "message": format!("<unreadable body: {e}>") }),
    }
}

/// Best-effort human message from an upstream error body.
pub(crate) fn error_message(body: &serde_json::Value, fallback: &str) -> String {
    body.get("message")
        .or_else(|| body.get("detail"))
        .or_else(|| body.pointer("/error/detail"))
        .and_then(|m| m.as_str())
        .unwrap_or(fallback)
        .to_string()
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_key_errors() {
        assert_eq!(ProviderError::InvalidApiKey.status(), Some(401));
        assert_eq!(ProviderError::UsageLimitExceeded.status(), Some(429));
        assert_eq!(
            ProviderError::Http {
                status: 502,
                message: "bad gateway".into()
            }
            .status(),
            Some(502)
        );
        assert_eq!(ProviderError::Transport("reset".into()).status(), None);
        assert_eq!(
            ProviderError::RateGateTimeout(Duration::from_millis(5)).status(),
            None
        );
    }

    #[test]
    fn error_message_prefers_message_then_detail() {
        let body = serde_json::json!({"message": "nope", "detail": "ignored"});
        assert_eq!(error_message(&body, "fallback"), "nope");

        let body = serde_json::json!({"detail": "plan limit"});
        assert_eq!(error_message(&body, "fallback"), "plan limit");

        let body = serde_json::json!({"error": {"detail": "nested"}});
        assert_eq!(error_message(&body, "fallback"), "nested");

        assert_eq!(error_message(&serde_json::json!({}), "fallback"), "fallback");
    }
}
