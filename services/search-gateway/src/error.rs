//! Tool call error responses
//!
//! Pool and upstream failures surface to callers as a JSON body
//! `{"error": ..., "retry_after_ms": ...}` with a matching status. Store and
//! decryption failures are logged and reported as a generic 500.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use key_pool::Preflight;
use provider::ProviderError;
use tracing::error;

/// A failed tool call, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl ToolError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    /// Map a pool or upstream failure for `provider` ("Tavily" or "Brave").
    pub fn from_pool(provider: &str, err: key_pool::Error) -> Self {
        match err {
            key_pool::Error::NoKeysAvailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            key_pool::Error::Upstream(e) => Self::from_upstream(provider, e),
            key_pool::Error::Store(_) | key_pool::Error::Decrypt { .. } => {
                error!(provider, error = %err, "key pool failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    fn from_upstream(provider: &str, err: ProviderError) -> Self {
        match err {
            ProviderError::RateGateTimeout(waited) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!(
                    "{provider} API error: request queued too long (maxWaitMs={})",
                    waited.as_millis()
                ),
            ),
            ProviderError::Timeout(_) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("{provider} API error: {err}"),
            ),
            ProviderError::Http { status, ref message } if (400..500).contains(&status) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                Self::new(status, format!("{provider} API error: {message}"))
            }
            ProviderError::Http { ref message, .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("{provider} API error: {message}"),
            ),
            _ => Self::new(
                StatusCode::BAD_GATEWAY,
                format!("{provider} API error: {err}"),
            ),
        }
    }

    /// Render a blocked credits preflight. `None` when the call may proceed.
    pub fn from_preflight(preflight: Preflight) -> Option<Self> {
        match preflight {
            Preflight::Ok => None,
            Preflight::Blocked {
                status,
                error,
                retry_after_ms,
            } => Some(
                Self::new(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                    error,
                )
                .with_retry_after(retry_after_ms),
            ),
        }
    }
}

/// `Retry-After` in whole seconds, rounded up.
pub fn retry_after_header(retry_after_ms: u64) -> HeaderValue {
    HeaderValue::from(retry_after_ms.div_ceil(1000).max(1))
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "retry_after_ms": self.retry_after_ms,
        });
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if let Some(ms) = self.retry_after_ms {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after_header(ms));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn no_keys_is_service_unavailable() {
        let err = ToolError::from_pool("Tavily", key_pool::Error::NoKeysAvailable("Tavily"));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.message, "No Tavily API keys available");
    }

    #[test]
    fn upstream_errors_carry_provider_prefix() {
        let err = ToolError::from_pool(
            "Brave",
            key_pool::Error::Upstream(ProviderError::Http {
                status: 502,
                message: "bad gateway".into(),
            }),
        );
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.message, "Brave API error: bad gateway");

        let err = ToolError::from_pool(
            "Tavily",
            key_pool::Error::Upstream(ProviderError::Http {
                status: 400,
                message: "query is required".into(),
            }),
        );
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Tavily API error: query is required");
    }

    #[test]
    fn queued_too_long_names_the_wait() {
        let err = ToolError::from_pool(
            "Brave",
            key_pool::Error::Upstream(ProviderError::RateGateTimeout(Duration::from_millis(
                30_000,
            ))),
        );
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            err.message,
            "Brave API error: request queued too long (maxWaitMs=30000)"
        );
    }

    #[test]
    fn timeouts_are_gateway_timeouts() {
        let err = ToolError::from_pool(
            "Tavily",
            key_pool::Error::Upstream(ProviderError::Timeout(Duration::from_secs(30))),
        );
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn store_failures_hide_details() {
        let err = ToolError::from_pool(
            "Tavily",
            key_pool::Error::Decrypt {
                key_id: "k1".into(),
                message: "bad tag".into(),
            },
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn blocked_preflight_keeps_status_and_retry_after() {
        assert!(ToolError::from_preflight(Preflight::Ok).is_none());

        let err = ToolError::from_preflight(Preflight::Blocked {
            status: 429,
            error: "Upstream quota exhausted".into(),
            retry_after_ms: Some(1500),
        })
        .unwrap();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_ms, Some(1500));

        let response = err.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn retry_after_rounds_up_to_at_least_one_second() {
        assert_eq!(retry_after_header(1), "1");
        assert_eq!(retry_after_header(1000), "1");
        assert_eq!(retry_after_header(1001), "2");
        assert_eq!(retry_after_header(0), "1");
    }
}
