//! Upstream failure classification for the rotating clients
//!
//! Decides what a failed attempt says about the key that made it. Only the
//! rotation loop acts on this; the pools never classify errors themselves.

use provider::ProviderError;

/// What a failed upstream call implies for the key that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Credentials rejected. Mark the key invalid and rotate.
    Permanent,
    /// Rate limited, out of quota or upstream 5xx. Demote the key and rotate.
    QuotaExceeded,
    /// Not attributable to the key. Surface to the caller without retrying.
    Passthrough,
}

impl ErrorClassification {
    /// Label used in rotation metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorClassification::Permanent => "invalid",
            ErrorClassification::QuotaExceeded => "quota",
            ErrorClassification::Passthrough => "passthrough",
        }
    }
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        401 | 403 => ErrorClassification::Permanent,
        429 | 500..=599 => ErrorClassification::QuotaExceeded,
        _ => ErrorClassification::Passthrough,
    }
}

/// Classify a provider error. Transport failures, timeouts and rate gate
/// timeouts pass through: another key would not fare better.
pub fn classify_error(error: &ProviderError) -> ErrorClassification {
    match error {
        ProviderError::InvalidApiKey => ErrorClassification::Permanent,
        ProviderError::UsageLimitExceeded => ErrorClassification::QuotaExceeded,
        ProviderError::Http { status, .. } => classify_status(*status),
        ProviderError::Transport(_)
        | ProviderError::Timeout(_)
        | ProviderError::RateGateTimeout(_)
        | ProviderError::Decode(_) => ErrorClassification::Passthrough,
    }
}
