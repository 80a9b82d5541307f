//! Upstream key row model
//!
//! All timestamps are unix epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Which upstream a key belongs to. Each provider has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Tavily,
    Brave,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Tavily => "tavily",
            ProviderKind::Brave => "brave",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            ProviderKind::Tavily => "tavily_keys",
            ProviderKind::Brave => "brave_keys",
        }
    }
}

/// Lifecycle status of an upstream key.
///
/// `Invalid` and `Disabled` are terminal as far as the pools are concerned;
/// `Cooldown` is left lazily once `cooldown_until` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Cooldown,
    Invalid,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Cooldown => "cooldown",
            KeyStatus::Invalid => "invalid",
            KeyStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(KeyStatus::Active),
            "cooldown" => Some(KeyStatus::Cooldown),
            "invalid" => Some(KeyStatus::Invalid),
            "disabled" => Some(KeyStatus::Disabled),
            _ => None,
        }
    }
}

/// Last known credit balance of a credit-metered key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditSnapshot {
    pub remaining: Option<f64>,
    pub key_usage: Option<f64>,
    pub key_limit: Option<f64>,
    pub key_remaining: Option<f64>,
    pub account_plan_usage: Option<f64>,
    pub account_plan_limit: Option<f64>,
    pub account_paygo_usage: Option<f64>,
    pub account_paygo_limit: Option<f64>,
    pub account_remaining: Option<f64>,
    pub checked_at: Option<u64>,
    pub expires_at: Option<u64>,
}

impl CreditSnapshot {
    /// Finite remaining balance, if any.
    pub fn remaining(&self) -> Option<f64> {
        self.remaining.filter(|r| r.is_finite())
    }

    /// Usable without a refresh: not expired and carrying a finite balance.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at > now) && self.remaining().is_some()
    }
}

/// Cross-process refresh lease stored on the key row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshLock {
    pub lock_id: Option<String>,
    pub lock_until: Option<u64>,
}

impl RefreshLock {
    /// Whether a new holder may take the lease at `now`.
    pub fn is_free(&self, now: u64) -> bool {
        self.lock_until.is_none_or(|until| until < now)
    }
}

/// One upstream API key row.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamKey {
    pub id: String,
    pub label: String,
    /// `nonce(12) || tag(16) || ciphertext`
    pub encrypted_secret: Vec<u8>,
    pub status: KeyStatus,
    pub cooldown_until: Option<u64>,
    pub last_used_at: Option<u64>,
    pub created_at: u64,
    pub failure_score: i64,
    pub credits: CreditSnapshot,
    pub refresh_lock: RefreshLock,
}

impl UpstreamKey {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        encrypted_secret: Vec<u8>,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            encrypted_secret,
            status: KeyStatus::Active,
            cooldown_until: None,
            last_used_at: None,
            created_at,
            failure_score: 0,
            credits: CreditSnapshot::default(),
            refresh_lock: RefreshLock::default(),
        }
    }

    /// Id truncated for log fields.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Candidate for selection at `now`: active or cooling down, with no
    /// cooldown still in force.
    pub fn is_selectable(&self, now: u64) -> bool {
        matches!(self.status, KeyStatus::Active | KeyStatus::Cooldown)
            && self.cooldown_until.is_none_or(|until| until <= now)
    }

    /// In `Cooldown` status but past `cooldown_until`.
    pub fn cooldown_expired(&self, now: u64) -> bool {
        self.status == KeyStatus::Cooldown && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// First eight characters of a key id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Partial update applied to a key row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyUpdate {
    pub status: Option<KeyStatus>,
    /// `Some(None)` clears the cooldown.
    pub cooldown_until: Option<Option<u64>>,
    pub last_used_at: Option<u64>,
    pub credits: Option<CreditSnapshot>,
}

impl KeyUpdate {
    pub fn status(status: KeyStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Put the key in cooldown until `until`.
    pub fn cooldown(until: u64) -> Self {
        Self {
            status: Some(KeyStatus::Cooldown),
            cooldown_until: Some(Some(until)),
            ..Self::default()
        }
    }

    /// Back to active with the cooldown cleared.
    pub fn reactivate() -> Self {
        Self {
            status: Some(KeyStatus::Active),
            cooldown_until: Some(None),
            ..Self::default()
        }
    }

    pub fn with_last_used(mut self, at: u64) -> Self {
        self.last_used_at = Some(at);
        self
    }

    pub fn with_credits(mut self, credits: CreditSnapshot) -> Self {
        self.credits = Some(credits);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.cooldown_until.is_none()
            && self.last_used_at.is_none()
            && self.credits.is_none()
    }

    pub(crate) fn apply(&self, key: &mut UpstreamKey) {
        if let Some(status) = self.status {
            key.status = status;
        }
        if let Some(until) = self.cooldown_until {
            key.cooldown_until = until;
        }
        if let Some(at) = self.last_used_at {
            key.last_used_at = Some(at);
        }
        if let Some(credits) = &self.credits {
            key.credits = credits.clone();
        }
    }
}
