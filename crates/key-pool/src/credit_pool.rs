//! Credit-metered key pool (Tavily)
//!
//! Selection walks up to ten least-recently-used candidates, ensures each has
//! a credit snapshot, and admits the first whose balance covers the estimated
//! cost of the operation. Cheap operations may proceed on a key below the
//! estimate as long as it is at or above the floor ("soft-allow"); expensive
//! ones skip the key and put it in cooldown.
//!
//! Selection is serialized per pool by a fair mutex, held for the whole walk
//! including any inline refresh. That ordering is process-local; concurrent
//! processes may pick the same least-recently-used key.

use std::sync::Arc;

use common::SecretCipher;
use key_store::{KeyStore, KeyUpdate, UpstreamKey};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cost::{self, Operation, OperationParams};
use crate::credits::{CreditPolicy, CreditRefresher, CreditSource, Refresh};
use crate::error::Result;
use crate::health;
use crate::selected::SelectedKey;
use crate::settings::ServerSettings;
use crate::strategy::{self, Rng};

const CANDIDATE_LIMIT: usize = 10;
const REFRESH_FAILURE_RETRY_AFTER_MS: u64 = 10_000;

/// Admission decision ahead of a credit-metered call.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Ok,
    Blocked {
        status: u16,
        error: String,
        retry_after_ms: Option<u64>,
    },
}

impl Preflight {
    fn blocked(status: u16, error: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Preflight::Blocked {
            status,
            error: error.into(),
            retry_after_ms,
        }
    }
}

/// Pool of credit-metered keys.
pub struct CreditPool {
    store: Arc<dyn KeyStore>,
    cipher: Arc<SecretCipher>,
    refresher: CreditRefresher,
    settings: Arc<ServerSettings>,
    selection: Mutex<Rng>,
}

impl CreditPool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        cipher: Arc<SecretCipher>,
        source: Arc<dyn CreditSource>,
        policy: CreditPolicy,
        settings: Arc<ServerSettings>,
    ) -> Self {
        let refresher = CreditRefresher::new(store.clone(), cipher.clone(), source, policy);
        Self {
            store,
            cipher,
            refresher,
            settings,
            selection: Mutex::new(Box::new(strategy::thread_rng_unit) as Rng),
        }
    }

    /// Replace the RNG used by the `random` strategy.
    pub fn with_rng(mut self, rng: Rng) -> Self {
        self.selection = Mutex::new(rng);
        self
    }

    pub fn policy(&self) -> &CreditPolicy {
        self.refresher.policy()
    }

    fn required_credits(&self, operation: Option<Operation>, params: &OperationParams) -> f64 {
        match operation {
            Some(op) => cost::estimate(op, params).estimated,
            None => self.policy().min_remaining,
        }
    }

    /// Pick a key able to serve `operation`, or `None` when no key qualifies.
    pub async fn select_eligible_key(
        &self,
        operation: Option<Operation>,
        params: &OperationParams,
    ) -> Result<Option<SelectedKey>> {
        let mut rng = self.selection.lock().await;
        let strategy = self.settings.selection_strategy().await;
        let now = common::now_millis();

        let candidates = self.store.selectable_by_recency(now, CANDIDATE_LIMIT).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let required = self.required_credits(operation, params);
        let min_remaining = self.policy().min_remaining;

        for candidate in strategy::order_candidates(candidates, strategy, &mut **rng) {
            let key = match self.refresher.refresh(candidate, now, false).await? {
                Refresh::Ready(key) => key,
                Refresh::Locked | Refresh::Invalid | Refresh::Failed => continue,
            };
            let Some(remaining) = key.credits.remaining() else {
                continue;
            };

            if remaining < required {
                match operation {
                    Some(op) if op.is_expensive() => {
                        info!(
                            key_id = key.short_id(),
                            operation = %op,
                            required,
                            available = remaining,
                            "insufficient credits for expensive operation, skipping key"
                        );
                        self.mark_cooldown(&key.id, now + self.policy().cooldown_ms())
                            .await?;
                        continue;
                    }
                    Some(op) if remaining >= min_remaining => {
                        info!(
                            key_id = key.short_id(),
                            operation = %op,
                            required,
                            available = remaining,
                            "allowing cheap operation on low-credit key"
                        );
                    }
                    _ => {
                        debug!(
                            key_id = key.short_id(),
                            available = remaining,
                            "credits below floor, skipping key"
                        );
                        self.mark_cooldown(&key.id, now + self.policy().cooldown_ms())
                            .await?;
                        continue;
                    }
                }
            }

            return self.take(key, now).await.map(Some);
        }

        Ok(None)
    }

    async fn take(&self, key: UpstreamKey, now: u64) -> Result<SelectedKey> {
        let update = if key.cooldown_expired(now) {
            debug!(key_id = key.short_id(), "cooldown expired, key active again");
            KeyUpdate::reactivate().with_last_used(now)
        } else {
            KeyUpdate::default().with_last_used(now)
        };
        let chosen = self.store.update(&key.id, update).await?;
        debug!(key_id = chosen.short_id(), "selected credit-metered key");
        SelectedKey::open(&self.cipher, chosen)
    }

    /// Decide whether a call for `operation` should be attempted at all.
    pub async fn preflight_credits_check(
        &self,
        operation: Option<Operation>,
        params: &OperationParams,
    ) -> Result<Preflight> {
        let now = common::now_millis();
        let required = self.required_credits(operation, params);

        if self.store.any_with_fresh_credits(now, required).await? {
            return Ok(Preflight::Ok);
        }

        let Some(candidate) = self
            .store
            .selectable_by_recency(now, 1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(Preflight::blocked(503, "No Tavily API keys configured", None));
        };

        let refreshed = match self.refresher.refresh(candidate, now, true).await? {
            Refresh::Ready(key) => key,
            Refresh::Locked | Refresh::Invalid | Refresh::Failed => {
                return Ok(self.refresh_unavailable());
            }
        };
        let Some(remaining) = refreshed.credits.remaining() else {
            return Ok(self.refresh_unavailable());
        };

        if remaining > required {
            return Ok(Preflight::Ok);
        }

        let cooldown = Some(self.policy().cooldown_ms());
        match operation {
            Some(op) if op.is_expensive() => Ok(Preflight::blocked(
                429,
                format!(
                    "Insufficient credits for {op} operation (requires {required}, available {remaining})"
                ),
                cooldown,
            )),
            Some(op) if remaining >= self.policy().min_remaining => {
                warn!(
                    operation = %op,
                    required,
                    available = remaining,
                    "allowing cheap operation with low credits"
                );
                Ok(Preflight::Ok)
            }
            _ => Ok(Preflight::blocked(429, "Upstream quota exhausted", cooldown)),
        }
    }

    fn refresh_unavailable(&self) -> Preflight {
        Preflight::blocked(
            503,
            "Unable to refresh upstream credits",
            Some(REFRESH_FAILURE_RETRY_AFTER_MS),
        )
    }

    pub async fn mark_invalid(&self, id: &str) -> Result<()> {
        warn!(key_id = key_store::model::short_id(id), "key marked invalid");
        self.store
            .update(id, KeyUpdate::status(key_store::KeyStatus::Invalid))
            .await?;
        Ok(())
    }

    pub async fn mark_cooldown(&self, id: &str, until: u64) -> Result<()> {
        info!(
            key_id = key_store::model::short_id(id),
            cooldown_until = until,
            "key entering cooldown"
        );
        self.store.update(id, KeyUpdate::cooldown(until)).await?;
        Ok(())
    }

    /// Flip a key whose cooldown has lapsed back to active.
    pub async fn mark_active_if_cooldown_expired(&self, id: &str) -> Result<()> {
        let now = common::now_millis();
        if let Some(key) = self.store.get(id).await?
            && key.cooldown_expired(now)
        {
            self.store.update(id, KeyUpdate::reactivate()).await?;
            debug!(key_id = key.short_id(), "cooldown expired, key active again");
        }
        Ok(())
    }

    /// Pool health summary for the health endpoint.
    pub async fn health(&self) -> Result<Value> {
        let keys = self.store.list().await?;
        Ok(health::summarize(&keys, common::now_millis(), |key| {
            Some(("credits_remaining", json!(key.credits.remaining())))
        }))
    }
}
