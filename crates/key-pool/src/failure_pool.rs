//! Failure-score key pool (Brave)
//!
//! Brave keys carry no credit balance. Each rate-limit or server error bumps a
//! key's failure score, and selection only considers the active keys sharing
//! the lowest score, rotating among them by recency or at random.

use std::sync::Arc;

use common::SecretCipher;
use key_store::{KeyStatus, KeyStore, KeyUpdate};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health;
use crate::selected::SelectedKey;
use crate::settings::ServerSettings;
use crate::strategy::{self, Rng};

const CANDIDATE_LIMIT: usize = 20;

/// Pool of failure-score tracked keys.
pub struct FailurePool {
    store: Arc<dyn KeyStore>,
    cipher: Arc<SecretCipher>,
    settings: Arc<ServerSettings>,
    selection: Mutex<Rng>,
}

impl FailurePool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        cipher: Arc<SecretCipher>,
        settings: Arc<ServerSettings>,
    ) -> Self {
        Self {
            store,
            cipher,
            settings,
            selection: Mutex::new(Box::new(strategy::thread_rng_unit) as Rng),
        }
    }

    /// Replace the RNG used by the `random` strategy.
    pub fn with_rng(mut self, rng: Rng) -> Self {
        self.selection = Mutex::new(rng);
        self
    }

    /// Pick one of the healthiest active keys, or `None` when there are none.
    pub async fn select_eligible_key(&self) -> Result<Option<SelectedKey>> {
        self.select_excluding(&[]).await
    }

    /// Like `select_eligible_key`, ignoring keys already tried by the caller.
    pub async fn select_excluding(&self, exclude: &[String]) -> Result<Option<SelectedKey>> {
        let mut rng = self.selection.lock().await;
        let strategy = self.settings.selection_strategy().await;

        let mut candidates = self
            .store
            .active_by_failure_score(CANDIDATE_LIMIT + exclude.len())
            .await?;
        candidates.retain(|k| !exclude.contains(&k.id));
        let Some(best) = candidates.iter().map(|k| k.failure_score).min() else {
            return Ok(None);
        };
        let healthiest: Vec<_> = candidates
            .into_iter()
            .filter(|k| k.failure_score == best)
            .collect();

        let Some(chosen) = strategy::order_candidates(healthiest, strategy, &mut **rng)
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let now = common::now_millis();
        let chosen = self
            .store
            .update(&chosen.id, KeyUpdate::default().with_last_used(now))
            .await?;
        debug!(
            key_id = chosen.short_id(),
            failure_score = chosen.failure_score,
            "selected failure-score key"
        );
        SelectedKey::open(&self.cipher, chosen).map(Some)
    }

    pub async fn mark_invalid(&self, id: &str) -> Result<()> {
        warn!(key_id = key_store::model::short_id(id), "key marked invalid");
        self.store
            .update(id, KeyUpdate::status(KeyStatus::Invalid))
            .await?;
        Ok(())
    }

    pub async fn increment_failure_score(&self, id: &str) -> Result<()> {
        info!(key_id = key_store::model::short_id(id), "failure score incremented");
        self.store.increment_failure_score(id).await?;
        Ok(())
    }

    /// Pool health summary for the health endpoint.
    pub async fn health(&self) -> Result<Value> {
        let keys = self.store.list().await?;
        Ok(health::summarize(&keys, common::now_millis(), |key| {
            Some(("failure_score", json!(key.failure_score)))
        }))
    }
}
