//! Credit cache refresh for credit-metered keys
//!
//! A key's credit snapshot is reused while fresh. Refreshing takes a leased
//! lock on the key row so that at most one process fetches `/usage` for a key
//! at a time; a caller that loses the race reuses a recent snapshot or gives up
//! on that key. The lease is released on every exit path, including when the
//! refreshing future is dropped.

use std::sync::Arc;
use std::time::Duration;

use common::{Secret, SecretCipher};
use key_store::{CreditSnapshot, KeyStatus, KeyStore, KeyUpdate, UpstreamKey};
use provider::{ProviderError, TavilyClient, UsageFetchOptions, UsageSnapshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Fetches the current credit balance for one API key.
pub trait CreditSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        api_key: Secret<String>,
    ) -> key_store::BoxFuture<'a, std::result::Result<UsageSnapshot, ProviderError>>;
}

/// `CreditSource` backed by Tavily's `/usage` endpoint.
#[derive(Debug, Clone)]
pub struct TavilyUsageSource {
    http: reqwest::Client,
    base_url: String,
    options: UsageFetchOptions,
}

impl TavilyUsageSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, options: UsageFetchOptions) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            options,
        }
    }
}

impl CreditSource for TavilyUsageSource {
    fn fetch<'a>(
        &'a self,
        api_key: Secret<String>,
    ) -> key_store::BoxFuture<'a, std::result::Result<UsageSnapshot, ProviderError>> {
        Box::pin(async move {
            let client = TavilyClient::new(
                self.http.clone(),
                self.base_url.clone(),
                api_key,
                self.options.timeout,
            );
            client.usage_with_retry(&self.options).await
        })
    }
}

/// Tuning for the credit cache.
#[derive(Debug, Clone)]
pub struct CreditPolicy {
    /// How long a fetched snapshot stays fresh.
    pub ttl: Duration,
    /// How old a snapshot may be and still be reused when another process
    /// holds the refresh lock.
    pub stale_grace: Duration,
    /// Balance at or below which a key is put in cooldown.
    pub min_remaining: f64,
    pub cooldown: Duration,
    /// Refresh lock lease.
    pub refresh_lock: Duration,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            stale_grace: Duration::from_secs(300),
            min_remaining: 1.0,
            cooldown: Duration::from_secs(300),
            refresh_lock: Duration::from_secs(15),
        }
    }
}

impl CreditPolicy {
    pub fn cooldown_ms(&self) -> u64 {
        (self.cooldown.as_millis() as u64).max(1)
    }
}

/// Result of ensuring a key has usable credits.
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh {
    /// The key row with a snapshot to judge by.
    Ready(UpstreamKey),
    /// Another holder is refreshing and no recent snapshot is usable.
    Locked,
    /// Upstream rejected the key; it has been marked invalid.
    Invalid,
    /// The fetch failed; the key may have been put in cooldown.
    Failed,
}

/// Refreshes credit snapshots under the cross-process lease.
pub struct CreditRefresher {
    store: Arc<dyn KeyStore>,
    cipher: Arc<SecretCipher>,
    source: Arc<dyn CreditSource>,
    policy: CreditPolicy,
}

impl CreditRefresher {
    pub fn new(
        store: Arc<dyn KeyStore>,
        cipher: Arc<SecretCipher>,
        source: Arc<dyn CreditSource>,
        policy: CreditPolicy,
    ) -> Self {
        Self {
            store,
            cipher,
            source,
            policy,
        }
    }

    pub fn policy(&self) -> &CreditPolicy {
        &self.policy
    }

    /// Ensure `key` has a snapshot to judge by.
    ///
    /// A fresh snapshot is reused unless `force`. Otherwise the refresh lock is
    /// taken; if another holder has it, a snapshot checked within the stale
    /// grace and above the floor is reused.
    pub async fn refresh(&self, key: UpstreamKey, now: u64, force: bool) -> Result<Refresh> {
        if !force && key.credits.is_fresh(now) {
            return Ok(Refresh::Ready(key));
        }

        let lock_id = uuid::Uuid::new_v4().to_string();
        let lease_until = now + self.policy.refresh_lock.as_millis() as u64;
        let acquired = self
            .store
            .try_acquire_refresh_lock(&key.id, &lock_id, now, lease_until)
            .await?;

        if !acquired {
            if self.has_usable_stale_snapshot(&key, now) {
                debug!(key_id = key.short_id(), "refresh locked elsewhere, reusing recent credits");
                return Ok(Refresh::Ready(key));
            }
            debug!(key_id = key.short_id(), "refresh locked elsewhere, no usable credits");
            return Ok(Refresh::Locked);
        }

        let guard = LeaseGuard {
            store: self.store.clone(),
            key_id: key.id.clone(),
            lock_id,
            armed: true,
        };
        let outcome = self.refresh_locked(&key, now).await;
        guard.release().await;
        outcome
    }

    fn has_usable_stale_snapshot(&self, key: &UpstreamKey, now: u64) -> bool {
        let grace = self.policy.stale_grace.as_millis() as u64;
        let recent = key
            .credits
            .checked_at
            .is_some_and(|checked| now.saturating_sub(checked) <= grace);
        recent
            && key
                .credits
                .remaining()
                .is_some_and(|r| r > self.policy.min_remaining)
    }

    async fn refresh_locked(&self, key: &UpstreamKey, now: u64) -> Result<Refresh> {
        let api_key = self
            .cipher
            .decrypt(&key.encrypted_secret)
            .map_err(|e| Error::Decrypt {
                key_id: key.short_id().to_string(),
                message: e.to_string(),
            })?;

        match self.source.fetch(api_key).await {
            Ok(usage) => {
                let ttl = (self.policy.ttl.as_millis() as u64).max(1);
                let credits = snapshot_from_usage(&usage, now, now + ttl);
                let mut update = KeyUpdate::default().with_credits(credits);

                let low = usage
                    .remaining
                    .is_some_and(|r| r <= self.policy.min_remaining);
                if low {
                    update.status = Some(KeyStatus::Cooldown);
                    update.cooldown_until = Some(Some(now + self.policy.cooldown_ms()));
                    info!(
                        key_id = key.short_id(),
                        remaining = usage.remaining,
                        "credits at floor, key entering cooldown"
                    );
                } else if key.cooldown_expired(now) {
                    update.status = Some(KeyStatus::Active);
                    update.cooldown_until = Some(None);
                }

                let updated = self.store.update(&key.id, update).await?;
                debug!(
                    key_id = key.short_id(),
                    remaining = updated.credits.remaining,
                    "credits refreshed"
                );
                metrics::counter!("gateway_credit_refreshes_total", "outcome" => "ok").increment(1);
                Ok(Refresh::Ready(updated))
            }
            Err(ProviderError::InvalidApiKey) => {
                warn!(key_id = key.short_id(), "credits fetch rejected key, marking invalid");
                self.store
                    .update(&key.id, KeyUpdate::status(KeyStatus::Invalid))
                    .await?;
                metrics::counter!("gateway_credit_refreshes_total", "outcome" => "invalid")
                    .increment(1);
                Ok(Refresh::Invalid)
            }
            Err(ProviderError::UsageLimitExceeded) => {
                warn!(key_id = key.short_id(), "usage limit exceeded, key entering cooldown");
                self.store
                    .update(
                        &key.id,
                        KeyUpdate::cooldown(common::now_millis() + self.policy.cooldown_ms()),
                    )
                    .await?;
                metrics::counter!("gateway_credit_refreshes_total", "outcome" => "quota")
                    .increment(1);
                Ok(Refresh::Failed)
            }
            Err(e) => {
                warn!(key_id = key.short_id(), error = %e, "credits fetch failed");
                metrics::counter!("gateway_credit_refreshes_total", "outcome" => "error")
                    .increment(1);
                Ok(Refresh::Failed)
            }
        }
    }
}

fn snapshot_from_usage(usage: &UsageSnapshot, checked_at: u64, expires_at: u64) -> CreditSnapshot {
    CreditSnapshot {
        remaining: usage.remaining,
        key_usage: usage.key_usage,
        key_limit: usage.key_limit,
        key_remaining: usage.key_remaining,
        account_plan_usage: usage.account_plan_usage,
        account_plan_limit: usage.account_plan_limit,
        account_paygo_usage: usage.account_paygo_usage,
        account_paygo_limit: usage.account_paygo_limit,
        account_remaining: usage.account_remaining,
        checked_at: Some(checked_at),
        expires_at: Some(expires_at),
    }
}

/// Releases the refresh lease. Dropped without `release` (the refreshing
/// future was cancelled), it releases from a spawned task instead.
struct LeaseGuard {
    store: Arc<dyn KeyStore>,
    key_id: String,
    lock_id: String,
    armed: bool,
}

impl LeaseGuard {
    async fn release(mut self) {
        self.armed = false;
        release_lease(&*self.store, &self.key_id, &self.lock_id).await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key_id = std::mem::take(&mut self.key_id);
        let lock_id = std::mem::take(&mut self.lock_id);
        handle.spawn(async move {
            release_lease(&*store, &key_id, &lock_id).await;
        });
    }
}

async fn release_lease(store: &dyn KeyStore, key_id: &str, lock_id: &str) {
    if let Err(e) = store.release_refresh_lock(key_id, lock_id).await {
        warn!(key_id = key_store::model::short_id(key_id), error = %e, "failed to release refresh lock");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use key_store::MemoryKeyStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted credit source for pool tests.
    pub(crate) struct FakeSource {
        pub calls: AtomicUsize,
        pub delay: Duration,
        responses: Mutex<Vec<std::result::Result<UsageSnapshot, ProviderError>>>,
        default_remaining: Option<f64>,
    }

    impl FakeSource {
        /// Always reports `remaining`.
        pub fn remaining(remaining: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                responses: Mutex::new(Vec::new()),
                default_remaining: Some(remaining),
            }
        }

        /// Replays `responses` in order, then fails.
        pub fn scripted(responses: Vec<std::result::Result<UsageSnapshot, ProviderError>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                responses: Mutex::new(responses.into_iter().rev().collect()),
                default_remaining: None,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn usage(remaining: f64) -> UsageSnapshot {
        UsageSnapshot {
            key_limit: Some(1000.0),
            key_usage: Some(1000.0 - remaining),
            key_remaining: Some(remaining),
            remaining: Some(remaining),
            ..Default::default()
        }
    }

    impl CreditSource for FakeSource {
        fn fetch<'a>(
            &'a self,
            _api_key: Secret<String>,
        ) -> key_store::BoxFuture<'a, std::result::Result<UsageSnapshot, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let scripted = self.responses.lock().unwrap().pop();
                match (scripted, self.default_remaining) {
                    (Some(response), _) => response,
                    (None, Some(remaining)) => Ok(usage(remaining)),
                    (None, None) => Err(ProviderError::Transport("script exhausted".into())),
                }
            })
        }
    }

    pub(crate) fn cipher() -> Arc<SecretCipher> {
        Arc::new(SecretCipher::new(&[7u8; 32]).unwrap())
    }

    pub(crate) fn stored_key(cipher: &SecretCipher, id: &str, created_at: u64) -> UpstreamKey {
        let encrypted = cipher.encrypt(&format!("tvly-{id}")).unwrap();
        UpstreamKey::new(id, format!("key {id}"), encrypted, created_at)
    }

    fn refresher(store: Arc<MemoryKeyStore>, source: Arc<FakeSource>) -> CreditRefresher {
        CreditRefresher::new(store, cipher(), source, CreditPolicy::default())
    }

    fn ready(outcome: Refresh) -> UpstreamKey {
        match outcome {
            Refresh::Ready(key) => key,
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_snapshot_is_reused_without_fetch() {
        let mut key = stored_key(&cipher(), "a", 1);
        key.credits.remaining = Some(40.0);
        key.credits.expires_at = Some(10_000);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::remaining(99.0));
        let r = refresher(store, source.clone());

        let out = ready(r.refresh(key, 5_000, false).await.unwrap());
        assert_eq!(out.credits.remaining, Some(40.0));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn forced_refresh_fetches_and_persists_snapshot() {
        let mut key = stored_key(&cipher(), "a", 1);
        key.credits.remaining = Some(40.0);
        key.credits.expires_at = Some(10_000);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::remaining(75.0));
        let r = refresher(store.clone(), source.clone());

        let out = ready(r.refresh(key, 5_000, true).await.unwrap());
        assert_eq!(source.calls(), 1);
        assert_eq!(out.credits.remaining, Some(75.0));
        assert_eq!(out.credits.key_limit, Some(1000.0));
        assert_eq!(out.credits.checked_at, Some(5_000));
        assert_eq!(out.credits.expires_at, Some(65_000));

        let row = store.get("a").await.unwrap().unwrap();
        assert_eq!(row.credits, out.credits);
        assert_eq!(row.refresh_lock.lock_id, None);
    }

    #[tokio::test]
    async fn balance_at_floor_puts_key_in_cooldown() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let r = refresher(store.clone(), Arc::new(FakeSource::remaining(1.0)));

        let out = ready(r.refresh(key, 1_000, false).await.unwrap());
        assert_eq!(out.status, KeyStatus::Cooldown);
        assert_eq!(out.cooldown_until, Some(301_000));
    }

    #[tokio::test]
    async fn successful_refresh_reactivates_expired_cooldown() {
        let mut key = stored_key(&cipher(), "a", 1);
        key.status = KeyStatus::Cooldown;
        key.cooldown_until = Some(500);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let r = refresher(store.clone(), Arc::new(FakeSource::remaining(30.0)));

        let out = ready(r.refresh(key, 1_000, false).await.unwrap());
        assert_eq!(out.status, KeyStatus::Active);
        assert_eq!(out.cooldown_until, None);
    }

    #[tokio::test]
    async fn invalid_key_is_marked_invalid() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::scripted(vec![Err(ProviderError::InvalidApiKey)]));
        let r = refresher(store.clone(), source);

        assert_eq!(r.refresh(key, 1_000, false).await.unwrap(), Refresh::Invalid);
        let row = store.get("a").await.unwrap().unwrap();
        assert_eq!(row.status, KeyStatus::Invalid);
        assert_eq!(row.refresh_lock.lock_id, None);
    }

    #[tokio::test]
    async fn usage_limit_puts_key_in_cooldown() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::scripted(vec![Err(
            ProviderError::UsageLimitExceeded,
        )]));
        let r = refresher(store.clone(), source);

        assert_eq!(r.refresh(key, 1_000, false).await.unwrap(), Refresh::Failed);
        let row = store.get("a").await.unwrap().unwrap();
        assert_eq!(row.status, KeyStatus::Cooldown);
        assert!(row.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn transport_failure_leaves_key_untouched() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::scripted(vec![Err(ProviderError::Timeout(
            Duration::from_secs(5),
        ))]));
        let r = refresher(store.clone(), source);

        assert_eq!(r.refresh(key.clone(), 1_000, false).await.unwrap(), Refresh::Failed);
        assert_eq!(store.get("a").await.unwrap().unwrap(), key);
    }

    #[tokio::test]
    async fn lock_held_elsewhere_reuses_recent_snapshot_above_floor() {
        let mut key = stored_key(&cipher(), "a", 1);
        key.credits.remaining = Some(20.0);
        key.credits.checked_at = Some(1_000);
        key.credits.expires_at = Some(2_000);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        assert!(
            store
                .try_acquire_refresh_lock("a", "other", 1_000, 1_000_000)
                .await
                .unwrap()
        );
        let source = Arc::new(FakeSource::remaining(99.0));
        let r = refresher(store.clone(), source.clone());

        // Expired but within the stale grace.
        let out = ready(r.refresh(key.clone(), 60_000, false).await.unwrap());
        assert_eq!(out.credits.remaining, Some(20.0));

        // Past the stale grace.
        assert_eq!(r.refresh(key.clone(), 400_000, false).await.unwrap(), Refresh::Locked);

        // At the floor.
        key.credits.remaining = Some(1.0);
        assert_eq!(r.refresh(key, 60_000, false).await.unwrap(), Refresh::Locked);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_fetch_once() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::remaining(50.0).with_delay(Duration::from_millis(50)));
        let r = Arc::new(refresher(store.clone(), source.clone()));

        let (first, second) = tokio::join!(
            r.refresh(key.clone(), 1_000, false),
            r.refresh(key.clone(), 1_000, false)
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(source.calls(), 1);
        assert_eq!(
            outcomes.iter().filter(|o| matches!(o, Refresh::Ready(_))).count(),
            1
        );
        assert!(outcomes.contains(&Refresh::Locked));
        assert_eq!(store.get("a").await.unwrap().unwrap().refresh_lock.lock_id, None);
    }

    #[tokio::test]
    async fn cancelled_refresh_still_releases_lease() {
        let key = stored_key(&cipher(), "a", 1);
        let store = Arc::new(MemoryKeyStore::with_keys(vec![key.clone()]));
        let source = Arc::new(FakeSource::remaining(50.0).with_delay(Duration::from_secs(60)));
        let r = refresher(store.clone(), source);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), r.refresh(key, 1_000, false)).await;
        assert!(cancelled.is_err());

        // The release runs on a spawned task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let row = store.get("a").await.unwrap().unwrap();
        assert_eq!(row.refresh_lock.lock_id, None);
    }
}
