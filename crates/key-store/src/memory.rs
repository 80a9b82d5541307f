//! In-process store backends
//!
//! A tokio Mutex guards the rows; every trait method runs under one lock
//! acquisition, so the refresh-lock check-and-set is atomic within the process.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{KeyStatus, KeyUpdate, UpstreamKey};
use crate::store::{BoxFuture, KeyStore, SettingsStore};

/// Key rows held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    rows: Mutex<Vec<UpstreamKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `keys`.
    pub fn with_keys(keys: Vec<UpstreamKey>) -> Self {
        Self {
            rows: Mutex::new(keys),
        }
    }
}

fn recency_order(a: &UpstreamKey, b: &UpstreamKey) -> std::cmp::Ordering {
    // Option orders None before Some, so never-used keys lead.
    (a.last_used_at, a.created_at).cmp(&(b.last_used_at, b.created_at))
}

impl KeyStore for MemoryKeyStore {
    fn insert<'a>(&'a self, key: UpstreamKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            if rows.iter().any(|row| row.id == key.id) {
                return Err(Error::Duplicate(key.id));
            }
            debug!(key_id = key.short_id(), "inserted key");
            rows.push(key);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<UpstreamKey>>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            Ok(rows.iter().find(|row| row.id == id).cloned())
        })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await.clone();
            rows.sort_by_key(|row| row.created_at);
            Ok(rows)
        })
    }

    fn selectable_by_recency<'a>(
        &'a self,
        now: u64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            let mut out: Vec<UpstreamKey> = rows
                .iter()
                .filter(|row| row.is_selectable(now))
                .cloned()
                .collect();
            out.sort_by(recency_order);
            out.truncate(limit);
            Ok(out)
        })
    }

    fn active_by_failure_score<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            let mut out: Vec<UpstreamKey> = rows
                .iter()
                .filter(|row| row.status == KeyStatus::Active)
                .cloned()
                .collect();
            out.sort_by(|a, b| {
                a.failure_score
                    .cmp(&b.failure_score)
                    .then_with(|| recency_order(a, b))
            });
            out.truncate(limit);
            Ok(out)
        })
    }

    fn any_with_fresh_credits<'a>(&'a self, now: u64, above: f64) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let rows = self.rows.lock().await;
            Ok(rows.iter().any(|row| {
                row.is_selectable(now)
                    && row.credits.expires_at.is_some_and(|at| at > now)
                    && row.credits.remaining().is_some_and(|r| r > above)
            }))
        })
    }

    fn update<'a>(&'a self, id: &'a str, update: KeyUpdate) -> BoxFuture<'a, Result<UpstreamKey>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            let row = rows
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            update.apply(row);
            Ok(row.clone())
        })
    }

    fn increment_failure_score<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            let row = rows
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            row.failure_score += 1;
            Ok(())
        })
    }

    fn try_acquire_refresh_lock<'a>(
        &'a self,
        id: &'a str,
        lock_id: &'a str,
        now: u64,
        lock_until: u64,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
                return Ok(false);
            };
            if !row.refresh_lock.is_free(now) {
                return Ok(false);
            }
            row.refresh_lock.lock_id = Some(lock_id.to_string());
            row.refresh_lock.lock_until = Some(lock_until);
            Ok(true)
        })
    }

    fn release_refresh_lock<'a>(
        &'a self,
        id: &'a str,
        lock_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await;
            if let Some(row) = rows.iter_mut().find(|row| row.id == id)
                && row.refresh_lock.lock_id.as_deref() == Some(lock_id)
            {
                row.refresh_lock.lock_id = None;
                row.refresh_lock.lock_until = None;
            }
            Ok(())
        })
    }
}

/// Settings held in memory.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get_setting<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.values.lock().await.get(name).cloned()) })
    }

    fn put_setting<'a>(&'a self, name: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.values
                .lock()
                .await
                .insert(name.to_string(), value.to_string());
            Ok(())
        })
    }
}
