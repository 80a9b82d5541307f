//! Storage traits consumed by the key pools
//!
//! Methods return boxed futures so the pools can hold `Arc<dyn KeyStore>` and
//! swap the SQLite backend for the in-memory one in tests.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::model::{KeyUpdate, UpstreamKey};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Rows of one provider's key table.
pub trait KeyStore: Send + Sync {
    /// Insert a new row. Fails with `Duplicate` when the id exists.
    fn insert<'a>(&'a self, key: UpstreamKey) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<UpstreamKey>>>;

    /// Every row, ordered by `created_at`.
    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<UpstreamKey>>>;

    /// Up to `limit` selectable rows (active or cooldown, no cooldown in force
    /// at `now`), least recently used first with never-used rows leading, ties
    /// broken by `created_at`.
    fn selectable_by_recency<'a>(
        &'a self,
        now: u64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UpstreamKey>>>;

    /// Up to `limit` active rows ordered by `failure_score`, then
    /// `last_used_at` (never-used first), then `created_at`.
    fn active_by_failure_score<'a>(&'a self, limit: usize)
    -> BoxFuture<'a, Result<Vec<UpstreamKey>>>;

    /// Whether any selectable row holds an unexpired snapshot with
    /// `remaining > above`.
    fn any_with_fresh_credits<'a>(&'a self, now: u64, above: f64) -> BoxFuture<'a, Result<bool>>;

    /// Apply a partial update and return the updated row.
    fn update<'a>(&'a self, id: &'a str, update: KeyUpdate) -> BoxFuture<'a, Result<UpstreamKey>>;

    fn increment_failure_score<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Take the refresh lease when it is unset or expired before `now`.
    /// One conditional write; returns whether this caller now holds it.
    fn try_acquire_refresh_lock<'a>(
        &'a self,
        id: &'a str,
        lock_id: &'a str,
        now: u64,
        lock_until: u64,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Clear the lease if `lock_id` still holds it.
    fn release_refresh_lock<'a>(&'a self, id: &'a str, lock_id: &'a str)
    -> BoxFuture<'a, Result<()>>;
}

/// Server-wide key/value settings.
pub trait SettingsStore: Send + Sync {
    fn get_setting<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn put_setting<'a>(&'a self, name: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;
}
