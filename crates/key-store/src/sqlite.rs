//! SQLite backend via sqlx
//!
//! Tavily and Brave keys live in separate tables with the same shape. The
//! credit columns are only written for Tavily rows. Millisecond timestamps are
//! stored as INTEGER.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{CreditSnapshot, KeyStatus, KeyUpdate, ProviderKind, RefreshLock, UpstreamKey};
use crate::store::{BoxFuture, KeyStore, SettingsStore};

const KEY_COLUMNS: &str = "id, label, key_encrypted, status, cooldown_until, last_used_at, \
    created_at, failure_score, credits_remaining, credits_key_usage, credits_key_limit, \
    credits_key_remaining, credits_account_plan_usage, credits_account_plan_limit, \
    credits_account_paygo_usage, credits_account_paygo_limit, credits_account_remaining, \
    credits_checked_at, credits_expires_at, credits_refresh_lock_id, credits_refresh_lock_until";

/// Shared connection pool plus schema setup.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `url` (e.g. `sqlite:search-gateway.db?mode=rwc`), creating
    /// the file and tables when missing.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        info!(url, "database ready");
        Ok(db)
    }

    pub fn key_store(&self, kind: ProviderKind) -> SqliteKeyStore {
        SqliteKeyStore {
            pool: self.pool.clone(),
            kind,
        }
    }

    pub fn settings_store(&self) -> SqliteSettingsStore {
        SqliteSettingsStore {
            pool: self.pool.clone(),
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        for kind in [ProviderKind::Tavily, ProviderKind::Brave] {
            let table = kind.table();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    label TEXT NOT NULL,
                    key_encrypted BLOB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    cooldown_until INTEGER,
                    last_used_at INTEGER,
                    created_at INTEGER NOT NULL,
                    failure_score INTEGER NOT NULL DEFAULT 0,
                    credits_remaining REAL,
                    credits_key_usage REAL,
                    credits_key_limit REAL,
                    credits_key_remaining REAL,
                    credits_account_plan_usage REAL,
                    credits_account_plan_limit REAL,
                    credits_account_paygo_usage REAL,
                    credits_account_paygo_limit REAL,
                    credits_account_remaining REAL,
                    credits_checked_at INTEGER,
                    credits_expires_at INTEGER,
                    credits_refresh_lock_id TEXT,
                    credits_refresh_lock_until INTEGER
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_selection \
                 ON {table} (status, last_used_at, created_at)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("migrations applied");
        Ok(())
    }
}

/// Saturating conversion for INTEGER columns.
fn to_db(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_db(ms: Option<i64>) -> Option<u64> {
    ms.map(|v| v.max(0) as u64)
}

fn key_from_row(row: &SqliteRow) -> Result<UpstreamKey> {
    let id: String = row.try_get("id")?;
    let status_raw: String = row.try_get("status")?;
    let status = KeyStatus::parse(&status_raw)
        .ok_or_else(|| Error::Corrupt(format!("key {id}: unknown status {status_raw:?}")))?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(UpstreamKey {
        label: row.try_get("label")?,
        encrypted_secret: row.try_get("key_encrypted")?,
        status,
        cooldown_until: from_db(row.try_get("cooldown_until")?),
        last_used_at: from_db(row.try_get("last_used_at")?),
        created_at: created_at.max(0) as u64,
        failure_score: row.try_get("failure_score")?,
        credits: CreditSnapshot {
            remaining: row.try_get("credits_remaining")?,
            key_usage: row.try_get("credits_key_usage")?,
            key_limit: row.try_get("credits_key_limit")?,
            key_remaining: row.try_get("credits_key_remaining")?,
            account_plan_usage: row.try_get("credits_account_plan_usage")?,
            account_plan_limit: row.try_get("credits_account_plan_limit")?,
            account_paygo_usage: row.try_get("credits_account_paygo_usage")?,
            account_paygo_limit: row.try_get("credits_account_paygo_limit")?,
            account_remaining: row.try_get("credits_account_remaining")?,
            checked_at: from_db(row.try_get("credits_checked_at")?),
            expires_at: from_db(row.try_get("credits_expires_at")?),
        },
        refresh_lock: RefreshLock {
            lock_id: row.try_get("credits_refresh_lock_id")?,
            lock_until: from_db(row.try_get("credits_refresh_lock_until")?),
        },
        id,
    })
}

/// Key table for one provider.
#[derive(Debug, Clone)]
pub struct SqliteKeyStore {
    pool: SqlitePool,
    kind: ProviderKind,
}

impl SqliteKeyStore {
    async fn fetch_one(&self, id: &str) -> Result<Option<UpstreamKey>> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM {} WHERE id = ?", self.kind.table());
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(key_from_row).transpose()
    }

    async fn fetch_many(&self, sql: &str, binds: &[i64]) -> Result<Vec<UpstreamKey>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(key_from_row).collect()
    }
}

impl KeyStore for SqliteKeyStore {
    fn insert<'a>(&'a self, key: UpstreamKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {} ({KEY_COLUMNS}) VALUES \
                 (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                self.kind.table()
            );
            let credits = &key.credits;
            let result = sqlx::query(&sql)
                .bind(&key.id)
                .bind(&key.label)
                .bind(&key.encrypted_secret)
                .bind(key.status.as_str())
                .bind(key.cooldown_until.map(to_db))
                .bind(key.last_used_at.map(to_db))
                .bind(to_db(key.created_at))
                .bind(key.failure_score)
                .bind(credits.remaining)
                .bind(credits.key_usage)
                .bind(credits.key_limit)
                .bind(credits.key_remaining)
                .bind(credits.account_plan_usage)
                .bind(credits.account_plan_limit)
                .bind(credits.account_paygo_usage)
                .bind(credits.account_paygo_limit)
                .bind(credits.account_remaining)
                .bind(credits.checked_at.map(to_db))
                .bind(credits.expires_at.map(to_db))
                .bind(key.refresh_lock.lock_id.as_deref())
                .bind(key.refresh_lock.lock_until.map(to_db))
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => {
                    debug!(provider = self.kind.as_str(), key_id = key.short_id(), "inserted key");
                    Ok(())
                }
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    Err(Error::Duplicate(key.id))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<UpstreamKey>>> {
        Box::pin(self.fetch_one(id))
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {KEY_COLUMNS} FROM {} ORDER BY created_at ASC",
                self.kind.table()
            );
            self.fetch_many(&sql, &[]).await
        })
    }

    fn selectable_by_recency<'a>(
        &'a self,
        now: u64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            // SQLite sorts NULL before any value in ascending order.
            let sql = format!(
                "SELECT {KEY_COLUMNS} FROM {} \
                 WHERE status IN ('active', 'cooldown') \
                   AND (cooldown_until IS NULL OR cooldown_until <= ?) \
                 ORDER BY last_used_at ASC, created_at ASC \
                 LIMIT ?",
                self.kind.table()
            );
            self.fetch_many(&sql, &[to_db(now), limit as i64]).await
        })
    }

    fn active_by_failure_score<'a>(
        &'a self,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<UpstreamKey>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {KEY_COLUMNS} FROM {} \
                 WHERE status = 'active' \
                 ORDER BY failure_score ASC, last_used_at ASC, created_at ASC \
                 LIMIT ?",
                self.kind.table()
            );
            self.fetch_many(&sql, &[limit as i64]).await
        })
    }

    fn any_with_fresh_credits<'a>(&'a self, now: u64, above: f64) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT 1 FROM {} \
                 WHERE status IN ('active', 'cooldown') \
                   AND (cooldown_until IS NULL OR cooldown_until <= ?) \
                   AND credits_expires_at > ? \
                   AND credits_remaining > ? \
                 LIMIT 1",
                self.kind.table()
            );
            let row = sqlx::query(&sql)
                .bind(to_db(now))
                .bind(to_db(now))
                .bind(above)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.is_some())
        })
    }

    fn update<'a>(&'a self, id: &'a str, update: KeyUpdate) -> BoxFuture<'a, Result<UpstreamKey>> {
        Box::pin(async move {
            if !update.is_empty() {
                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("UPDATE {} SET ", self.kind.table()));
                {
                    let mut set = qb.separated(", ");
                    if let Some(status) = update.status {
                        set.push("status = ").push_bind_unseparated(status.as_str());
                    }
                    if let Some(until) = update.cooldown_until {
                        set.push("cooldown_until = ")
                            .push_bind_unseparated(until.map(to_db));
                    }
                    if let Some(at) = update.last_used_at {
                        set.push("last_used_at = ").push_bind_unseparated(to_db(at));
                    }
                    if let Some(c) = update.credits {
                        set.push("credits_remaining = ").push_bind_unseparated(c.remaining);
                        set.push("credits_key_usage = ").push_bind_unseparated(c.key_usage);
                        set.push("credits_key_limit = ").push_bind_unseparated(c.key_limit);
                        set.push("credits_key_remaining = ")
                            .push_bind_unseparated(c.key_remaining);
                        set.push("credits_account_plan_usage = ")
                            .push_bind_unseparated(c.account_plan_usage);
                        set.push("credits_account_plan_limit = ")
                            .push_bind_unseparated(c.account_plan_limit);
                        set.push("credits_account_paygo_usage = ")
                            .push_bind_unseparated(c.account_paygo_usage);
                        set.push("credits_account_paygo_limit = ")
                            .push_bind_unseparated(c.account_paygo_limit);
                        set.push("credits_account_remaining = ")
                            .push_bind_unseparated(c.account_remaining);
                        set.push("credits_checked_at = ")
                            .push_bind_unseparated(c.checked_at.map(to_db));
                        set.push("credits_expires_at = ")
                            .push_bind_unseparated(c.expires_at.map(to_db));
                    }
                }
                qb.push(" WHERE id = ").push_bind(id);

                let result = qb.build().execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    return Err(Error::NotFound(id.to_string()));
                }
            }

            self.fetch_one(id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))
        })
    }

    fn increment_failure_score<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET failure_score = failure_score + 1 WHERE id = ?",
                self.kind.table()
            );
            let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(id.to_string()));
            }
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
            let sql = format!(
                "UPDATE {} \
                 SET credits_refresh_lock_id = ?, credits_refresh_lock_until = ? \
                 WHERE id = ? \
                   AND (credits_refresh_lock_until IS NULL OR credits_refresh_lock_until < ?)",
                self.kind.table()
            );
            let result = sqlx::query(&sql)
                .bind(lock_id)
                .bind(to_db(lock_until))
                .bind(id)
                .bind(to_db(now))
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn release_refresh_lock<'a>(
        &'a self,
        id: &'a str,
        lock_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} \
                 SET credits_refresh_lock_id = NULL, credits_refresh_lock_until = NULL \
                 WHERE id = ? AND credits_refresh_lock_id = ?",
                self.kind.table()
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(lock_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}

/// `server_settings` key/value table.
#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SettingsStore for SqliteSettingsStore {
    fn get_setting<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT value FROM server_settings WHERE key = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| r.try_get::<String, _>("value"))
                .transpose()
                .map_err(Error::from)
        })
    }

    fn put_setting<'a>(&'a self, name: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = to_db(common::now_millis());
            sqlx::query(
                r#"
                INSERT INTO server_settings (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(name)
            .bind(value)
            .bind(now)
            .execute(&self.pool)
            .await?;
            debug!(setting = name, value, "stored server setting");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("keys.db").display());
        let db = Database::open(&url, 4).await.unwrap();
        (dir, db)
    }

    fn key(id: &str, created_at: u64) -> UpstreamKey {
        UpstreamKey::new(id, format!("label-{id}"), vec![7; 40], created_at)
    }

    #[tokio::test]
    async fn insert_get_and_list_round_trip() {
        let (_dir, db) = open_temp().await;
        let store = db.key_store(ProviderKind::Tavily);

        let mut k = key("k1", 10);
        k.credits.remaining = Some(12.5);
        k.credits.expires_at = Some(99);
        store.insert(k.clone()).await.unwrap();
        store.insert(key("k0", 5)).await.unwrap();

        assert_eq!(store.get("k1").await.unwrap(), Some(k));
        assert_eq!(store.get("nope").await.unwrap(), None);

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|k| k.id).collect();
        assert_eq!(ids, vec!["k0", "k1"]);

        assert!(matches!(
            store.insert(key("k1", 11)).await,
            Err(Error::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn provider_tables_are_separate() {
        let (_dir, db) = open_temp().await;
        db.key_store(ProviderKind::Tavily)
            .insert(key("shared-id", 1))
            .await
            .unwrap();
        assert!(
            db.key_store(ProviderKind::Brave)
                .get("shared-id")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn selection_queries_match_memory_semantics() {
        let (_dir, db) = open_temp().await;
        let store = db.key_store(ProviderKind::Tavily);

        let mut used = key("used", 1);
        used.last_used_at = Some(100);
        let mut cooling = key("cooling", 2);
        cooling.status = KeyStatus::Cooldown;
        cooling.cooldown_until = Some(5_000);
        let mut expired = key("expired", 3);
        expired.status = KeyStatus::Cooldown;
        expired.cooldown_until = Some(500);
        let mut invalid = key("invalid", 4);
        invalid.status = KeyStatus::Invalid;
        let fresh = key("fresh", 5);
        for k in [used, cooling, expired, invalid, fresh] {
            store.insert(k).await.unwrap();
        }

        let ids: Vec<String> = store
            .selectable_by_recency(1_000, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.id)
            .collect();
        assert_eq!(ids, vec!["expired", "fresh", "used"]);

        store.increment_failure_score("fresh").await.unwrap();
        let ids: Vec<String> = store
            .active_by_failure_score(20)
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.id)
            .collect();
        assert_eq!(ids, vec!["used", "fresh"]);
    }

    #[tokio::test]
    async fn update_writes_only_given_columns() {
        let (_dir, db) = open_temp().await;
        let store = db.key_store(ProviderKind::Tavily);
        let mut k = key("k", 1);
        k.last_used_at = Some(3);
        store.insert(k).await.unwrap();

        let credits = CreditSnapshot {
            remaining: Some(40.0),
            key_limit: Some(100.0),
            key_usage: Some(60.0),
            key_remaining: Some(40.0),
            checked_at: Some(1_000),
            expires_at: Some(61_000),
            ..Default::default()
        };
        let row = store
            .update("k", KeyUpdate::cooldown(9_000).with_credits(credits.clone()))
            .await
            .unwrap();
        assert_eq!(row.status, KeyStatus::Cooldown);
        assert_eq!(row.cooldown_until, Some(9_000));
        assert_eq!(row.last_used_at, Some(3));
        assert_eq!(row.credits, credits);

        assert!(!store.any_with_fresh_credits(2_000, 1.0).await.unwrap());
        let row = store.update("k", KeyUpdate::reactivate()).await.unwrap();
        assert_eq!(row.cooldown_until, None);
        assert!(store.any_with_fresh_credits(2_000, 1.0).await.unwrap());
        assert!(!store.any_with_fresh_credits(61_000, 1.0).await.unwrap());

        assert!(matches!(
            store.update("missing", KeyUpdate::reactivate()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn refresh_lock_is_a_conditional_write() {
        let (_dir, db) = open_temp().await;
        let store = db.key_store(ProviderKind::Tavily);
        store.insert(key("k", 1)).await.unwrap();

        assert!(store.try_acquire_refresh_lock("k", "L1", 100, 200).await.unwrap());
        assert!(!store.try_acquire_refresh_lock("k", "L2", 150, 300).await.unwrap());

        store.release_refresh_lock("k", "L2").await.unwrap();
        assert!(!store.try_acquire_refresh_lock("k", "L2", 150, 300).await.unwrap());

        assert!(store.try_acquire_refresh_lock("k", "L2", 201, 300).await.unwrap());
        store.release_refresh_lock("k", "L2").await.unwrap();
        let row = store.get("k").await.unwrap().unwrap();
        assert_eq!(row.refresh_lock, RefreshLock::default());

        assert!(!store.try_acquire_refresh_lock("missing", "L", 0, 1).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_lock_attempts_across_connections_have_one_winner() {
        let (_dir, db) = open_temp().await;
        let store = Arc::new(db.key_store(ProviderKind::Tavily));
        store.insert(key("k", 1)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let lock_id = format!("L{i}");
                store
                    .try_acquire_refresh_lock("k", &lock_id, 100, 10_000)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn settings_upsert() {
        let (_dir, db) = open_temp().await;
        let settings = db.settings_store();
        assert_eq!(settings.get_setting("mode").await.unwrap(), None);
        settings.put_setting("mode", "combined").await.unwrap();
        settings.put_setting("mode", "brave_only").await.unwrap();
        assert_eq!(
            settings.get_setting("mode").await.unwrap().as_deref(),
            Some("brave_only")
        );
    }

    #[tokio::test]
    async fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("keys.db").display());
        {
            let db = Database::open(&url, 1).await.unwrap();
            db.key_store(ProviderKind::Brave)
                .insert(key("b", 1))
                .await
                .unwrap();
        }
        let db = Database::open(&url, 1).await.unwrap();
        assert!(db.key_store(ProviderKind::Brave).get("b").await.unwrap().is_some());
    }
}
