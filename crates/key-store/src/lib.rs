//! Persistence for upstream provider keys and server settings
//!
//! Rows are owned by the key pools: the pools are the only writers of status,
//! cooldown, usage and credit fields. Administrative creation/removal happens
//! outside the gateway core (`insert` exists for seeding and tests).
//!
//! Two backends implement the same traits:
//! - `MemoryKeyStore` / `MemorySettingsStore`: process-local, used in tests and
//!   for running without a database
//! - `SqliteKeyStore` / `SqliteSettingsStore`: `sqlx` over SQLite; the credit
//!   refresh lock is a conditional `UPDATE`, so it holds across processes that
//!   share the database

pub mod error;
pub mod memory;
pub mod model;
pub mod sqlite;
pub mod store;

pub use error::{Error, Result};
pub use memory::{MemoryKeyStore, MemorySettingsStore};
pub use model::{CreditSnapshot, KeyStatus, KeyUpdate, ProviderKind, RefreshLock, UpstreamKey};
pub use sqlite::{Database, SqliteKeyStore, SqliteSettingsStore};
pub use store::{BoxFuture, KeyStore, SettingsStore};
