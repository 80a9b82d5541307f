//! Key pools and rotating clients for the search gateway
//!
//! Hands out upstream API keys and fails over between them. Two pools share
//! the same key state machine but admit keys differently:
//! - `CreditPool` (Tavily): credit-aware admission against a cached, lazily
//!   refreshed balance, with a cost estimate per operation
//! - `FailurePool` (Brave): lowest failure score first
//!
//! Key lifecycle:
//! 1. Keys are created administratively as `active`
//! 2. Selection orders candidates by strategy and stamps `last_used_at`
//! 3. Low credits or upstream 429/5xx → `cooldown` (Tavily) or a failure score
//!    bump (Brave)
//! 4. Upstream 401/403 → `invalid` permanently
//! 5. A lapsed cooldown is flipped back to `active` by the next selection that
//!    reads the key; there is no background sweeper

pub mod classify;
pub mod cost;
pub mod credit_pool;
pub mod credits;
pub mod error;
pub mod failure_pool;
mod health;
pub mod rotating;
pub mod selected;
pub mod settings;
pub mod strategy;

pub use classify::{ErrorClassification, classify_error, classify_status};
pub use cost::{Operation, OperationCost, OperationParams, estimate, estimate_by_name};
pub use credit_pool::{CreditPool, Preflight};
pub use credits::{CreditPolicy, CreditRefresher, CreditSource, Refresh, TavilyUsageSource};
pub use error::{Error, Result};
pub use failure_pool::FailurePool;
pub use rotating::{RotatingBraveClient, RotatingTavilyClient};
pub use selected::SelectedKey;
pub use settings::{SearchSourceMode, ServerSettings};
pub use strategy::{SelectionStrategy, order_candidates};
