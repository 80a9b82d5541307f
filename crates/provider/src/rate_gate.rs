//! Outbound request pacing
//!
//! Releases callers one at a time, first come first served, no faster than a
//! fixed minimum interval. Waiters queue on a fair `tokio::sync::Mutex` and hold
//! it while sleeping until their slot, which keeps release order FIFO.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{ProviderError, Result};

/// Minimum interval for a queries-per-second budget.
///
/// Non-finite or non-positive budgets fall back to one request per second.
pub fn min_interval_from_qps(qps: f64) -> Duration {
    if !qps.is_finite() || qps <= 0.0 {
        return Duration::from_millis(1000);
    }
    Duration::from_millis(((1000.0 / qps).ceil() as u64).max(1))
}

/// FIFO pacing gate shared by every client of one upstream.
#[derive(Debug)]
pub struct QueuedRateGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl QueuedRateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for this caller's turn.
    ///
    /// With `max_wait`, fails with `RateGateTimeout` when the caller cannot be
    /// released within that budget, either because the queue ahead did not
    /// drain or because its slot lies past the deadline. A timed-out caller
    /// does not consume a slot.
    pub async fn acquire(&self, max_wait: Option<Duration>) -> Result<()> {
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        let mut next_slot = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.next_slot.lock())
                .await
                .map_err(|_| ProviderError::RateGateTimeout(max_wait.unwrap_or_default()))?,
            None => self.next_slot.lock().await,
        };

        let now = Instant::now();
        let slot = match *next_slot {
            Some(at) if at > now => at,
            _ => now,
        };

        if let Some(deadline) = deadline
            && slot > deadline
        {
            debug!(
                wait_ms = (slot - now).as_millis() as u64,
                "rate gate slot beyond caller deadline"
            );
            return Err(ProviderError::RateGateTimeout(max_wait.unwrap_or_default()));
        }

        tokio::time::sleep_until(slot).await;
        *next_slot = Some(slot + self.min_interval);
        Ok(())
    }
}
