//! Per-client fixed-window rate limiting
//!
//! Each client identity gets `max_requests` calls per window. A window opens on
//! the first call after the previous one ended; calls past the limit are told
//! how long until it resets. State is process-local.

use std::collections::HashMap;
use std::sync::Mutex;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Ok,
    Limited { retry_after_ms: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: u64,
}

/// Fixed-window counter keyed by client identity.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window_ms: u64,
    windows: Mutex<HashMap<String, Window>>,
}

/// Prune expired windows once the map grows past this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a call by `key` at `now` (ms).
    pub fn check(&self, key: &str, now: u64) -> RateLimitDecision {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, w| w.reset_at > now);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + self.window_ms,
        });
        if now >= window.reset_at {
            *window = Window {
                count: 0,
                reset_at: now + self.window_ms,
            };
        }

        if window.count >= self.max_requests {
            return RateLimitDecision::Limited {
                retry_after_ms: window.reset_at - now,
            };
        }
        window.count += 1;
        RateLimitDecision::Ok
    }
}
