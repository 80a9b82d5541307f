//! Wall-clock helper

/// Current unix time in milliseconds.
///
/// Persisted timestamps (cooldowns, credit expiry, refresh leases) are stored
/// in this unit so they compare across processes.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
