//! Pool health summaries for the health endpoint

use key_store::{KeyStatus, UpstreamKey};
use serde_json::{Value, json};

/// Summarize `keys` at `now`.
///
/// A key counts as available when it can be selected right now; a cooldown
/// that has lapsed counts as available. Status mapping: all available →
/// healthy, some available → degraded, none available → unhealthy.
/// `detail` adds pool-specific fields to each key entry.
pub(crate) fn summarize(
    keys: &[UpstreamKey],
    now: u64,
    detail: impl Fn(&UpstreamKey) -> Option<(&'static str, Value)>,
) -> Value {
    let mut entries = Vec::with_capacity(keys.len());
    let mut available = 0usize;
    let mut cooling = 0usize;
    let mut invalid = 0usize;
    let mut disabled = 0usize;

    for key in keys {
        let mut entry = json!({
            "id": key.short_id(),
            "label": key.label,
        });

        let status = match key.status {
            KeyStatus::Active => {
                available += 1;
                "active"
            }
            KeyStatus::Cooldown if key.cooldown_expired(now) => {
                available += 1;
                "active"
            }
            KeyStatus::Cooldown => {
                cooling += 1;
                let remaining_ms = key.cooldown_until.unwrap_or(now).saturating_sub(now);
                entry["cooldown_remaining_secs"] = json!(remaining_ms.div_ceil(1000));
                "cooldown"
            }
            KeyStatus::Invalid => {
                invalid += 1;
                "invalid"
            }
            KeyStatus::Disabled => {
                disabled += 1;
                "disabled"
            }
        };
        entry["status"] = json!(status);
        if let Some((name, value)) = detail(key) {
            entry[name] = value;
        }
        entries.push(entry);
    }

    let total = keys.len();
    let pool_status = if available == total && total > 0 {
        "healthy"
    } else if available > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    json!({
        "status": pool_status,
        "keys_total": total,
        "keys_available": available,
        "keys_cooling_down": cooling,
        "keys_invalid": invalid,
        "keys_disabled": disabled,
        "keys": entries
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, status: KeyStatus, cooldown_until: Option<u64>) -> UpstreamKey {
        let mut k = UpstreamKey::new(id, id, vec![], 0);
        k.status = status;
        k.cooldown_until = cooldown_until;
        k
    }

    #[test]
    fn all_available_is_healthy() {
        let keys = vec![
            key("a", KeyStatus::Active, None),
            key("b", KeyStatus::Cooldown, Some(500)),
        ];
        let h = summarize(&keys, 1_000, |_| None);
        assert_eq!(h["status"], "healthy");
        assert_eq!(h["keys_available"], 2);
        assert_eq!(h["keys"][1]["status"], "active");
    }

    #[test]
    fn some_available_is_degraded_with_remaining_secs() {
        let keys = vec![
            key("a", KeyStatus::Active, None),
            key("b", KeyStatus::Cooldown, Some(61_500)),
        ];
        let h = summarize(&keys, 1_000, |_| None);
        assert_eq!(h["status"], "degraded");
        assert_eq!(h["keys_cooling_down"], 1);
        assert_eq!(h["keys"][1]["cooldown_remaining_secs"], 61);
    }

    #[test]
    fn none_available_is_unhealthy() {
        let keys = vec![
            key("a", KeyStatus::Invalid, None),
            key("b", KeyStatus::Disabled, None),
        ];
        let h = summarize(&keys, 1_000, |_| None);
        assert_eq!(h["status"], "unhealthy");
        assert_eq!(h["keys_invalid"], 1);
        assert_eq!(h["keys_disabled"], 1);

        let h = summarize(&[], 1_000, |_| None);
        assert_eq!(h["status"], "unhealthy");
        assert_eq!(h["keys_total"], 0);
    }

    #[test]
    fn detail_is_attached() {
        let keys = vec![key("a", KeyStatus::Active, None)];
        let h = summarize(&keys, 0, |k| Some(("failure_score", json!(k.failure_score))));
        assert_eq!(h["keys"][0]["failure_score"], 0);
    }
}
