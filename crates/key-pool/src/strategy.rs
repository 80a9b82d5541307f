//! Candidate ordering for key selection

use std::fmt;

use rand::RngExt;

/// How the pools order the candidates they load from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Keep the store order (least recently used first).
    #[default]
    RoundRobin,
    /// Shuffle the candidates.
    Random,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Random => "random",
        }
    }

    /// Parse a stored or configured value, falling back on anything
    /// unrecognized. Matching is case-insensitive and ignores surrounding
    /// whitespace.
    pub fn parse_or(raw: Option<&str>, fallback: SelectionStrategy) -> SelectionStrategy {
        let Some(raw) = raw else {
            return fallback;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "random" => SelectionStrategy::Random,
            "round_robin" | "round-robin" | "rr" => SelectionStrategy::RoundRobin,
            _ => fallback,
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of uniform `[0, 1)` samples for the `Random` strategy.
pub type Rng = Box<dyn FnMut() -> f64 + Send>;

/// Order `keys` per `strategy`.
///
/// `Random` is a Fisher–Yates shuffle driven by `rng`, which must yield values
/// in `[0, 1)`. With a fixed sequence the result is reproducible.
pub fn order_candidates<T>(
    mut keys: Vec<T>,
    strategy: SelectionStrategy,
    rng: &mut dyn FnMut() -> f64,
) -> Vec<T> {
    if strategy == SelectionStrategy::RoundRobin {
        return keys;
    }

    for i in (1..keys.len()).rev() {
        let r = rng().clamp(0.0, 1.0);
        let j = ((r * (i + 1) as f64).floor() as usize).min(i);
        if j != i {
            keys.swap(i, j);
        }
    }
    keys
}

/// Uniform `[0, 1)` sample from the thread RNG.
pub fn thread_rng_unit() -> f64 {
    rand::rng().random::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycling_rng(seq: Vec<f64>) -> impl FnMut() -> f64 {
        let mut i = 0;
        move || {
            let v = seq[i % seq.len()];
            i += 1;
            v
        }
    }

    #[test]
    fn parse_falls_back_on_missing_or_unknown() {
        let fb = SelectionStrategy::RoundRobin;
        assert_eq!(SelectionStrategy::parse_or(None, fb), fb);
        assert_eq!(SelectionStrategy::parse_or(Some(""), fb), fb);
        assert_eq!(SelectionStrategy::parse_or(Some("  "), fb), fb);
        assert_eq!(SelectionStrategy::parse_or(Some("weighted"), fb), fb);
        assert_eq!(
            SelectionStrategy::parse_or(Some("bogus"), SelectionStrategy::Random),
            SelectionStrategy::Random
        );
    }

    #[test]
    fn parse_accepts_aliases() {
        let fb = SelectionStrategy::Random;
        assert_eq!(
            SelectionStrategy::parse_or(Some("ROUND_ROBIN"), fb),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            SelectionStrategy::parse_or(Some(" round-robin "), fb),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            SelectionStrategy::parse_or(Some("rr"), fb),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            SelectionStrategy::parse_or(Some("Random"), SelectionStrategy::RoundRobin),
            SelectionStrategy::Random
        );
    }

    #[test]
    fn round_robin_never_reorders() {
        let mut rng = || -> f64 { panic!("round robin must not draw") };
        let out = order_candidates(vec![1, 2, 3], SelectionStrategy::RoundRobin, &mut rng);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn random_with_fixed_rng_is_reproducible() {
        let mut zeros = || 0.0;
        let out = order_candidates(vec![1, 2, 3, 4], SelectionStrategy::Random, &mut zeros);
        assert_eq!(out, vec![2, 3, 4, 1]);

        let run = || {
            let mut rng = cycling_rng(vec![0.9, 0.1, 0.5]);
            order_candidates(vec!['a', 'b', 'c', 'd'], SelectionStrategy::Random, &mut rng)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn random_tolerates_out_of_range_rng() {
        let mut ones = || 1.0;
        let out = order_candidates(vec![1, 2, 3], SelectionStrategy::Random, &mut ones);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn thread_rng_unit_in_range() {
        for _ in 0..100 {
            let v = thread_rng_unit();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
