//! Weighted treatment selection
//!
//! A [`Weighting`] is an insertion-ordered set of treatment names with relative
//! integer weights. Draws walk the entries in that order, so a seeded random
//! source always yields the same sequence of treatments.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised when a weighting cannot be sampled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WeightingError {
    #[error("weighting has no treatments")]
    Empty,

    #[error("all treatment weights are zero")]
    ZeroTotal,

    #[error("treatment '{0}' is not part of the weighting")]
    UnknownTreatment(String),
}

/// Ordered mapping of treatment name to relative weight
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weighting {
    entries: Vec<(String, u32)>,
}

impl Weighting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs; a repeated name keeps its first position and last weight
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut weighting = Self::new();
        for (name, weight) in pairs {
            weighting.insert(name, weight);
        }
        weighting
    }

    pub fn with(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.insert(name, weight);
        self
    }

    /// Insert or update a treatment weight, returning the previous weight
    pub fn insert(&mut self, name: impl Into<String>, weight: u32) -> Option<u32> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, w)) => Some(std::mem::replace(w, weight)),
            None => {
                self.entries.push((name, weight));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, w)| *w)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First treatment in insertion order
    pub fn first(&self) -> Option<&str> {
        self.entries.first().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(n, w)| (n.as_str(), *w))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Sum of all weights
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, w)| u64::from(*w)).sum()
    }

    /// Append entries of `other` that are not already present
    pub fn extend_missing(&mut self, other: &Weighting) {
        for (name, weight) in other.iter() {
            if !self.contains(name) {
                self.entries.push((name.to_string(), weight));
            }
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(n, w)| format!("{n}={w}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Draw a treatment name with probability proportional to its weight
///
/// Picks `r` uniformly in `[0, total)` and returns the first entry whose
/// running sum exceeds `r`.
pub fn choose_weighted<R: Rng + ?Sized>(
    weighting: &Weighting,
    rng: &mut R,
) -> Result<String, WeightingError> {
    if weighting.is_empty() {
        return Err(WeightingError::Empty);
    }
    let max = weighting.total();
    if max == 0 {
        return Err(WeightingError::ZeroTotal);
    }

    let r = rng.gen_range(0..max);
    let mut cumulative = 0u64;
    for (name, weight) in weighting.iter() {
        cumulative += u64::from(weight);
        if cumulative > r {
            return Ok(name.to_string());
        }
    }

    // r < max == final cumulative, so the loop always returns
    Err(WeightingError::ZeroTotal)
}

/// Pluggable treatment selection policy attached to an experiment
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Short identifier stored with experiment metadata
    fn name(&self) -> &'static str;

    fn select(
        &self,
        weighting: &Weighting,
        rng: &mut dyn RngCore,
    ) -> Result<String, WeightingError>;
}

/// Default policy: weighted random draw
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedRandom;

impl SelectionStrategy for WeightedRandom {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    fn select(
        &self,
        weighting: &Weighting,
        rng: &mut dyn RngCore,
    ) -> Result<String, WeightingError> {
        choose_weighted(weighting, rng)
    }
}

/// Always assigns one named treatment (QA overrides, rollbacks)
#[derive(Debug, Clone)]
pub struct FixedTreatment(pub String);

impl SelectionStrategy for FixedTreatment {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn select(
        &self,
        weighting: &Weighting,
        _rng: &mut dyn RngCore,
    ) -> Result<String, WeightingError> {
        if weighting.contains(&self.0) {
            Ok(self.0.clone())
        } else {
            Err(WeightingError::UnknownTreatment(self.0.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn even() -> Weighting {
        Weighting::new().with("default", 50).with("alternate", 50)
    }

    #[test]
    fn test_insert_keeps_position() {
        let mut w = Weighting::from_pairs([("a", 1), ("b", 2)]);
        assert_eq!(w.insert("a", 7), Some(1));
        assert_eq!(w.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(w.get("a"), Some(7));
        assert_eq!(w.total(), 9);
    }

    #[test]
    fn test_empty_weighting_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            choose_weighted(&Weighting::new(), &mut rng),
            Err(WeightingError::Empty)
        );
    }

    #[test]
    fn test_zero_weights_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = Weighting::new().with("default", 0).with("alternate", 0);
        assert_eq!(choose_weighted(&w, &mut rng), Err(WeightingError::ZeroTotal));
    }

    #[test]
    fn test_zero_weight_entry_never_chosen() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = Weighting::new().with("off", 0).with("on", 3);
        for _ in 0..500 {
            assert_eq!(choose_weighted(&w, &mut rng).unwrap(), "on");
        }
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let w = even();
        for _ in 0..100 {
            assert_eq!(
                choose_weighted(&w, &mut a).unwrap(),
                choose_weighted(&w, &mut b).unwrap()
            );
        }
    }

    #[test]
    fn test_even_split_converges() {
        let mut rng = StdRng::seed_from_u64(2024);
        let w = even();
        let n = 40_000;
        let mut defaults = 0;
        for _ in 0..n {
            if choose_weighted(&w, &mut rng).unwrap() == "default" {
                defaults += 1;
            }
        }
        let share = defaults as f64 / n as f64;
        // 5 standard deviations of a fair coin at n draws
        let tolerance = 5.0 * 0.5 / (n as f64).sqrt();
        assert!((share - 0.5).abs() < tolerance, "share was {share}");
    }

    #[test]
    fn test_uneven_split_converges() {
        let mut rng = StdRng::seed_from_u64(99);
        let w = Weighting::new().with("a", 1).with("b", 3);
        let n = 40_000;
        let bs = (0..n)
            .filter(|_| choose_weighted(&w, &mut rng).unwrap() == "b")
            .count();
        let share = bs as f64 / n as f64;
        assert!((share - 0.75).abs() < 0.02, "share was {share}");
    }

    #[test]
    fn test_fixed_strategy() {
        let mut rng = StdRng::seed_from_u64(3);
        let fixed = FixedTreatment("alternate".to_string());
        assert_eq!(fixed.select(&even(), &mut rng).unwrap(), "alternate");

        let missing = FixedTreatment("blue".to_string());
        assert_eq!(
            missing.select(&even(), &mut rng),
            Err(WeightingError::UnknownTreatment("blue".to_string()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(even().to_string(), "{default=50, alternate=50}");
    }
}
