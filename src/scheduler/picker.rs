use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::factors::{SanitizerPriorityFactor, ScoreFactor, TaskBalanceFactor};
use crate::types::Fuzzlet;

/// Weighted-random fuzzlet selection over an ordered list of scoring
/// strategies. The order is explicit so factor application is
/// deterministic.
pub struct Picker {
    factors: Vec<(Box<dyn ScoreFactor>, f64)>,
    scheduling_interval: Duration,
}

impl Picker {
    pub fn new(scheduling_interval: Duration) -> Self {
        Self {
            factors: vec![
                (Box::new(TaskBalanceFactor), 1.0),
                (Box::new(SanitizerPriorityFactor), 1.0),
            ],
            scheduling_interval,
        }
    }

    #[cfg(test)]
    pub fn with_factors(
        factors: Vec<(Box<dyn ScoreFactor>, f64)>,
        scheduling_interval: Duration,
    ) -> Self {
        Self {
            factors,
            scheduling_interval,
        }
    }

    /// The combined, normalized probability distribution over `fuzzlets`.
    /// Factors whose raw vector cannot be normalized (zero or non-finite
    /// sum) contribute nothing instead of poisoning the result.
    pub fn distribution(&self, fuzzlets: &[Arc<Fuzzlet>]) -> Vec<f64> {
        let mut combined = vec![0.0; fuzzlets.len()];
        for (factor, weight) in &self.factors {
            let mut scores = factor.score(fuzzlets);
            debug_assert_eq!(scores.len(), fuzzlets.len(), "factor {}", factor.name());
            if !normalize(&mut scores) {
                continue;
            }
            for (total, score) in combined.iter_mut().zip(scores) {
                *total += score * weight;
            }
        }
        normalize(&mut combined);
        combined
    }

    /// Pick one fuzzlet by walking the cumulative distribution. Never fails
    /// when candidates exist: if floating-point drift keeps the cumulative
    /// sum below the draw, fall back to a uniform pick.
    pub fn pick<R: Rng>(
        &self,
        fuzzlets: &[Arc<Fuzzlet>],
        rng: &mut R,
    ) -> (Arc<Fuzzlet>, Duration) {
        let distribution = self.distribution(fuzzlets);

        let draw: f64 = rng.random();
        let mut cumulative = 0.0;
        for (fuzzlet, probability) in fuzzlets.iter().zip(&distribution) {
            cumulative += probability;
            if draw <= cumulative {
                return (Arc::clone(fuzzlet), self.scheduling_interval);
            }
        }

        // Safety net for drift and for all-zero distributions. Reaching this
        // with a well-formed distribution means normalization is off.
        debug_assert!(
            distribution.iter().sum::<f64>() == 0.0,
            "cumulative walk fell off the end of a normalized distribution"
        );
        let idx = rng.random_range(0..fuzzlets.len());
        (Arc::clone(&fuzzlets[idx]), self.scheduling_interval)
    }
}

/// Scale `scores` proportionally so they sum to 1. Returns false (leaving
/// the input untouched) when the sum is zero or non-finite.
fn normalize(scores: &mut [f64]) -> bool {
    let sum: f64 = scores.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return false;
    }
    for score in scores.iter_mut() {
        *score /= sum;
    }
    true
}
