//! Exponentially smoothed duration estimates.

use serde::{Deserialize, Serialize};

/// Exponential moving average over observed samples. The first observation
/// seeds the estimate directly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Smoother {
    alpha: f64,
    estimate: f64,
    samples: u64,
}

impl Smoother {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            estimate: 0.0,
            samples: 0,
        }
    }

    pub fn observe(&mut self, sample: f64) {
        if self.samples == 0 {
            self.estimate = sample;
        } else {
            self.estimate += self.alpha * (sample - self.estimate);
        }
        self.samples += 1;
    }

    pub fn total(&self) -> f64 {
        self.estimate
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl Default for Smoother {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_estimate() {
        let mut s = Smoother::new(0.5);
        s.observe(10.0);
        assert_eq!(s.total(), 10.0);
        s.observe(20.0);
        assert_eq!(s.total(), 15.0);
        s.observe(15.0);
        assert_eq!(s.total(), 15.0);
    }
}
