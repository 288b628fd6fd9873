//! Resampling statistics: running moments, reservoir, percentiles and the
//! Monte Carlo report.

use serde::{Deserialize, Serialize};

use crate::montecarlo::{FastRng, Strategy};

/// Percentile cutoffs reported by default (0.1% through 99%).
pub const DEFAULT_PERCENTILES: [f64; 10] = [0.001, 0.01, 0.05, 0.10, 0.25, 0.50, 0.75, 0.90, 0.95, 0.99];

/// Welford running mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Self::default()
        }
    }

    #[inline(always)]
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    /// Chan et al. pairwise combination.
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.mean += delta * other.count as f64 / n;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n - 1).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Algorithm R reservoir of fixed capacity.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    items: Vec<f64>,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            items: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn offer(&mut self, x: f64, rng: &mut FastRng) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(x);
        } else {
            let j = rng.below(self.seen);
            if (j as usize) < self.capacity {
                self.items[j as usize] = x;
            }
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn into_sorted(mut self) -> Vec<f64> {
        self.items.sort_by(f64::total_cmp);
        self.items
    }
}

/// Linear-interpolated percentile over an ascending slice; `p` in `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub p: f64,
    pub value: f64,
    pub dps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// The timeout hit first; statistics cover `fights_run` fights only.
    TimedOut,
}

/// Outcome distribution over the resampled fights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloReport {
    pub mean_total_damage: f64,
    pub std_dev_total: f64,
    pub stderr: f64,
    pub mean_dps: f64,
    pub stderr_dps: f64,
    pub min_total: f64,
    pub max_total: f64,
    pub percentiles: Vec<Percentile>,
    pub fights_requested: u64,
    pub fights_run: u64,
    pub strategy: Strategy,
    /// Set when percentiles come from a reservoir subset.
    pub approximate_percentiles: bool,
    pub status: RunStatus,
    #[serde(default)]
    pub elapsed_ms: u128,
}

impl MonteCarloReport {
    /// Builds the report from running moments and the (sorted) percentile basis.
    pub fn from_parts(
        stats: &RunningStats,
        sorted: &[f64],
        quantiles: &[f64],
        duration_ms: i64,
        strategy: Strategy,
        approximate: bool,
    ) -> Self {
        let seconds = duration_ms as f64 / 1000.0;
        let n = stats.count().max(1) as f64;
        let stderr = stats.std_dev() / n.sqrt();
        let percentiles = quantiles
            .iter()
            .map(|&p| {
                let value = percentile(sorted, p);
                Percentile {
                    p,
                    value,
                    dps: value / seconds,
                }
            })
            .collect();

        Self {
            mean_total_damage: stats.mean(),
            std_dev_total: stats.std_dev(),
            stderr,
            mean_dps: stats.mean() / seconds,
            stderr_dps: stderr / seconds,
            min_total: stats.min(),
            max_total: stats.max(),
            percentiles,
            fights_requested: stats.count(),
            fights_run: stats.count(),
            strategy,
            approximate_percentiles: approximate,
            status: RunStatus::Complete,
            elapsed_ms: 0,
        }
    }

    /// Report over a full sample array (sorted in place).
    pub fn from_samples(
        samples: &mut [f64],
        quantiles: &[f64],
        duration_ms: i64,
        strategy: Strategy,
    ) -> Self {
        let mut stats = RunningStats::new();
        for &x in samples.iter() {
            stats.push(x);
        }
        samples.sort_by(f64::total_cmp);
        Self::from_parts(&stats, samples, quantiles, duration_ms, strategy, false)
    }

    pub fn percentile(&self, p: f64) -> Option<&Percentile> {
        self.percentiles.iter().find(|q| (q.p - p).abs() < 1e-12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_two_pass() {
        let xs = [3.0, 7.0, 7.0, 19.0, 24.0];
        let mut stats = RunningStats::new();
        xs.iter().for_each(|&x| stats.push(x));
        let mean = xs.iter().sum::<f64>() / 5.0;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 4.0;
        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-9);
        assert_eq!((stats.min(), stats.max()), (3.0, 24.0));
    }

    #[test]
    fn merge_equals_single_pass() {
        let xs: Vec<f64> = (0..100).map(|i| (i * i % 37) as f64).collect();
        let mut whole = RunningStats::new();
        xs.iter().for_each(|&x| whole.push(x));
        let mut left = RunningStats::new();
        let mut right = RunningStats::new();
        xs[..40].iter().for_each(|&x| left.push(x));
        xs[40..].iter().for_each(|&x| right.push(x));
        left.merge(&right);
        assert_eq!(left.count(), 100);
        assert!((left.mean() - whole.mean()).abs() < 1e-9);
        assert!((left.variance() - whole.variance()).abs() < 1e-9);
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 0.5), 30.0);
        assert_eq!(percentile(&sorted, 1.0), 50.0);
        assert!((percentile(&sorted, 0.1) - 14.0).abs() < 1e-12);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn reservoir_is_bounded() {
        let mut rng = FastRng::new(7);
        let mut reservoir = Reservoir::new(16);
        for i in 0..1000 {
            reservoir.offer(i as f64, &mut rng);
        }
        assert_eq!(reservoir.seen(), 1000);
        let kept = reservoir.into_sorted();
        assert_eq!(kept.len(), 16);
        assert!(kept.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn report_from_constant_samples() {
        let mut samples = vec![1000.0; 50];
        let report = MonteCarloReport::from_samples(&mut samples, &DEFAULT_PERCENTILES, 10_000, Strategy::Sequential);
        assert_eq!(report.mean_total_damage, 1000.0);
        assert_eq!(report.std_dev_total, 0.0);
        assert_eq!(report.mean_dps, 100.0);
        assert!(report.percentiles.iter().all(|p| p.value == 1000.0));
        assert_eq!(report.percentile(0.5).unwrap().dps, 100.0);
    }
}
