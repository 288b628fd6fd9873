//! Monte Carlo resampling of a reference damage ledger.
//!
//! Each simulated fight draws every record from a normal distribution with
//! the record's mean and standard deviation, clipped at zero, and sums them.
//! Three interchangeable strategies produce the same report:
//!
//! - `Sequential`: one thread, full sample array, exact percentiles.
//! - `Parallel`: fights split into per-worker ranges on rayon, each worker
//!   with its own seeded stream; arrays are concatenated in worker order.
//! - `Streaming`: Welford moments plus a fixed-size reservoir; memory stays
//!   bounded and percentiles are approximate.

use clap::ValueEnum;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::entity::DamageLedger;
use crate::error::{Result, SimError};
use crate::stats::{MonteCarloReport, Reservoir, RunStatus, RunningStats, DEFAULT_PERCENTILES};

const SPLITMIX64_GOLDEN: u64 = 0x9e37_79b9_7f4a_7c15;
const SPLITMIX64_M1: u64 = 0xbf58_476d_1ce4_e5b9;
const SPLITMIX64_M2: u64 = 0x94d0_49bb_1331_11eb;

/// Above this many fights `Auto` switches to streaming.
pub const STREAMING_THRESHOLD: u64 = 10_000_000;

/// Fights between deadline checks.
const DEADLINE_CHECK_EVERY: u64 = 1024;

/// Fast RNG wrapper for the sampling kernels
#[derive(Clone)]
pub struct FastRng {
    inner: fastrand::Rng,
    spare: Option<f64>,
}

impl FastRng {
    #[inline(always)]
    pub fn new(seed: u64) -> Self {
        Self {
            inner: fastrand::Rng::with_seed(seed),
            spare: None,
        }
    }

    #[inline(always)]
    pub fn f64(&mut self) -> f64 {
        self.inner.f64()
    }

    /// Uniform integer in `[0, n)`.
    #[inline(always)]
    pub fn below(&mut self, n: u64) -> u64 {
        self.inner.u64(..n.max(1))
    }

    /// Two independent standard normals (Box–Muller).
    #[inline(always)]
    pub fn normal_pair(&mut self) -> (f64, f64) {
        let u1 = 1.0 - self.inner.f64();
        let u2 = self.inner.f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f64::consts::TAU * u2;
        (r * theta.cos(), r * theta.sin())
    }

    #[inline(always)]
    pub fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        let (a, b) = self.normal_pair();
        self.spare = Some(b);
        a
    }
}

/// SplitMix64 finalizer over `base` and the worker index.
pub fn worker_seed(base: u64, worker: u64) -> u64 {
    let mut z = base.wrapping_add(SPLITMIX64_GOLDEN.wrapping_mul(worker.wrapping_add(1)));
    z = (z ^ (z >> 30)).wrapping_mul(SPLITMIX64_M1);
    z = (z ^ (z >> 27)).wrapping_mul(SPLITMIX64_M2);
    z ^ (z >> 31)
}

/// Split `total` items into up to `num_batches` ranges `[start, end)`.
/// Earlier batches take the remainder.
pub fn batch_ranges(total: usize, num_batches: usize) -> Vec<(usize, usize)> {
    if total == 0 || num_batches == 0 {
        return Vec::new();
    }
    let num_batches = num_batches.min(total);
    let base = total / num_batches;
    let remainder = total % num_batches;
    let mut ranges = Vec::with_capacity(num_batches);
    let mut start = 0;
    for i in 0..num_batches {
        let size = base + usize::from(i < remainder);
        ranges.push((start, start + size));
        start += size;
    }
    ranges
}

/// Rayon thread pool sized for a resampling run.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerPool {
    /// Number of worker threads. If 0, the global rayon pool is used.
    pub workers: usize,
}

impl WorkerPool {
    pub fn with_workers(n: usize) -> Self {
        Self { workers: n }
    }

    /// Threads the work will actually be split across.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.workers
        }
    }

    pub fn install<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if self.workers == 0 {
            return Ok(f());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| SimError::config(format!("cannot build worker pool: {e}")))?;
        Ok(pool.install(f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Streaming,
    #[default]
    Auto,
}

impl Strategy {
    /// Concrete strategy for a run of `fights`.
    pub fn resolve(self, fights: u64) -> Strategy {
        match self {
            Strategy::Auto if fights > STREAMING_THRESHOLD => Strategy::Streaming,
            Strategy::Auto if num_cpus::get() > 1 => Strategy::Parallel,
            Strategy::Auto => Strategy::Sequential,
            other => other,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Sequential => "sequential",
            Strategy::Parallel => "parallel",
            Strategy::Streaming => "streaming",
            Strategy::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Numeric backend for drawing one fight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    /// One normal per record.
    #[default]
    Scalar,
    /// Records in pairs, both Box–Muller outputs used.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub fights: u64,
    /// Base seed; a random one is drawn when absent.
    pub seed: Option<u64>,
    pub percentiles: Vec<f64>,
    pub strategy: Strategy,
    /// Worker threads for the parallel strategy; 0 means all cores.
    pub workers: usize,
    pub reservoir_size: usize,
    pub timeout_ms: Option<u64>,
    pub kernel: Kernel,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            fights: 100_000,
            seed: None,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            strategy: Strategy::Auto,
            workers: 0,
            reservoir_size: 10_000,
            timeout_ms: None,
            kernel: Kernel::Scalar,
        }
    }
}

/// Resampler over the moments of one reference ledger.
#[derive(Debug, Clone)]
pub struct MonteCarloSimulator {
    means: Vec<f64>,
    stddevs: Vec<f64>,
    duration_ms: i64,
}

struct Partial {
    samples: Vec<f64>,
    timed_out: bool,
}

impl MonteCarloSimulator {
    pub fn new(ledger: &DamageLedger, duration_ms: i64) -> Result<Self> {
        let moments: Vec<(f64, f64)> = ledger.records().iter().map(|r| (r.mean, r.stddev)).collect();
        Self::from_moments(&moments, duration_ms)
    }

    pub fn from_moments(records: &[(f64, f64)], duration_ms: i64) -> Result<Self> {
        if records.is_empty() {
            return Err(SimError::insufficient("damage ledger is empty"));
        }
        if duration_ms <= 0 {
            return Err(SimError::insufficient(format!(
                "fight duration must be positive, got {duration_ms} ms"
            )));
        }
        if records.iter().any(|(m, s)| !m.is_finite() || !s.is_finite() || *s < 0.0) {
            return Err(SimError::config("ledger contains a non-finite mean or negative stddev"));
        }
        Ok(Self {
            means: records.iter().map(|r| r.0).collect(),
            stddevs: records.iter().map(|r| r.1).collect(),
            duration_ms,
        })
    }

    pub fn records(&self) -> usize {
        self.means.len()
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Total damage of one resampled fight.
    #[inline]
    pub fn sample_fight(&self, rng: &mut FastRng, kernel: Kernel) -> f64 {
        match kernel {
            Kernel::Scalar => self
                .means
                .iter()
                .zip(&self.stddevs)
                .map(|(&mean, &sd)| draw(mean, sd, rng.standard_normal()))
                .sum(),
            Kernel::Blocked => {
                let mut total = 0.0;
                let pairs = self.means.len() / 2;
                for i in 0..pairs {
                    let (za, zb) = rng.normal_pair();
                    let (a, b) = (2 * i, 2 * i + 1);
                    total += draw(self.means[a], self.stddevs[a], za);
                    total += draw(self.means[b], self.stddevs[b], zb);
                }
                if self.means.len() % 2 == 1 {
                    let last = self.means.len() - 1;
                    total += draw(self.means[last], self.stddevs[last], rng.normal_pair().0);
                }
                total
            }
        }
    }

    /// Per-fight totals for `fights` fights on a single stream.
    pub fn sample_totals(&self, fights: u64, seed: u64, kernel: Kernel) -> Vec<f64> {
        let mut rng = FastRng::new(worker_seed(seed, 0));
        (0..fights).map(|_| self.sample_fight(&mut rng, kernel)).collect()
    }

    pub fn run(&self, config: &MonteCarloConfig) -> Result<MonteCarloReport> {
        if config.fights == 0 {
            return Err(SimError::insufficient("at least one fight must be requested"));
        }
        if config.percentiles.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(SimError::config("percentiles must lie in [0, 1]"));
        }

        let seed = config.seed.unwrap_or_else(rand::random::<u64>);
        let strategy = config.strategy.resolve(config.fights);
        let deadline = config
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let started = Instant::now();

        let mut report = match strategy {
            Strategy::Streaming => self.run_streaming(config, seed, deadline)?,
            Strategy::Parallel => {
                let partial = self.run_parallel(config, seed, deadline)?;
                self.finish(partial, config, Strategy::Parallel)?
            }
            Strategy::Sequential | Strategy::Auto => {
                let partial = self.run_sequential(config.fights, seed, config.kernel, deadline);
                self.finish(partial, config, Strategy::Sequential)?
            }
        };
        report.fights_requested = config.fights;
        report.elapsed_ms = started.elapsed().as_millis();

        if report.status == RunStatus::TimedOut {
            warn!(
                fights_run = report.fights_run,
                fights_requested = config.fights,
                "monte carlo run timed out"
            );
        }
        info!(
            %strategy,
            fights = report.fights_run,
            mean_dps = report.mean_dps,
            stderr_dps = report.stderr_dps,
            elapsed_ms = report.elapsed_ms as u64,
            "monte carlo complete"
        );
        Ok(report)
    }

    fn finish(
        &self,
        mut partial: Partial,
        config: &MonteCarloConfig,
        strategy: Strategy,
    ) -> Result<MonteCarloReport> {
        check_enough(partial.samples.len() as u64, partial.timed_out)?;
        let mut report = MonteCarloReport::from_samples(
            &mut partial.samples,
            &config.percentiles,
            self.duration_ms,
            strategy,
        );
        if partial.timed_out {
            report.status = RunStatus::TimedOut;
        }
        Ok(report)
    }

    fn run_sequential(
        &self,
        fights: u64,
        seed: u64,
        kernel: Kernel,
        deadline: Option<Instant>,
    ) -> Partial {
        run_range(self, 0, fights, worker_seed(seed, 0), kernel, deadline)
    }

    fn run_parallel(
        &self,
        config: &MonteCarloConfig,
        seed: u64,
        deadline: Option<Instant>,
    ) -> Result<Partial> {
        let pool = WorkerPool::with_workers(config.workers);
        let ranges = batch_ranges(config.fights as usize, pool.effective_workers());
        let kernel = config.kernel;

        let partials: Vec<Partial> = pool.install(|| {
            ranges
                .par_iter()
                .enumerate()
                .map(|(worker, &(start, end))| {
                    let stream_seed = worker_seed(seed, worker as u64);
                    run_range(self, start as u64, end as u64, stream_seed, kernel, deadline)
                })
                .collect()
        })?;

        let timed_out = partials.iter().any(|p| p.timed_out);
        let mut samples = Vec::with_capacity(config.fights as usize);
        for partial in partials {
            samples.extend(partial.samples);
        }
        Ok(Partial { samples, timed_out })
    }

    fn run_streaming(
        &self,
        config: &MonteCarloConfig,
        seed: u64,
        deadline: Option<Instant>,
    ) -> Result<MonteCarloReport> {
        let mut rng = FastRng::new(worker_seed(seed, 0));
        // Separate stream so the reservoir never perturbs the fight draws.
        let mut reservoir_rng = FastRng::new(worker_seed(seed, u64::MAX));
        let mut stats = RunningStats::new();
        let mut reservoir = Reservoir::new(config.reservoir_size);
        let mut timed_out = false;

        for i in 0..config.fights {
            if i % DEADLINE_CHECK_EVERY == 0 && i > 0 && past(deadline) {
                timed_out = true;
                break;
            }
            let total = self.sample_fight(&mut rng, config.kernel);
            stats.push(total);
            reservoir.offer(total, &mut reservoir_rng);
        }

        check_enough(stats.count(), timed_out)?;
        let sorted = reservoir.into_sorted();
        let approximate = stats.count() as usize > sorted.len();
        let mut report = MonteCarloReport::from_parts(
            &stats,
            &sorted,
            &config.percentiles,
            self.duration_ms,
            Strategy::Streaming,
            approximate,
        );
        if timed_out {
            report.status = RunStatus::TimedOut;
        }
        Ok(report)
    }
}

#[inline(always)]
fn draw(mean: f64, sd: f64, z: f64) -> f64 {
    if sd > 0.0 {
        (mean + sd * z).max(0.0)
    } else {
        mean.max(0.0)
    }
}

#[inline]
fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn run_range(
    sim: &MonteCarloSimulator,
    start: u64,
    end: u64,
    seed: u64,
    kernel: Kernel,
    deadline: Option<Instant>,
) -> Partial {
    let mut rng = FastRng::new(seed);
    let mut samples = Vec::with_capacity((end - start) as usize);
    for i in start..end {
        if (i - start) % DEADLINE_CHECK_EVERY == 0 && i > start && past(deadline) {
            return Partial {
                samples,
                timed_out: true,
            };
        }
        samples.push(sim.sample_fight(&mut rng, kernel));
    }
    Partial {
        samples,
        timed_out: false,
    }
}

/// A timed-out run still needs two fights for a standard error.
fn check_enough(fights_run: u64, timed_out: bool) -> Result<()> {
    if fights_run == 0 || (timed_out && fights_run < 2) {
        return Err(SimError::insufficient(format!(
            "only {fights_run} fights completed before the timeout"
        )));
    }
    Ok(())
}

/// Resamples `ledger` under `config`.
pub fn analyze(ledger: &DamageLedger, duration_ms: i64, config: &MonteCarloConfig) -> Result<MonteCarloReport> {
    MonteCarloSimulator::new(ledger, duration_ms)?.run(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: Strategy, fights: u64) -> MonteCarloConfig {
        MonteCarloConfig {
            fights,
            seed: Some(42),
            strategy,
            ..MonteCarloConfig::default()
        }
    }

    #[test]
    fn batch_ranges_even_split() {
        assert_eq!(batch_ranges(100, 4), vec![(0, 25), (25, 50), (50, 75), (75, 100)]);
    }

    #[test]
    fn batch_ranges_with_remainder() {
        assert_eq!(batch_ranges(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn batch_ranges_more_batches_than_items() {
        assert_eq!(batch_ranges(3, 10), vec![(0, 1), (1, 2), (2, 3)]);
        assert!(batch_ranges(0, 5).is_empty());
        assert!(batch_ranges(10, 0).is_empty());
    }

    #[test]
    fn worker_seeds_differ_and_repeat() {
        assert_ne!(worker_seed(1, 0), worker_seed(1, 1));
        assert_eq!(worker_seed(9, 3), worker_seed(9, 3));
    }

    #[test]
    fn normals_have_unit_moments() {
        let mut rng = FastRng::new(11);
        let mut stats = RunningStats::new();
        for _ in 0..200_000 {
            stats.push(rng.standard_normal());
        }
        assert!(stats.mean().abs() < 0.01);
        assert!((stats.variance() - 1.0).abs() < 0.02);
    }

    #[test]
    fn streaming_matches_sequential_stream() {
        let sim = MonteCarloSimulator::from_moments(&[(1000.0, 100.0), (500.0, 50.0)], 10_000).unwrap();
        let seq = sim.run(&config(Strategy::Sequential, 5_000)).unwrap();
        let stream = sim
            .run(&MonteCarloConfig {
                reservoir_size: 100,
                ..config(Strategy::Streaming, 5_000)
            })
            .unwrap();
        assert!((seq.mean_total_damage - stream.mean_total_damage).abs() < 1e-6);
        assert!(stream.approximate_percentiles);
        assert!(!seq.approximate_percentiles);
    }

    #[test]
    fn single_worker_parallel_equals_sequential() {
        let sim = MonteCarloSimulator::from_moments(&[(1000.0, 100.0)], 10_000).unwrap();
        let seq = sim.run(&config(Strategy::Sequential, 2_000)).unwrap();
        let par = sim
            .run(&MonteCarloConfig {
                workers: 1,
                ..config(Strategy::Parallel, 2_000)
            })
            .unwrap();
        assert_eq!(seq.mean_total_damage, par.mean_total_damage);
        assert_eq!(seq.percentiles, par.percentiles);
    }

    #[test]
    fn blocked_kernel_agrees_with_scalar() {
        let records: Vec<(f64, f64)> = (0..7).map(|i| (100.0 + i as f64, 10.0)).collect();
        let sim = MonteCarloSimulator::from_moments(&records, 1000).unwrap();
        let scalar = sim.run(&config(Strategy::Sequential, 20_000)).unwrap();
        let blocked = sim
            .run(&MonteCarloConfig {
                kernel: Kernel::Blocked,
                ..config(Strategy::Sequential, 20_000)
            })
            .unwrap();
        let tolerance = 4.0 * (scalar.stderr + blocked.stderr);
        assert!((scalar.mean_total_damage - blocked.mean_total_damage).abs() < tolerance);
    }

    #[test]
    fn zero_fights_is_insufficient() {
        let sim = MonteCarloSimulator::from_moments(&[(1.0, 0.0)], 1000).unwrap();
        assert!(matches!(
            sim.run(&config(Strategy::Sequential, 0)),
            Err(SimError::SamplingInsufficiency { .. })
        ));
    }

    #[test]
    fn auto_picks_streaming_for_huge_runs() {
        assert_eq!(Strategy::Auto.resolve(STREAMING_THRESHOLD + 1), Strategy::Streaming);
        assert_eq!(Strategy::Sequential.resolve(STREAMING_THRESHOLD + 1), Strategy::Sequential);
        assert_ne!(Strategy::Auto.resolve(10), Strategy::Streaming);
    }
}
