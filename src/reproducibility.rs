//! Fork-join scan passes and checks that concurrent accumulation is
//! reproducible.
//!
//! Every pass follows the same shape: spawn one task per worker inside a
//! [`rayon::scope`], let each task add its own deterministic stream into the
//! shared bins, and read the bins only once the scope has joined all tasks.
//! Worker `w` draws from a generator seeded with `seed + w`, so each worker
//! produces the same stream on every run no matter which thread executes it.

use log::info;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::accumulator::{ConcurrentAccumulator, Precision};
use crate::agreement::{Agreement, ACCURACY_BOUND};
use crate::{Histogram, Observation};

/// Shape of a reproducibility pass: `workers` tasks each add
/// `loops_per_worker` contributions to every one of `bins` bins.
///
/// Contributions are drawn uniformly from `[low, high)`. Reduced-precision
/// sums are exact, and so identical across runs, while the ratio between a
/// bin's total and its smallest contribution stays below about 2^29. Keep
/// `low` away from zero.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    pub bins: usize,
    pub workers: usize,
    pub loops_per_worker: usize,
    pub seed: u64,
    pub low: f64,
    pub high: f64,
}

impl Default for FillConfig {
    fn default() -> Self {
        FillConfig {
            bins: 100,
            workers: 100,
            loops_per_worker: 100,
            seed: 0xDECAF,
            low: 1.0,
            high: 2.0,
        }
    }
}

/// Bin sums of one pass, accumulated at both precisions from the same
/// contributions.
#[derive(Clone, Debug, PartialEq)]
pub struct PairedSums {
    pub full: Vec<f64>,
    pub reduced: Vec<f64>,
}

/// Generator for one worker's stream.
pub fn worker_rng(seed: u64, worker: usize) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(worker as u64))
}

/// Run all workers concurrently and wait for every one of them.
///
/// Panics if `config.low >= config.high`.
pub fn fill_concurrently(config: &FillConfig) -> PairedSums {
    let full = ConcurrentAccumulator::new(config.bins, Precision::Full);
    let reduced = ConcurrentAccumulator::new(config.bins, Precision::Reduced);
    rayon::scope(|s| {
        for worker in 0..config.workers {
            let (full, reduced) = (&full, &reduced);
            s.spawn(move |_| fill_worker(full, reduced, config, worker));
        }
    });
    PairedSums {
        full: full.into_vec(),
        reduced: reduced.into_vec(),
    }
}

/// Run the workers one after another in the given order. Replaying the same
/// workers in different orders reproduces, deterministically, the
/// interleavings a concurrent pass may hit.
pub fn fill_in_worker_order(
    config: &FillConfig,
    order: impl IntoIterator<Item = usize>,
) -> PairedSums {
    let full = ConcurrentAccumulator::new(config.bins, Precision::Full);
    let reduced = ConcurrentAccumulator::new(config.bins, Precision::Reduced);
    for worker in order {
        fill_worker(&full, &reduced, config, worker);
    }
    PairedSums {
        full: full.into_vec(),
        reduced: reduced.into_vec(),
    }
}

fn fill_worker(
    full: &ConcurrentAccumulator,
    reduced: &ConcurrentAccumulator,
    config: &FillConfig,
    worker: usize,
) {
    let mut rng = worker_rng(config.seed, worker);
    for _ in 0..config.loops_per_worker {
        for bin in 0..config.bins {
            let contribution = rng.gen_range(config.low..config.high);
            full.add(bin, contribution);
            reduced.add(bin, contribution);
        }
    }
}

/// Scan one stream of observations per worker into `histogram` and return once
/// every stream has been consumed.
pub fn scan_concurrently<S>(histogram: &Histogram, streams: Vec<S>)
where
    S: IntoIterator<Item = Observation> + Send,
{
    rayon::scope(|s| {
        for stream in streams {
            s.spawn(move |_| {
                for observation in stream {
                    histogram.add_observation(observation);
                }
            });
        }
    });
}

/// How two passes over the same workers compare.
#[derive(Clone, Copy, Debug)]
pub struct ReproducibilityReport {
    /// First pass against second pass, full precision.
    pub full_runs: Agreement,
    /// First pass against second pass, reduced precision.
    pub reduced_runs: Agreement,
    /// Full-precision sums (measure) against reduced-precision sums (proxy),
    /// over both passes.
    pub precision_loss: Agreement,
}

impl ReproducibilityReport {
    pub fn compare(first: &PairedSums, second: &PairedSums) -> Self {
        let mut precision_loss = Agreement::new();
        for run in [first, second] {
            for (&full, &reduced) in run.full.iter().zip(&run.reduced) {
                precision_loss.add(full, reduced);
            }
        }
        ReproducibilityReport {
            full_runs: Agreement::of(&first.full, &second.full),
            reduced_runs: Agreement::of(&first.reduced, &second.reduced),
            precision_loss,
        }
    }

    /// Reduced-precision sums matched bit for bit.
    pub fn is_reproducible(&self) -> bool {
        self.reduced_runs.is_exact()
    }

    /// Reduced-precision sums stayed within [`ACCURACY_BOUND`] of the
    /// full-precision sums in every bin.
    pub fn is_accurate(&self) -> bool {
        self.precision_loss.within(ACCURACY_BOUND)
    }

    pub fn log_summary(&self) {
        info!(
            "Max rel. error between full-precision runs: {:e}",
            self.full_runs.max_relative_error()
        );
        info!(
            "Max rel. error between reduced-precision runs: {:e}",
            self.reduced_runs.max_relative_error()
        );
        info!(
            "Max rel. error between full and reduced precision: {:e}",
            self.precision_loss.max_relative_error()
        );
    }
}

/// Run two concurrent passes with the same configuration and compare them.
pub fn check_reproducibility(config: &FillConfig) -> ReproducibilityReport {
    info!(
        "Histogram size: {}, workers: {}, loops per worker: {}",
        config.bins, config.workers, config.loops_per_worker
    );
    let first = fill_concurrently(config);
    let second = fill_concurrently(config);
    let report = ReproducibilityReport::compare(&first, &second);
    report.log_summary();
    report
}
