//! Per-feature histograms for finding candidate split points in a decision-tree
//! learner while many workers scan the training data in parallel.
//!
//! A [`Histogram`] couples a [`BinMapper`], which turns feature values into bin
//! indices and back, with lock-free per-bin statistics that any number of
//! threads may add to through a shared reference. Contributions are rounded to
//! `f32` before they are summed (see [`Precision`]), which makes the totals
//! independent of the order in which the workers happen to land.
//!
//! Lifecycle: build one histogram per feature per tree node, share `&Histogram`
//! with the workers of a single scan pass, join them, then [`Histogram::freeze`]
//! it into an immutable [`FrozenHistogram`] for split evaluation.
//!
//! ```
//! use splitgram::{Histogram, HistogramParams};
//!
//! let hist = Histogram::new(HistogramParams::new("x", 0.0, 10.0).with_bin_count(5)).unwrap();
//! rayon::scope(|s| {
//!     for worker in 0..4 {
//!         let hist = &hist;
//!         s.spawn(move |_| {
//!             for i in 0..100 {
//!                 hist.add((worker * 100 + i) as f64 / 40.0, 1.0);
//!             }
//!         });
//!     }
//! });
//! let frozen = hist.freeze();
//! assert_eq!(frozen.total_weight(), 400.0);
//! assert_eq!(frozen.bin_at(1), 2.0);
//! assert_eq!(frozen.bin_stats(0).weight, 80.0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

mod accumulator;
mod agreement;
mod bin_mapper;
mod error;
mod params;
pub mod reproducibility;

pub use accumulator::{ConcurrentAccumulator, Precision};
pub use agreement::{relative_error, Agreement, ACCURACY_BOUND};
pub use bin_mapper::BinMapper;
pub use error::{HistogramError, Result};
pub use params::{FeatureKind, HistogramParams};

use accumulator::{atomic_max_f64, atomic_min_f64};

/// One observation from a training row: the feature value, the response it
/// contributes and the row weight.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Observation {
    pub value: f64,
    pub response: f64,
    pub weight: f64,
}

impl Observation {
    pub fn new(value: f64, response: f64) -> Self {
        Observation {
            value,
            response,
            weight: 1.0,
        }
    }

    pub fn weighted(value: f64, response: f64, weight: f64) -> Self {
        Observation {
            value,
            response,
            weight,
        }
    }
}

/// Aggregate statistics of one bin.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BinStats {
    /// Sum of row weights.
    pub weight: f64,
    /// Weighted sum of responses.
    pub sum: f64,
    /// Weighted sum of squared responses.
    pub sum_squares: f64,
}

impl BinStats {
    pub fn is_empty(&self) -> bool {
        self.weight == 0.0
    }

    /// Weighted mean response, or None for an empty bin.
    pub fn mean(&self) -> Option<f64> {
        if self.weight > 0.0 {
            Some(self.sum / self.weight)
        } else {
            None
        }
    }

    /// Weighted population variance of the responses, or None for an empty bin.
    pub fn variance(&self) -> Option<f64> {
        self.mean()
            .map(|mean| (self.sum_squares / self.weight - mean * mean).max(0.0))
    }
}

/// Histogram of one feature at one tree node, written concurrently during a
/// scan pass.
///
/// All mutation goes through `&self`, so the histogram can be shared across
/// scoped threads or rayon tasks without locks. Read results only after every
/// writer has been joined, by calling [`freeze`](Self::freeze).
#[derive(Debug)]
pub struct Histogram {
    name: String,
    depth: usize,
    mapper: BinMapper,

    weights: ConcurrentAccumulator,
    sums: ConcurrentAccumulator,
    sum_squares: ConcurrentAccumulator,

    /// Weight, sum and sum of squares of observations with a NaN value.
    missing: ConcurrentAccumulator,

    /// Smallest and largest non-missing value seen, NaN until the first one.
    observed_min: AtomicU64,
    observed_max: AtomicU64,
}

const NA_WEIGHT: usize = 0;
const NA_SUM: usize = 1;
const NA_SUM_SQUARES: usize = 2;

impl Histogram {
    /// Build an empty histogram. Fails if the parameters describe no usable
    /// binning; see [`BinMapper::new`].
    pub fn new(params: HistogramParams) -> Result<Self> {
        let mapper = BinMapper::new(&params)?;
        let bins = mapper.bin_count();
        let precision = params.precision;
        Ok(Histogram {
            name: params.name,
            depth: params.depth,
            mapper,
            weights: ConcurrentAccumulator::new(bins, precision),
            sums: ConcurrentAccumulator::new(bins, precision),
            sum_squares: ConcurrentAccumulator::new(bins, precision),
            missing: ConcurrentAccumulator::new(3, precision),
            observed_min: AtomicU64::new(f64::NAN.to_bits()),
            observed_max: AtomicU64::new(f64::NAN.to_bits()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn mapper(&self) -> &BinMapper {
        &self.mapper
    }

    pub fn precision(&self) -> Precision {
        self.weights.precision()
    }

    pub fn bin_count(&self) -> usize {
        self.mapper.bin_count()
    }

    /// See [`BinMapper::bin`].
    pub fn bin(&self, value: f64) -> usize {
        self.mapper.bin(value)
    }

    /// See [`BinMapper::bin_at`].
    pub fn bin_at(&self, index: usize) -> f64 {
        self.mapper.bin_at(index)
    }

    /// Add an observation with weight one.
    #[inline]
    pub fn add(&self, value: f64, response: f64) {
        self.accumulate(value, response, 1.0);
    }

    /// Add an [`Observation`].
    #[inline]
    pub fn add_observation(&self, observation: Observation) {
        self.accumulate(observation.value, observation.response, observation.weight);
    }

    /// Add a weighted observation. A NaN `value` is counted as missing and
    /// lands in the separate missing-value slot; out-of-range values are
    /// clamped into the first or last bin. Zero, infinite and NaN weights are
    /// ignored.
    pub fn accumulate(&self, value: f64, response: f64, weight: f64) {
        if weight == 0.0 || !weight.is_finite() {
            return;
        }
        let weighted = weight * response;
        let weighted_square = weighted * response;
        if value.is_nan() {
            self.missing.add(NA_WEIGHT, weight);
            self.missing.add(NA_SUM, weighted);
            self.missing.add(NA_SUM_SQUARES, weighted_square);
            return;
        }
        let bin = self.mapper.bin(value);
        self.weights.add(bin, weight);
        self.sums.add(bin, weighted);
        self.sum_squares.add(bin, weighted_square);
        atomic_min_f64(&self.observed_min, value);
        atomic_max_f64(&self.observed_max, value);
    }

    /// Add the statistics of another histogram over the same split points
    /// and at the same precision, e.g. a partial histogram built on another
    /// node.
    pub fn merge(&self, other: &Histogram) -> Result<()> {
        if self.mapper != other.mapper {
            return Err(HistogramError::ShapeMismatch {
                name: self.name.clone(),
                other: other.name.clone(),
            });
        }
        if self.precision() != other.precision() {
            return Err(HistogramError::PrecisionMismatch {
                name: self.name.clone(),
                other: other.name.clone(),
                precision: self.precision(),
                other_precision: other.precision(),
            });
        }
        self.weights.merge_from(&other.weights);
        self.sums.merge_from(&other.sums);
        self.sum_squares.merge_from(&other.sum_squares);
        self.missing.merge_from(&other.missing);
        let other_min = f64::from_bits(other.observed_min.load(Ordering::Relaxed));
        let other_max = f64::from_bits(other.observed_max.load(Ordering::Relaxed));
        if !other_min.is_nan() {
            atomic_min_f64(&self.observed_min, other_min);
            atomic_max_f64(&self.observed_max, other_max);
        }
        Ok(())
    }

    /// End the accumulation phase and hand the results to a single reader.
    ///
    /// Taking `self` by value means no writer can still hold a reference.
    pub fn freeze(self) -> FrozenHistogram {
        let precision = self.precision();
        let bins: Vec<BinStats> = self
            .weights
            .into_vec()
            .into_iter()
            .zip(self.sums.into_vec())
            .zip(self.sum_squares.into_vec())
            .map(|((weight, sum), sum_squares)| BinStats {
                weight,
                sum,
                sum_squares,
            })
            .collect();
        let missing = self.missing.into_vec();
        let missing = BinStats {
            weight: missing[NA_WEIGHT],
            sum: missing[NA_SUM],
            sum_squares: missing[NA_SUM_SQUARES],
        };
        let finite = |bits: u64| Some(f64::from_bits(bits)).filter(|v| !v.is_nan());
        let frozen = FrozenHistogram {
            name: self.name,
            depth: self.depth,
            mapper: self.mapper,
            precision,
            bins,
            missing,
            observed_min: finite(self.observed_min.into_inner()),
            observed_max: finite(self.observed_max.into_inner()),
        };
        debug!(
            "feature '{}' depth {}: frozen {} bins ({} non-empty), weight {}, missing weight {}",
            frozen.name,
            frozen.depth,
            frozen.bin_count(),
            frozen.nonempty_bins(),
            frozen.total_weight(),
            frozen.missing.weight
        );
        frozen
    }
}

/// Read-only result of a finished scan pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FrozenHistogram {
    name: String,
    depth: usize,
    mapper: BinMapper,
    precision: Precision,
    bins: Vec<BinStats>,
    missing: BinStats,
    observed_min: Option<f64>,
    observed_max: Option<f64>,
}

impl FrozenHistogram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn mapper(&self) -> &BinMapper {
        &self.mapper
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn bin(&self, value: f64) -> usize {
        self.mapper.bin(value)
    }

    pub fn bin_at(&self, index: usize) -> f64 {
        self.mapper.bin_at(index)
    }

    pub fn bins(&self) -> &[BinStats] {
        &self.bins
    }

    /// Panics if `index >= bin_count`.
    pub fn bin_stats(&self, index: usize) -> BinStats {
        self.bins[index]
    }

    /// Statistics of observations whose value was missing.
    pub fn missing(&self) -> BinStats {
        self.missing
    }

    /// Total weight over all bins, excluding missing values.
    pub fn total_weight(&self) -> f64 {
        self.bins.iter().map(|b| b.weight).sum()
    }

    pub fn nonempty_bins(&self) -> usize {
        self.bins.iter().filter(|b| !b.is_empty()).count()
    }

    /// Smallest non-missing value accumulated, unclamped.
    pub fn observed_min(&self) -> Option<f64> {
        self.observed_min
    }

    /// Largest non-missing value accumulated, unclamped.
    pub fn observed_max(&self) -> Option<f64> {
        self.observed_max
    }
}
