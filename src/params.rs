//! Construction parameters for a per-feature histogram.

use serde::{Deserialize, Serialize};

use crate::accumulator::Precision;

/// How the values of a feature are distributed over the number line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Continuous values. Boundaries may fall anywhere.
    #[default]
    Real,
    /// Whole numbers only. Boundaries are kept on integer grid lines so that
    /// no bin splits a single integer value.
    Integer,
    /// Category codes `min..max_exclusive`. Binned like an integer feature but
    /// limited by `categorical_bin_count`, and never with random split points.
    Categorical,
}

impl FeatureKind {
    /// True for kinds whose values (and therefore bounds) are whole numbers.
    pub fn is_integral(self) -> bool {
        !matches!(self, FeatureKind::Real)
    }
}

/// Everything the tree-growth engine hands over to build one histogram for
/// one feature at one tree node.
///
/// Parameters are plain data so they can be shipped between nodes. Use the
/// `with_*` methods to adjust a default configuration:
///
/// ```
/// use splitgram::{FeatureKind, HistogramParams};
///
/// let params = HistogramParams::new("age", 0.0, 120.0)
///     .with_bin_count(20)
///     .with_kind(FeatureKind::Integer)
///     .with_random_split_points(7);
/// assert_eq!(params.bin_count, 20);
/// assert!(params.random_split_points);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramParams {
    /// Feature name or id. Only used to label errors and log lines.
    pub name: String,

    /// Requested number of bins for real and integer features.
    pub bin_count: usize,

    /// Requested number of bins for categorical features.
    pub categorical_bin_count: usize,

    pub kind: FeatureKind,

    /// Inclusive lower bound of the value domain.
    pub min: f64,

    /// Exclusive upper bound of the value domain.
    pub max_exclusive: f64,

    /// Depth of the tree node this histogram belongs to. Carried along for the
    /// caller; binning does not look at it.
    pub depth: usize,

    /// Draw split points at random instead of using equal-width bins.
    pub random_split_points: bool,

    /// Seed for random split points.
    pub seed: u64,

    /// Precision of the contributions accumulated into each bin.
    pub precision: Precision,
}

impl Default for HistogramParams {
    fn default() -> Self {
        HistogramParams {
            name: String::new(),
            bin_count: 20,
            categorical_bin_count: 1024,
            kind: FeatureKind::Real,
            min: 0.0,
            max_exclusive: 1.0,
            depth: 0,
            random_split_points: false,
            seed: 0,
            precision: Precision::Reduced,
        }
    }
}

impl HistogramParams {
    /// Parameters for a real-valued feature over `[min, max_exclusive)` with
    /// default bin counts.
    pub fn new(name: impl Into<String>, min: f64, max_exclusive: f64) -> Self {
        HistogramParams {
            name: name.into(),
            min,
            max_exclusive,
            ..Default::default()
        }
    }

    pub fn with_bin_count(mut self, bin_count: usize) -> Self {
        self.bin_count = bin_count;
        self
    }

    pub fn with_categorical_bin_count(mut self, bin_count: usize) -> Self {
        self.categorical_bin_count = bin_count;
        self
    }

    pub fn with_kind(mut self, kind: FeatureKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Switch to randomized split points drawn from the given seed.
    pub fn with_random_split_points(mut self, seed: u64) -> Self {
        self.random_split_points = true;
        self.seed = seed;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// The bin limit that applies to this feature's kind.
    pub fn requested_bins(&self) -> usize {
        match self.kind {
            FeatureKind::Categorical => self.categorical_bin_count,
            FeatureKind::Real | FeatureKind::Integer => self.bin_count,
        }
    }
}
