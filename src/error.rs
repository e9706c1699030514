//! Errors raised while constructing or combining histograms.

use thiserror::Error;

use crate::accumulator::Precision;

/// Reasons a histogram or bin mapper cannot be built.
///
/// Binning and accumulation never fail once construction succeeded; every
/// variant here is raised up front so that a scan pass cannot abort midway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HistogramError {
    #[error("feature '{name}': bin count must be positive")]
    InvalidBinCount { name: String },

    #[error("feature '{name}': invalid domain [{min}, {max_exclusive}), bounds must be finite and min < max_exclusive")]
    InvalidBounds {
        name: String,
        min: f64,
        max_exclusive: f64,
    },

    #[error("feature '{name}': integer domain [{min}, {max_exclusive}) has fractional bounds")]
    NonIntegralBounds {
        name: String,
        min: f64,
        max_exclusive: f64,
    },

    #[error("feature '{name}': domain [{min}, {max_exclusive}) cannot hold {bin_count} distinct bins")]
    DomainTooNarrow {
        name: String,
        min: f64,
        max_exclusive: f64,
        bin_count: usize,
    },

    #[error("cannot merge histogram '{other}' into '{name}': split points differ")]
    ShapeMismatch { name: String, other: String },

    #[error("cannot merge {other_precision:?}-precision histogram '{other}' into {precision:?}-precision '{name}'")]
    PrecisionMismatch {
        name: String,
        other: String,
        precision: Precision,
        other_precision: Precision,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HistogramError>;
