//! Mapping between feature values and bin indices.
//!
//! A [`BinMapper`] divides the domain `[min, max_exclusive)` of one feature
//! into `bin_count` bins separated by `bin_count + 1` strictly increasing
//! split points. The first split point is `min` and the last is
//! `max_exclusive`. Bin `i` covers `[split[i], split[i+1])`.
//!
//! Three layouts are supported:
//!
//! - equal-width bins, whose split points are computed on the fly;
//! - randomized split points, drawn once from a seed when the mapper is built;
//! - integer grids for integer and categorical features. With a span no
//!   larger than the bin count each integer gets its own bin; otherwise the
//!   split points are rounded up onto integer grid lines so no integer value
//!   is cut in two.
//!
//! For every layout [`bin`](BinMapper::bin) returns the largest `i` with
//! `split[i] <= value`, clamped into `[0, bin_count)`, so that
//! `bin(bin_at(i)) == i` holds exactly.

use float_extras::f64::nextafter;
use log::{debug, warn};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{HistogramError, Result};
use crate::params::{FeatureKind, HistogramParams};

#[derive(Clone, Debug, PartialEq)]
enum SplitPoints {
    /// Equal-width bins; split `i` is `min + i * width`.
    Uniform { width: f64 },
    /// Materialized split points, `bin_count + 1` of them.
    Explicit(Box<[f64]>),
}

/// Maps feature values to bin indices and bin indices back to values.
///
/// A mapper is immutable once built and can be shared freely between threads.
#[derive(Clone, Debug, PartialEq)]
pub struct BinMapper {
    min: f64,
    max_exclusive: f64,
    bin_count: usize,
    kind: FeatureKind,
    randomized: bool,
    splits: SplitPoints,
}

impl BinMapper {
    /// Build a mapper from histogram parameters.
    ///
    /// Fails if the domain is empty or non-finite, if no bins were requested,
    /// if an integer or categorical domain has fractional bounds, or if the
    /// domain is too narrow to hold the requested number of distinct split
    /// points as `f64` values.
    pub fn new(params: &HistogramParams) -> Result<Self> {
        let (min, max_exclusive) = (params.min, params.max_exclusive);
        if !(min.is_finite() && max_exclusive.is_finite() && min < max_exclusive) {
            return Err(HistogramError::InvalidBounds {
                name: params.name.clone(),
                min,
                max_exclusive,
            });
        }
        let requested = params.requested_bins();
        if requested == 0 {
            return Err(HistogramError::InvalidBinCount {
                name: params.name.clone(),
            });
        }
        let integral = params.kind.is_integral();
        if integral && (min.fract() != 0.0 || max_exclusive.fract() != 0.0) {
            return Err(HistogramError::NonIntegralBounds {
                name: params.name.clone(),
                min,
                max_exclusive,
            });
        }

        let span = max_exclusive - min;
        if params.random_split_points && params.kind == FeatureKind::Categorical {
            warn!(
                "feature '{}': random split points are not used for categorical features",
                params.name
            );
        }

        let (bin_count, randomized, splits) = if integral && span <= requested as f64 {
            // One bin per integer value.
            let bin_count = span as usize;
            (bin_count, false, SplitPoints::Uniform { width: 1.0 })
        } else if params.random_split_points && params.kind == FeatureKind::Integer {
            let points = random_integer_split_points(min, max_exclusive, requested, params.seed);
            (requested, true, SplitPoints::Explicit(points))
        } else if params.random_split_points && params.kind == FeatureKind::Real {
            let points = random_real_split_points(min, max_exclusive, requested, params.seed);
            (requested, true, SplitPoints::Explicit(points))
        } else if integral {
            let points = integer_grid_split_points(min, max_exclusive, requested);
            (requested, false, SplitPoints::Explicit(points))
        } else {
            let width = span / requested as f64;
            (requested, false, SplitPoints::Uniform { width })
        };

        let mapper = BinMapper {
            min,
            max_exclusive,
            bin_count,
            kind: params.kind,
            randomized,
            splits,
        };
        if !mapper.is_strictly_increasing() {
            return Err(HistogramError::DomainTooNarrow {
                name: params.name.clone(),
                min,
                max_exclusive,
                bin_count,
            });
        }
        debug!(
            "feature '{}': {} bins over [{}, {}), {:?}, randomized={}",
            params.name, bin_count, min, max_exclusive, params.kind, randomized
        );
        Ok(mapper)
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max_exclusive(&self) -> f64 {
        self.max_exclusive
    }

    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    /// True if the split points were drawn at random.
    pub fn is_randomized(&self) -> bool {
        self.randomized
    }

    /// Index of the bin holding `value`.
    ///
    /// Never fails: values below `min` (and NaN) land in bin 0, values at or
    /// above `max_exclusive` land in the last bin.
    pub fn bin(&self, value: f64) -> usize {
        let last = self.bin_count - 1;
        match &self.splits {
            SplitPoints::Uniform { width } => {
                let scaled =
                    (value - self.min) / (self.max_exclusive - self.min) * self.bin_count as f64;
                if !(scaled > 0.0) {
                    return 0;
                }
                // Float to int casts saturate, so +inf clamps to `last` too.
                let mut index = (scaled as usize).min(last);
                // The estimate can be one bin off after rounding; settle on the
                // bin whose left edge `bin_at` reports.
                if index < last && self.uniform_edge(index + 1, *width) <= value {
                    index += 1;
                } else if index > 0 && self.uniform_edge(index, *width) > value {
                    index -= 1;
                }
                index
            }
            SplitPoints::Explicit(points) => points[..self.bin_count]
                .partition_point(|&p| p <= value)
                .saturating_sub(1),
        }
    }

    /// Representative value of a bin: its left edge.
    ///
    /// Panics if `index >= bin_count`.
    pub fn bin_at(&self, index: usize) -> f64 {
        assert!(
            index < self.bin_count,
            "bin index {} out of range for {} bins",
            index,
            self.bin_count
        );
        self.split_point(index)
    }

    /// Right edge of a bin, exclusive.
    ///
    /// Panics if `index >= bin_count`.
    pub fn upper_edge(&self, index: usize) -> f64 {
        assert!(
            index < self.bin_count,
            "bin index {} out of range for {} bins",
            index,
            self.bin_count
        );
        self.split_point(index + 1)
    }

    /// All `bin_count + 1` split points, from `min` to `max_exclusive`.
    pub fn split_points(&self) -> Vec<f64> {
        (0..=self.bin_count).map(|i| self.split_point(i)).collect()
    }

    fn split_point(&self, index: usize) -> f64 {
        match &self.splits {
            SplitPoints::Uniform { width } => {
                if index == self.bin_count {
                    self.max_exclusive
                } else {
                    self.uniform_edge(index, *width)
                }
            }
            SplitPoints::Explicit(points) => points[index],
        }
    }

    #[inline]
    fn uniform_edge(&self, index: usize, width: f64) -> f64 {
        self.min + index as f64 * width
    }

    fn is_strictly_increasing(&self) -> bool {
        self.split_points().windows(2).all(|pair| pair[0] < pair[1])
    }
}

/// Draw `bin_count - 1` interior split points uniformly from the domain.
/// Ties (and draws equal to `min`) are pushed up to the next representable
/// value, which keeps the result deterministic for a given seed.
fn random_real_split_points(
    min: f64,
    max_exclusive: f64,
    bin_count: usize,
    seed: u64,
) -> Box<[f64]> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let span = max_exclusive - min;
    let below_max = nextafter(max_exclusive, f64::NEG_INFINITY);

    let mut points = Vec::with_capacity(bin_count + 1);
    points.push(min);
    points.extend((1..bin_count).map(|_| (min + rng.gen::<f64>() * span).min(below_max)));
    points[1..].sort_by(f64::total_cmp);
    let nudged = nudge_apart(&mut points, |p| nextafter(p, f64::INFINITY));
    if nudged > 0 {
        debug!("nudged {} colliding split points in [{}, {})", nudged, min, max_exclusive);
    }
    points.push(max_exclusive);
    points.into_boxed_slice()
}

/// Largest integer span handled with exact integer arithmetic. Past 2^53
/// consecutive integers stop being distinct `f64` values.
const EXACT_SPAN_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Pick `bin_count - 1` distinct integers strictly inside the domain.
/// Requires `max_exclusive - min > bin_count`.
fn random_integer_split_points(
    min: f64,
    max_exclusive: f64,
    bin_count: usize,
    seed: u64,
) -> Box<[f64]> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let span = max_exclusive - min;

    let mut points = Vec::with_capacity(bin_count + 1);
    points.push(min);
    match usize::try_from(span as u64 - 1) {
        Ok(interior) if span <= EXACT_SPAN_LIMIT => {
            points.extend(
                index::sample(&mut rng, interior, bin_count - 1)
                    .into_iter()
                    .map(|offset| min + (offset + 1) as f64),
            );
            points[1..].sort_by(f64::total_cmp);
        }
        _ => {
            // Too wide to enumerate: draw real points and round them up onto
            // the integer grid.
            let lowest = (min + 1.0).max(nextafter(min, f64::INFINITY));
            let highest = (max_exclusive - 1.0).min(nextafter(max_exclusive, f64::NEG_INFINITY));
            points.extend(
                (1..bin_count)
                    .map(|_| (min + rng.gen::<f64>() * span).ceil().clamp(lowest, highest)),
            );
            points[1..].sort_by(f64::total_cmp);
            let nudged = nudge_apart(&mut points, |p| (p + 1.0).max(nextafter(p, f64::INFINITY)));
            if nudged > 0 {
                debug!("nudged {} colliding split points in [{}, {})", nudged, min, max_exclusive);
            }
        }
    }
    points.push(max_exclusive);
    points.into_boxed_slice()
}

/// Equal-width split points rounded up to whole numbers.
/// Requires `max_exclusive - min > bin_count`.
fn integer_grid_split_points(min: f64, max_exclusive: f64, bin_count: usize) -> Box<[f64]> {
    let span = max_exclusive - min;
    let exact = span <= EXACT_SPAN_LIMIT;
    let (whole_span, bins) = (span as u128, bin_count as u128);
    let width = span / bin_count as f64;
    (0..bin_count)
        .map(|i| {
            if exact {
                min + ((i as u128 * whole_span + bins - 1) / bins) as f64
            } else {
                (min + i as f64 * width).ceil()
            }
        })
        .chain(std::iter::once(max_exclusive))
        .collect()
}

/// Make sorted `points` strictly increasing by moving every point that does
/// not exceed its predecessor to `next(predecessor)`. Returns how many points
/// moved.
fn nudge_apart(points: &mut [f64], next: impl Fn(f64) -> f64) -> usize {
    let mut moved = 0;
    for i in 1..points.len() {
        if points[i] <= points[i - 1] {
            points[i] = next(points[i - 1]);
            moved += 1;
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const MAX_EX: f64 = 6.900000000000001;

    fn real(bins: usize, random: Option<u64>) -> BinMapper {
        let params = HistogramParams::new("x", 1.0, MAX_EX).with_bin_count(bins);
        let params = match random {
            Some(seed) => params.with_random_split_points(seed),
            None => params,
        };
        BinMapper::new(&params).unwrap()
    }

    #[rstest]
    #[case(None)]
    #[case(Some(0xDECAF))]
    #[case(Some(42))]
    fn test_scan_populates_every_bin(#[case] random: Option<u64>) {
        let (min, bins) = (1.0, 13);
        let mapper = real(bins, random);
        assert_eq!(mapper.bin_count(), bins);

        let n = 10_000_000;
        let mut first_value = vec![f64::NAN; bins];
        let mut current: Option<usize> = None;
        for i in 0..n {
            let value = min + i as f64 / n as f64 * (MAX_EX - min);
            let bin = mapper.bin(value);
            if current.map_or(true, |c| bin > c) {
                current = Some(bin);
                first_value[bin] = value;
            }
        }
        for (i, value) in first_value.iter().enumerate() {
            assert!(
                (value - mapper.bin_at(i)).abs() < 1e-6,
                "bin {}: first scanned value {} vs bin_at {}",
                i,
                value,
                mapper.bin_at(i)
            );
        }
        for i in 1..bins {
            assert!(mapper.bin_at(i - 1) < mapper.bin_at(i));
        }
    }

    #[rstest]
    #[case(None)]
    #[case(Some(1))]
    #[case(Some(99))]
    fn test_round_trip(#[case] random: Option<u64>) {
        for bins in [1, 2, 7, 13, 256] {
            let mapper = real(bins, random);
            for i in 0..bins {
                assert_eq!(mapper.bin(mapper.bin_at(i)), i);
                let below_upper = nextafter(mapper.upper_edge(i), f64::NEG_INFINITY);
                assert_eq!(mapper.bin(below_upper), i);
            }
        }
    }

    #[rstest]
    #[case(None)]
    #[case(Some(7))]
    fn test_clamps_out_of_range(#[case] random: Option<u64>) {
        let mapper = real(13, random);
        assert_eq!(mapper.bin(1.0), 0);
        assert_eq!(mapper.bin(0.0), 0);
        assert_eq!(mapper.bin(-1e300), 0);
        assert_eq!(mapper.bin(f64::NEG_INFINITY), 0);
        assert_eq!(mapper.bin(nextafter(MAX_EX, f64::NEG_INFINITY)), 12);
        assert_eq!(mapper.bin(MAX_EX), 12);
        assert_eq!(mapper.bin(1e300), 12);
        assert_eq!(mapper.bin(f64::INFINITY), 12);
        assert_eq!(mapper.bin(f64::NAN), 0);
    }

    #[test]
    fn test_uniform_left_edges() {
        let mapper = real(13, None);
        assert!(!mapper.is_randomized());
        let width = (MAX_EX - 1.0) / 13.0;
        for i in 0..13 {
            assert_eq!(mapper.bin_at(i), 1.0 + i as f64 * width);
        }
        let splits = mapper.split_points();
        assert_eq!(splits.len(), 14);
        assert_eq!(splits[0], 1.0);
        assert_eq!(splits[13], MAX_EX);
    }

    #[test]
    fn test_random_split_points_are_seeded() {
        let a = real(32, Some(5));
        let b = real(32, Some(5));
        let c = real(32, Some(6));
        assert!(a.is_randomized());
        assert_eq!(a.split_points(), b.split_points());
        assert_ne!(a.split_points(), c.split_points());
        let splits = a.split_points();
        assert_eq!(splits.len(), 33);
        assert_eq!(splits[0], 1.0);
        assert_eq!(splits[32], MAX_EX);
        assert!(splits.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn test_nudge_apart() {
        let mut points = vec![1.0, 1.0, 1.0, 2.0, 2.0];
        assert_eq!(nudge_apart(&mut points, |p| nextafter(p, f64::INFINITY)), 3);
        assert!(points.windows(2).all(|p| p[0] < p[1]));
        assert_eq!(points[1], nextafter(1.0, 2.0));
        assert_eq!(points[4], nextafter(2.0, 3.0));

        let mut integers = vec![4.0, 4.0, 5.0, 9.0];
        assert_eq!(nudge_apart(&mut integers, |p| p + 1.0), 2);
        assert_eq!(integers, vec![4.0, 5.0, 6.0, 9.0]);
    }

    #[test]
    fn test_random_split_points_in_crowded_domain() {
        // 4096 representable values, so some of the 63 draws are likely to collide.
        let max_exclusive = 1.0 + 4096.0 * f64::EPSILON;
        let params = HistogramParams::new("tight", 1.0, max_exclusive)
            .with_bin_count(64)
            .with_random_split_points(3);
        let mapper = BinMapper::new(&params).unwrap();
        let splits = mapper.split_points();
        assert!(splits.windows(2).all(|p| p[0] < p[1]));
        for i in 0..64 {
            assert_eq!(mapper.bin(mapper.bin_at(i)), i);
        }
    }

    #[test]
    fn test_small_integer_domain_gets_one_bin_per_value() {
        let params = HistogramParams::new("n", 0.0, 10.0)
            .with_bin_count(20)
            .with_kind(FeatureKind::Integer)
            .with_random_split_points(11);
        let mapper = BinMapper::new(&params).unwrap();
        assert_eq!(mapper.bin_count(), 10);
        assert!(!mapper.is_randomized());
        for v in 0..10 {
            assert_eq!(mapper.bin(v as f64), v);
            assert_eq!(mapper.bin(v as f64 + 0.7), v);
            assert_eq!(mapper.bin_at(v), v as f64);
        }
    }

    #[test]
    fn test_integer_grid_split_points() {
        let params = HistogramParams::new("n", 0.0, 100.0)
            .with_bin_count(7)
            .with_kind(FeatureKind::Integer);
        let mapper = BinMapper::new(&params).unwrap();
        assert_eq!(
            mapper.split_points(),
            vec![0.0, 15.0, 29.0, 43.0, 58.0, 72.0, 86.0, 100.0]
        );
        assert_eq!(mapper.bin(14.0), 0);
        assert_eq!(mapper.bin(14.99), 0);
        assert_eq!(mapper.bin(15.0), 1);
        assert_eq!(mapper.bin(99.0), 6);

        let wide = HistogramParams::new("wide", -1e300, 1e300)
            .with_bin_count(4)
            .with_kind(FeatureKind::Integer);
        let splits = BinMapper::new(&wide).unwrap().split_points();
        assert_eq!(splits.len(), 5);
        assert_eq!(splits[2], 0.0);
        assert_relative_eq!(splits[1], -5e299, max_relative = 1e-15);
        assert_relative_eq!(splits[3], 5e299, max_relative = 1e-15);
        assert!(splits.windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn test_random_integer_split_points_on_grid() {
        let params = HistogramParams::new("n", -500.0, 500.0)
            .with_bin_count(16)
            .with_kind(FeatureKind::Integer)
            .with_random_split_points(0xDECAF);
        let mapper = BinMapper::new(&params).unwrap();
        assert!(mapper.is_randomized());
        let splits = mapper.split_points();
        assert_eq!(splits.len(), 17);
        assert_eq!(splits[0], -500.0);
        assert_eq!(splits[16], 500.0);
        assert!(splits.iter().all(|s| s.fract() == 0.0));
        assert!(splits.windows(2).all(|p| p[0] < p[1]));
    }

    #[rstest]
    #[case(0.0, 1e20)]
    #[case(-4e18, 4e18)]
    #[case(-1e300, 1e300)]
    fn test_random_integer_split_points_cover_huge_span(
        #[case] min: f64,
        #[case] max_exclusive: f64,
    ) {
        let params = HistogramParams::new("wide", min, max_exclusive)
            .with_bin_count(16)
            .with_kind(FeatureKind::Integer)
            .with_random_split_points(3);
        let mapper = BinMapper::new(&params).unwrap();
        assert!(mapper.is_randomized());
        let splits = mapper.split_points();
        assert_eq!(splits.len(), 17);
        assert_eq!(splits[0], min);
        assert_eq!(splits[16], max_exclusive);
        assert!(splits.iter().all(|s| s.fract() == 0.0));
        assert!(splits.windows(2).all(|p| p[0] < p[1]));
        // Draws spread over the whole domain, not just its low end.
        let middle = min / 2.0 + max_exclusive / 2.0;
        assert!(splits[1] < middle);
        assert!(splits[15] > middle);
        for i in 0..16 {
            assert_eq!(mapper.bin(mapper.bin_at(i)), i);
        }
    }

    #[test]
    fn test_categorical_ignores_random_split_points() {
        let params = HistogramParams::new("color", 0.0, 5.0)
            .with_kind(FeatureKind::Categorical)
            .with_categorical_bin_count(32)
            .with_random_split_points(1);
        let mapper = BinMapper::new(&params).unwrap();
        assert_eq!(mapper.bin_count(), 5);
        assert!(!mapper.is_randomized());
        assert_eq!(mapper.bin(3.0), 3);

        let many = HistogramParams::new("zip", 0.0, 1000.0)
            .with_kind(FeatureKind::Categorical)
            .with_categorical_bin_count(10);
        let mapper = BinMapper::new(&many).unwrap();
        assert_eq!(mapper.bin_count(), 10);
        assert_eq!(mapper.bin(99.0), 0);
        assert_eq!(mapper.bin(100.0), 1);
    }

    #[test]
    fn test_construction_errors() {
        let ok = HistogramParams::new("x", 0.0, 1.0);
        assert!(matches!(
            BinMapper::new(&ok.clone().with_bin_count(0)),
            Err(HistogramError::InvalidBinCount { .. })
        ));
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", 1.0, 1.0)),
            Err(HistogramError::InvalidBounds { .. })
        ));
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", 2.0, 1.0)),
            Err(HistogramError::InvalidBounds { .. })
        ));
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", f64::NAN, 1.0)),
            Err(HistogramError::InvalidBounds { .. })
        ));
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", 0.0, f64::INFINITY)),
            Err(HistogramError::InvalidBounds { .. })
        ));
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", 0.5, 10.0).with_kind(FeatureKind::Integer)),
            Err(HistogramError::NonIntegralBounds { .. })
        ));

        let one_ulp = nextafter(1.0, 2.0);
        assert!(matches!(
            BinMapper::new(&HistogramParams::new("x", 1.0, one_ulp).with_bin_count(2)),
            Err(HistogramError::DomainTooNarrow { bin_count: 2, .. })
        ));
        assert!(matches!(
            BinMapper::new(
                &HistogramParams::new("x", 1.0, one_ulp)
                    .with_bin_count(3)
                    .with_random_split_points(9)
            ),
            Err(HistogramError::DomainTooNarrow { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn test_bin_at_out_of_range_panics() {
        real(4, None).bin_at(4);
    }

    proptest! {
        #[test]
        fn prop_bin_is_monotonic(
            a in 1.0..MAX_EX,
            b in 1.0..MAX_EX,
            bins in 1usize..300,
            seed in proptest::option::of(any::<u64>()),
        ) {
            let mapper = real(bins, seed);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(mapper.bin(lo) <= mapper.bin(hi));
            prop_assert!(mapper.bin(hi) < bins);
        }

        #[test]
        fn prop_round_trip_on_arbitrary_domain(
            min in -1e6..1e6f64,
            span in 1e-3..1e6f64,
            bins in 1usize..500,
            seed in proptest::option::of(any::<u64>()),
        ) {
            let mut params = HistogramParams::new("p", min, min + span).with_bin_count(bins);
            if let Some(seed) = seed {
                params = params.with_random_split_points(seed);
            }
            let mapper = BinMapper::new(&params).unwrap();
            for i in 0..mapper.bin_count() {
                prop_assert_eq!(mapper.bin(mapper.bin_at(i)), i);
            }
        }
    }
}
