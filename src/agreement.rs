/// Maximum per-bin relative error tolerated between reduced-precision and
/// full-precision sums.
pub const ACCURACY_BOUND: f64 = 1e-6;

/// Records how closely a proxy tracks a measurement, bin by bin.
///
/// Used to watch the accuracy given up by reduced-precision accumulation:
/// the full-precision sum is the measure and the reduced-precision sum is
/// the proxy. It also compares two runs of the same accumulation, where any
/// difference at all means the runs were not reproducible.
#[derive(Clone, Copy, Debug)]
pub struct Agreement {
    /// Cumulative counts of how similar a measure is with its proxy.
    ///   - Index 0 is the count of comparisons made.
    ///   - Index p (1 to 30) counts comparisons with relative error <= 1/2^p.
    ///   - Index 31 counts exact matches.
    cumulative_similarity: [usize; 32],

    /// Largest relative error seen so far.
    worst: f64,
}

impl Default for Agreement {
    fn default() -> Self {
        Agreement::new()
    }
}

impl Agreement {
    pub fn new() -> Self {
        Agreement {
            cumulative_similarity: [0; 32],
            worst: 0.0,
        }
    }

    /// Compare two equally long sequences of sums, element by element.
    pub fn of(measures: &[f64], proxies: &[f64]) -> Self {
        assert_eq!(measures.len(), proxies.len(), "compared sequences differ in length");
        let mut agreement = Agreement::new();
        for (&measure, &proxy) in measures.iter().zip(proxies) {
            agreement.add(measure, proxy);
        }
        agreement
    }

    /// Compare one measure with its proxy.
    pub fn add(&mut self, measure: f64, proxy: f64) {
        self.cumulative_similarity[0] += 1;
        let error = relative_error(measure, proxy);
        self.worst = self.worst.max(error);
        let mut bound = 0.5;
        for count in self.cumulative_similarity[1..31].iter_mut() {
            if error > bound {
                break;
            }
            *count += 1;
            bound /= 2.0;
        }
        if error == 0.0 {
            self.cumulative_similarity[31] += 1;
        }
    }

    /// Number of comparisons recorded.
    pub fn count(&self) -> usize {
        self.cumulative_similarity[0]
    }

    /// Largest relative error recorded, or zero if nothing was compared.
    pub fn max_relative_error(&self) -> f64 {
        self.worst
    }

    /// True if every proxy matched its measure bit for bit.
    pub fn is_exact(&self) -> bool {
        self.cumulative_similarity[31] == self.cumulative_similarity[0]
    }

    /// Fraction of comparisons in [0,1] where the proxy matched exactly.
    pub fn matches_exactly(&self) -> f64 {
        self.fraction(31)
    }

    /// Fraction of comparisons in [0,1] with relative error <= 1/2^power.
    /// Powers above 30 ask for exact matches.
    pub fn matches_approximately(&self, power: usize) -> f64 {
        self.fraction(power.clamp(1, 31))
    }

    /// True if no comparison had relative error above `bound`.
    pub fn within(&self, bound: f64) -> bool {
        self.worst <= bound
    }

    fn fraction(&self, slot: usize) -> f64 {
        match self.cumulative_similarity[0] {
            0 => 0.0,
            total => self.cumulative_similarity[slot] as f64 / total as f64,
        }
    }
}

/// `|proxy - measure| / |measure|`. Two zeros agree exactly; a nonzero proxy
/// for a zero measure, or a NaN on either side, is infinitely wrong.
pub fn relative_error(measure: f64, proxy: f64) -> f64 {
    if measure == proxy {
        0.0
    } else if measure == 0.0 || measure.is_nan() || proxy.is_nan() {
        f64::INFINITY
    } else {
        (proxy - measure).abs() / measure.abs()
    }
}
