//! Lock-free per-bin accumulation of `f64` statistics.
//!
//! Each slot stores the bit pattern of an `f64` inside an `AtomicU64`.
//! Adding is a compare-and-swap retry loop: read the current bits, compute the
//! new sum, and try to publish it; if another writer got there first, retry
//! with the value it left behind. No locks are taken, and some writer always
//! makes progress.
//!
//! # Reproducibility
//!
//! Floating-point addition is not associative, so with full `f64`
//! contributions the final sum depends on the order in which concurrent
//! writers happen to land. With [`Precision::Reduced`] every contribution is
//! first rounded to `f32`. Such values carry 24 significant bits, so their
//! sums stay exact in the 53-bit `f64` accumulator as long as the ratio
//! between a bin's total and its smallest contribution stays below about 2^29.
//! Exact sums are independent of order, so repeated runs agree bit for bit.
//! The price is the rounding of each input, a relative error of at most
//! 2^-24 per contribution.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Precision of the contributions added to an accumulator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Contributions are rounded to `f32` before they are added.
    /// Sums are reproducible under any interleaving. Magnitudes beyond the
    /// `f32` range become infinite.
    #[default]
    Reduced,
    /// Contributions are added as given. Sums depend on arrival order.
    Full,
}

impl Precision {
    /// Round a contribution to this precision.
    #[inline]
    pub fn narrow(self, contribution: f64) -> f64 {
        match self {
            Precision::Reduced => contribution as f32 as f64,
            Precision::Full => contribution,
        }
    }
}

/// Fixed-size array of `f64` slots that many threads may add to at once.
///
/// Writers share it by reference (`&ConcurrentAccumulator` is all that
/// [`add`](Self::add) needs). Reads made while writers are still running see
/// some intermediate state; read after all writers have been joined.
#[derive(Debug)]
pub struct ConcurrentAccumulator {
    slots: Box<[AtomicU64]>,
    precision: Precision,
}

impl ConcurrentAccumulator {
    /// Create `len` zeroed slots.
    pub fn new(len: usize, precision: Precision) -> Self {
        ConcurrentAccumulator {
            slots: (0..len).map(|_| AtomicU64::new(0.0_f64.to_bits())).collect(),
            precision,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Atomically add `contribution` (narrowed to this accumulator's
    /// precision) to slot `index`.
    ///
    /// Panics if `index` is out of range.
    #[inline]
    pub fn add(&self, index: usize, contribution: f64) {
        atomic_add_f64(&self.slots[index], self.precision.narrow(contribution));
    }

    /// Current value of slot `index`.
    pub fn get(&self, index: usize) -> f64 {
        f64::from_bits(self.slots[index].load(Ordering::Relaxed))
    }

    /// Copy of every slot.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Consume the accumulator and return its sums.
    pub fn into_vec(self) -> Vec<f64> {
        self.slots
            .into_vec()
            .into_iter()
            .map(|slot| f64::from_bits(slot.into_inner()))
            .collect()
    }

    /// Add every slot of `other` into the matching slot of `self`.
    ///
    /// The other accumulator's sums are already rounded to the shared
    /// precision, so they are added without narrowing again.
    /// Panics if the lengths or precisions differ.
    pub fn merge_from(&self, other: &ConcurrentAccumulator) {
        assert_eq!(self.len(), other.len(), "accumulator lengths differ");
        assert_eq!(self.precision, other.precision, "accumulator precisions differ");
        for (mine, theirs) in self.slots.iter().zip(other.slots.iter()) {
            let value = f64::from_bits(theirs.load(Ordering::Relaxed));
            if value != 0.0 {
                atomic_add_f64(mine, value);
            }
        }
    }
}

/// Lock-free `*cell += delta` on an `f64` stored as bits.
#[inline]
pub(crate) fn atomic_add_f64(cell: &AtomicU64, delta: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + delta).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Lock-free `*cell = min(*cell, value)`. A NaN cell counts as empty.
pub(crate) fn atomic_min_f64(cell: &AtomicU64, value: f64) {
    update_if(cell, value, |current| current.is_nan() || value < current);
}

/// Lock-free `*cell = max(*cell, value)`. A NaN cell counts as empty.
pub(crate) fn atomic_max_f64(cell: &AtomicU64, value: f64) {
    update_if(cell, value, |current| current.is_nan() || value > current);
}

fn update_if(cell: &AtomicU64, value: f64, replace: impl Fn(f64) -> bool) {
    let mut current = cell.load(Ordering::Relaxed);
    while replace(f64::from_bits(current)) {
        match cell.compare_exchange_weak(
            current,
            value.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}
