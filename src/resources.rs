//! Multi-dimensional resource quantities and their algebra
//!
//! `ResourceVector` is the quantity type every capacity computation in this
//! crate is built on: node allocatable, pod demand, pool shapes, and
//! reservation sizes are all expressed as one. All operations are
//! componentwise unless stated otherwise, and all of them return new values;
//! a vector has no identity beyond its components.

use serde::{Deserialize, Serialize};

/// A quantity of compute resources across five dimensions.
///
/// The additive identity is the all-zero vector (also the `Default`).
/// Comparisons (`less_than`, `greater_than`, `greater_than_or_equal`) hold
/// only when **every** dimension satisfies them, so two vectors can easily be
/// mutually incomparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU cores
    #[serde(rename = "cpu")]
    pub cpu: i64,

    /// GPU devices
    #[serde(rename = "gpu")]
    pub gpu: i64,

    /// Memory in megabytes
    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,

    /// Ephemeral disk in megabytes
    #[serde(rename = "diskMB")]
    pub disk_mb: i64,

    /// Network bandwidth in Mbps
    #[serde(rename = "networkMBPS")]
    pub network_mbps: i64,
}

impl ResourceVector {
    /// The all-zero vector.
    pub const fn zero() -> Self {
        Self {
            cpu: 0,
            gpu: 0,
            memory_mb: 0,
            disk_mb: 0,
            network_mbps: 0,
        }
    }

    /// Apply a binary operation to each dimension pair.
    fn combine(self, other: ResourceVector, f: impl Fn(i64, i64) -> i64) -> ResourceVector {
        ResourceVector {
            cpu: f(self.cpu, other.cpu),
            gpu: f(self.gpu, other.gpu),
            memory_mb: f(self.memory_mb, other.memory_mb),
            disk_mb: f(self.disk_mb, other.disk_mb),
            network_mbps: f(self.network_mbps, other.network_mbps),
        }
    }

    /// True when a predicate holds for each dimension pair.
    fn all(self, other: ResourceVector, f: impl Fn(i64, i64) -> bool) -> bool {
        f(self.cpu, other.cpu)
            && f(self.gpu, other.gpu)
            && f(self.memory_mb, other.memory_mb)
            && f(self.disk_mb, other.disk_mb)
            && f(self.network_mbps, other.network_mbps)
    }

    pub fn add(self, other: ResourceVector) -> ResourceVector {
        self.combine(other, |a, b| a + b)
    }

    /// Componentwise subtraction, unbounded: dimensions may go negative.
    ///
    /// This is intentional for bookkeeping deltas. Callers that need
    /// non-negative results must use [`ResourceVector::sub_with_limit`].
    pub fn sub(self, other: ResourceVector) -> ResourceVector {
        self.combine(other, |a, b| a - b)
    }

    /// Componentwise subtraction with every resulting dimension clamped to
    /// `floor`.
    pub fn sub_with_limit(self, other: ResourceVector, floor: i64) -> ResourceVector {
        self.combine(other, |a, b| (a - b).max(floor))
    }

    /// Scalar multiplication.
    pub fn multiply(self, factor: i64) -> ResourceVector {
        self.combine(ResourceVector::zero(), |a, _| a * factor)
    }

    /// Scalar division, truncating toward zero per dimension. A zero divisor
    /// yields the zero vector rather than failing.
    pub fn divide(self, divisor: i64) -> ResourceVector {
        if divisor == 0 {
            return ResourceVector::zero();
        }
        self.combine(ResourceVector::zero(), |a, _| a / divisor)
    }

    /// True only if every dimension of `self` is strictly below `other`.
    pub fn less_than(self, other: ResourceVector) -> bool {
        self.all(other, |a, b| a < b)
    }

    /// True only if every dimension of `self` is strictly above `other`.
    pub fn greater_than(self, other: ResourceVector) -> bool {
        self.all(other, |a, b| a > b)
    }

    /// True only if every dimension of `self` is at or above `other`.
    /// Equal vectors satisfy this.
    pub fn greater_than_or_equal(self, other: ResourceVector) -> bool {
        self.all(other, |a, b| a >= b)
    }

    pub fn is_any_above_zero(self) -> bool {
        self.cpu > 0 || self.gpu > 0 || self.memory_mb > 0 || self.disk_mb > 0 || self.network_mbps > 0
    }

    fn dimensions(self) -> [i64; 5] {
        [self.cpu, self.gpu, self.memory_mb, self.disk_mb, self.network_mbps]
    }

    /// The highest per-dimension utilization ratio of `self` against `total`.
    ///
    /// Dimensions where `total` is zero contribute nothing. This is the
    /// dimension-of-maximum-contention view used to report "percent used"
    /// conservatively: a pool that is CPU-bound reports its CPU ratio even if
    /// memory is mostly idle.
    pub fn max_ratio(self, total: ResourceVector) -> f64 {
        self.dimensions()
            .iter()
            .zip(total.dimensions().iter())
            .filter(|(_, t)| **t != 0)
            .map(|(u, t)| *u as f64 / *t as f64)
            .fold(0.0, f64::max)
    }

    /// Rescale `self` so every dimension matches the utilization ratio of the
    /// most contended dimension relative to `capacity`.
    ///
    /// The dominant dimension is preserved; every other dimension is scaled up
    /// to the same ratio and never below its unaligned value. Subtracting the
    /// aligned vector from `capacity` therefore reports no leftover in
    /// dimensions that are practically unusable because the dominant one is
    /// exhausted, which keeps scale decisions from oscillating on rounding
    /// noise.
    pub fn align_resource_ratios(self, capacity: ResourceVector) -> ResourceVector {
        let ratio = self.max_ratio(capacity);
        if ratio == 0.0 {
            return self;
        }
        self.combine(capacity, |used, cap| {
            used.max((cap as f64 * ratio).round() as i64)
        })
    }

    /// Estimate how many `unit`-sized chunks are needed to cover `self`,
    /// taking the ceiling per dimension and the maximum across dimensions.
    /// Dimensions where `unit` is zero are skipped.
    pub fn split_by_with_ceil(self, unit: ResourceVector) -> i64 {
        self.dimensions()
            .iter()
            .zip(unit.dimensions().iter())
            .filter(|(_, u)| **u > 0)
            .map(|(t, u)| {
                if *t <= 0 {
                    0
                } else {
                    (*t + *u - 1) / *u
                }
            })
            .max()
            .unwrap_or(0)
    }
}
