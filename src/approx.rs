//! Utilities to approximate equality of floating point buffers.
//!
//! Backends reduce in different orders, so their outputs are compared with an
//! absolute tolerance instead of bit equality.

use crate::tensors::{FeatureMap, TensorFloat};

/// Tolerance required between any backend and the naive reference.
pub const BACKEND_TOLERANCE: TensorFloat = F32_AVG_ERROR;

/// Loosest tolerance still considered "relatively equal".
pub const F32_MAX_ERROR: TensorFloat = 1e-3;

/// Tolerance for results that went through a long reduction.
pub const F32_AVG_ERROR: TensorFloat = 1e-5;

/// Tolerance for results that should be nearly exact.
pub const F32_MIN_ERROR: TensorFloat = 1e-6;

/// The approximated equality enumerated, best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F32_MIN_ERROR`].
    Precise = 0,
    /// Within [`F32_AVG_ERROR`].
    Partial = 1,
    /// Within [`F32_MAX_ERROR`].
    Relative = 2,
    /// Not equal by any tolerance, or the shapes differ.
    Scarce = 3,
}

impl ApproxEquality {
    /// Grades an absolute difference.
    #[must_use]
    pub fn grade(diff: TensorFloat) -> Self {
        if diff < F32_MIN_ERROR {
            Self::Precise
        } else if diff < F32_AVG_ERROR {
            Self::Partial
        } else if diff < F32_MAX_ERROR {
            Self::Relative
        } else {
            Self::Scarce
        }
    }
}

/// Checks the distance between two values or buffers.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// Largest absolute elementwise difference, or `None` if the shapes differ.
    fn max_abs_diff(&self, rhs: &Rhs) -> Option<TensorFloat>;

    /// Worst elementwise grade.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality {
        self.max_abs_diff(rhs)
            .map_or(ApproxEquality::Scarce, ApproxEquality::grade)
    }
}

impl RelativeEq for TensorFloat {
    fn max_abs_diff(&self, rhs: &Self) -> Option<TensorFloat> {
        Some((self - rhs).abs())
    }
}

impl RelativeEq for [TensorFloat] {
    fn max_abs_diff(&self, rhs: &Self) -> Option<TensorFloat> {
        if self.len() != rhs.len() {
            return None;
        }
        // NaN on either side is never close
        self.iter().zip(rhs).try_fold(0.0, |worst: TensorFloat, (a, b)| {
            let d = (a - b).abs();
            if d.is_nan() { None } else { Some(worst.max(d)) }
        })
    }
}

impl RelativeEq for FeatureMap {
    fn max_abs_diff(&self, rhs: &Self) -> Option<TensorFloat> {
        if self.shape() != rhs.shape() {
            return None;
        }
        self.data().max_abs_diff(rhs.data())
    }
}

/// `true` if `a` and `b` have the same shape and every element differs by at
/// most `tol`.
pub fn all_close<T: RelativeEq + ?Sized>(a: &T, b: &T, tol: TensorFloat) -> bool {
    a.max_abs_diff(b).is_some_and(|d| d <= tol)
}
