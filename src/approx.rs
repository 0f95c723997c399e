//! Utilities to approximate equality of floating point values.
//!
//! Used to compare the two execution strategies and to check analytic
//! gradients against finite differences. Distances are relative to the
//! magnitude of the operands once that magnitude exceeds one, absolute below.

use crate::tensors::Element;

/// The max epsilon accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected epsilon accepted on `f32`s.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// The best expected epsilon accepted on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// The max epsilon accepted on `f64`s.
pub const F64_MAX_ERROR: f64 = 1e-3;

/// The expected epsilon accepted on `f64`s.
pub const F64_AVG_ERROR: f64 = 1e-6;

/// The best expected epsilon accepted on `f64`s.
pub const F64_MIN_ERROR: f64 = 1e-13;

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,
    /// Good epsilon.
    Partial = 1,
    /// Acceptable epsilon.
    Relative = 2,
    /// No relative equality.
    Scarce = 3,
}

/// Relative distance `|a - b| / max(1, |a|, |b|)`.
#[must_use]
pub fn relative_distance<T: Element>(a: T, b: T) -> f64 {
    let (a, b) = (a.into_f64(), b.into_f64());
    if a == b {
        // also covers matching infinities
        return 0.0;
    }
    (a - b).abs() / 1f64.max(a.abs()).max(b.abs())
}

/// Checks the relative distance based off epsilon.
pub trait RelativeEq<Rhs: ?Sized> {
    /// Enumerates the equality of `self`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = relative_distance(*self, *rhs);

        if dif < f64::from(F32_MIN_ERROR) {
            ApproxEquality::Precise
        } else if dif < f64::from(F32_AVG_ERROR) {
            ApproxEquality::Partial
        } else if dif < f64::from(F32_MAX_ERROR) {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq<Self> for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = relative_distance(*self, *rhs);

        if dif < F64_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F64_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F64_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl<T: RelativeEq<T>> RelativeEq<[T]> for [T] {
    /// The worst rating over all element pairs. Length mismatch is `Scarce`.
    fn approx_eq(&self, rhs: &[T]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (t_val, u_val) in self.iter().zip(rhs.iter()) {
            eq = eq.max(t_val.approx_eq(u_val));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

/// Approximates equality at the `Relative` level or better.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}

/// Largest [`relative_distance`] over two equally long slices.
///
/// # Panics
/// Panics if the lengths differ.
#[must_use]
pub fn max_relative_error<T: Element>(a: &[T], b: &[T]) -> f64 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    a.iter()
        .zip(b)
        .map(|(&x, &y)| relative_distance(x, y))
        .fold(0.0, f64::max)
}
