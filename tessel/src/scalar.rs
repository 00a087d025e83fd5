//! Element types the engine is generic over.
//!
//! The four BLAS precisions share one algorithmic path, the only difference being `conj` (the
//! identity for real types) and the notion of magnitude used by the norm estimator.

use num_complex::Complex;
use num_traits::{Float, NumAssign};
use std::fmt::Debug;
use std::ops::Neg;

/// A value that can be stored in a tile.
pub trait Element: Clone + Default + Send + Sync + Debug + 'static {}

impl<T> Element for T where T: Clone + Default + Send + Sync + Debug + 'static {}

/// One of f32, f64, Complex<f32>, Complex<f64>.
pub trait Scalar: Element + Copy + PartialEq + NumAssign + Neg<Output = Self> {
    /// The underlying real type.
    type Real: Real;

    const IS_COMPLEX: bool;

    fn conj(self) -> Self;

    /// Modulus, `|x|`.
    fn abs(self) -> Self::Real;

    fn re(self) -> Self::Real;

    fn from_real(re: Self::Real) -> Self;
}

/// f32 or f64.
pub trait Real: Scalar<Real = Self> + Float {
    /// Lossy conversion used for algorithm constants.
    fn of(x: f64) -> Self;

    fn as_f64(self) -> f64;
}

macro_rules! impl_real {
    ($t:ty) => {
        impl Scalar for $t {
            type Real = $t;
            const IS_COMPLEX: bool = false;

            #[inline]
            fn conj(self) -> Self {
                self
            }

            #[inline]
            fn abs(self) -> Self::Real {
                <$t>::abs(self)
            }

            #[inline]
            fn re(self) -> Self::Real {
                self
            }

            #[inline]
            fn from_real(re: Self::Real) -> Self {
                re
            }
        }

        impl Real for $t {
            #[inline]
            fn of(x: f64) -> Self {
                x as $t
            }

            #[inline]
            fn as_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

macro_rules! impl_complex {
    ($t:ty) => {
        impl Scalar for Complex<$t> {
            type Real = $t;
            const IS_COMPLEX: bool = true;

            #[inline]
            fn conj(self) -> Self {
                Complex::conj(&self)
            }

            #[inline]
            fn abs(self) -> Self::Real {
                self.norm()
            }

            #[inline]
            fn re(self) -> Self::Real {
                self.re
            }

            #[inline]
            fn from_real(re: Self::Real) -> Self {
                Complex::new(re, 0.0)
            }
        }
    };
}

impl_real!(f32);
impl_real!(f64);
impl_complex!(f32);
impl_complex!(f64);

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    #[test]
    fn conj_is_identity_on_reals() {
        assert_eq!(Scalar::conj(-2.5_f64), -2.5);
        assert_eq!(Scalar::conj(Complex64::new(1.0, 2.0)), Complex64::new(1.0, -2.0));
    }

    #[test]
    fn abs_is_the_modulus() {
        assert_eq!(Scalar::abs(Complex64::new(3.0, 4.0)), 5.0);
        assert_eq!(Scalar::abs(-3.0_f32), 3.0);
    }
}
