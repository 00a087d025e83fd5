//! Matrix norms of distributed matrices.

use num_traits::{Float, One, Zero};
use tracing::debug;

use crate::comm::Collective;
use crate::error::Result;
use crate::matrix::Matrix;
use crate::scalar::{Real, Scalar};
use crate::types::Norm;

/// Largest value, NaN if any value is NaN.
fn nan_max<R: Real>(values: impl IntoIterator<Item = R>) -> R {
    values.into_iter().fold(R::zero(), |acc, x| {
        if x.is_nan() || acc.is_nan() {
            R::nan()
        } else {
            Float::max(acc, x)
        }
    })
}

/// Sum of squares kept as `scale^2 * ssq`, so that large or tiny entries neither overflow nor
/// underflow.
#[derive(Clone, Copy, Debug)]
struct SumSquares<R> {
    scale: R,
    ssq: R,
}

impl<R: Real> SumSquares<R> {
    fn new() -> Self {
        Self {
            scale: R::zero(),
            ssq: R::one(),
        }
    }

    /// Add `x^2`, for `x >= 0`.
    fn push(self, x: R) -> Self {
        self.merge(Self {
            scale: x,
            ssq: R::one(),
        })
    }

    fn merge(self, other: Self) -> Self {
        if self.scale.is_nan() || other.scale.is_nan() {
            return Self {
                scale: R::nan(),
                ssq: R::one(),
            };
        }
        if other.scale.is_zero() {
            return self;
        }
        if self.scale.is_zero() {
            return other;
        }
        let (big, small) = if self.scale >= other.scale {
            (self, other)
        } else {
            (other, self)
        };
        if big.scale.is_infinite() {
            return big;
        }
        let ratio = small.scale / big.scale;
        Self {
            scale: big.scale,
            ssq: big.ssq + small.ssq * ratio * ratio,
        }
    }

    fn value(self) -> R {
        self.scale * Float::sqrt(self.ssq)
    }
}

/// `norm` of `A` as seen through its view. Collective over `A`'s group, every rank gets the same
/// value.
pub fn norm<T: Scalar>(norm: Norm, a: &Matrix<T>) -> Result<T::Real> {
    let op = a.op();
    let comm = a.comm();

    let value = match norm {
        Norm::Max => {
            let local = nan_max(a.local_tiles().flat_map(|(_, handle)| {
                let tile = handle.lock();
                tile.as_slice().iter().map(|&x| Scalar::abs(x)).collect::<Vec<_>>()
            }));
            nan_max(comm.all_gather(local)?)
        }

        // Column sums (One) or row sums (Inf) of |a_ij|, reduced in rank order.
        Norm::One | Norm::Inf => {
            let by_column = norm == Norm::One;
            let len = if by_column { a.n() } else { a.m() };
            let mut sums = vec![T::Real::zero(); len];
            for ((i, j), handle) in a.local_tiles() {
                let tile = handle.lock();
                let (row0, col0) = (a.row_offset(i), a.col_offset(j));
                let (mb, nb) = tile.shape(op);
                for jj in 0..nb {
                    for ii in 0..mb {
                        let slot = if by_column { col0 + jj } else { row0 + ii };
                        sums[slot] += Scalar::abs(tile.at(op, ii, jj));
                    }
                }
            }
            let gathered = comm.all_gather(sums)?;
            let mut total = vec![T::Real::zero(); len];
            for sums in gathered {
                for (acc, x) in total.iter_mut().zip(sums) {
                    *acc += x;
                }
            }
            nan_max(total)
        }

        // Each rank scales its own sum of squares, the pairs are merged in rank order.
        Norm::Fro => {
            let local = a
                .local_tiles()
                .fold(SumSquares::new(), |acc, (_, handle)| {
                    let tile = handle.lock();
                    tile.as_slice()
                        .iter()
                        .fold(acc, |acc, &x| acc.push(Scalar::abs(x)))
                });
            comm.all_gather((local.scale, local.ssq))?
                .into_iter()
                .fold(SumSquares::new(), |acc, (scale, ssq)| acc.merge(SumSquares { scale, ssq }))
                .value()
        }
    };
    debug!(?norm, value = value.as_f64(), "norm");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{spawn_group, SelfComm};
    use approx::assert_relative_eq;
    use num_complex::Complex;

    fn sample(i: usize, j: usize) -> f64 {
        (i as f64 + 1.0) * if (i + j) % 2 == 0 { 1.0 } else { -2.0 }
    }

    #[test]
    fn norms_of_a_small_matrix() {
        // [ 1 -2  1 ]
        // [-4  2 -4 ]
        let mut a = Matrix::uniform(2, 3, 2, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(sample);
        assert_eq!(norm(Norm::Max, &a).unwrap(), 4.0);
        assert_eq!(norm(Norm::One, &a).unwrap(), 5.0);
        assert_eq!(norm(Norm::Inf, &a).unwrap(), 10.0);
        assert_relative_eq!(norm(Norm::Fro, &a).unwrap(), 42.0_f64.sqrt());
        // One and Inf swap under a transposed view.
        assert_eq!(norm(Norm::One, &a.conj_transpose()).unwrap(), 10.0);
    }

    #[test]
    fn complex_entries_use_the_modulus() {
        let mut a = Matrix::uniform(1, 1, 1, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|_, _| Complex::new(3.0_f32, 4.0));
        assert_eq!(norm(Norm::One, &a).unwrap(), 5.0);
    }

    #[test]
    fn distributed_norm_agrees_with_one_rank() {
        let mut a = Matrix::uniform(7, 5, 2, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(sample);
        let want = norm(Norm::One, &a).unwrap();
        let got = spawn_group(4, |comm| {
            let mut a = Matrix::uniform(7, 5, 2, 2, 2, comm).unwrap();
            a.fill_with(sample);
            norm(Norm::One, &a).unwrap()
        })
        .unwrap();
        assert_eq!(got, vec![want; 4]);
    }

    #[test]
    fn frobenius_does_not_overflow() {
        let want = 1e200 * 6.0_f64.sqrt();
        let mut a = Matrix::uniform(3, 2, 1, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|_, _| 1e200);
        assert_relative_eq!(norm(Norm::Fro, &a).unwrap(), want, max_relative = 1e-14);

        let got = spawn_group(3, |comm| {
            let mut a = Matrix::uniform(3, 2, 1, 3, 1, comm).unwrap();
            a.fill_with(|i, j| if (i + j) % 2 == 0 { 1e200 } else { -1e200 });
            norm(Norm::Fro, &a).unwrap()
        })
        .unwrap();
        for value in got {
            assert_relative_eq!(value, want, max_relative = 1e-14);
        }

        // Tiny entries are not flushed to zero either.
        a.fill_with(|_, _| 1e-200);
        assert_relative_eq!(norm(Norm::Fro, &a).unwrap(), 1e-200 * 6.0_f64.sqrt(), max_relative = 1e-14);
    }

    #[test]
    fn frobenius_of_infinite_and_nan_entries() {
        let mut a = Matrix::uniform(2, 2, 1, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|i, _| if i == 0 { f64::INFINITY } else { 1.0 });
        assert_eq!(norm(Norm::Fro, &a).unwrap(), f64::INFINITY);
        a.fill_with(|i, j| if (i, j) == (1, 1) { f64::NAN } else { f64::INFINITY });
        assert!(norm(Norm::Fro, &a).unwrap().is_nan());
    }

    #[test]
    fn nan_propagates() {
        let mut a = Matrix::uniform(2, 2, 1, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|i, _| if i == 1 { f64::NAN } else { 1.0 });
        assert!(norm(Norm::Max, &a).unwrap().is_nan());
    }
}
