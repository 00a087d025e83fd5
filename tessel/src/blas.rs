//! Reference single-tile kernels.
//!
//! These are plain loops, they define the numerical contract of each tile operation and are
//! what every execution target ends up calling. `uplo` always describes the triangle of
//! `op(A)`, not of the stored tile.

use crate::scalar::Scalar;
use crate::tile::Tile;
use crate::types::{Diag, Op, Side, Uplo};

/// Element `(i, j)` of the triangular `op(A)`, zero outside the triangle.
#[inline]
fn tri_at<T: Scalar>(a: &Tile<T>, op: Op, uplo: Uplo, diag: Diag, i: usize, j: usize) -> T {
    if i == j {
        return match diag {
            Diag::Unit => T::one(),
            Diag::NonUnit => a.at(op, i, i),
        };
    }
    let inside = match uplo {
        Uplo::Lower => i > j,
        Uplo::Upper => i < j,
    };
    if inside {
        a.at(op, i, j)
    } else {
        T::zero()
    }
}

/// `C = alpha op(A) op(B) + beta C`
pub fn gemm<T: Scalar>(
    alpha: T,
    op_a: Op,
    a: &Tile<T>,
    op_b: Op,
    b: &Tile<T>,
    beta: T,
    c: &mut Tile<T>,
) {
    let (m, k) = a.shape(op_a);
    let (kb, n) = b.shape(op_b);
    debug_assert_eq!(k, kb);
    debug_assert_eq!((m, n), (c.mb(), c.nb()));

    for j in 0..n {
        for i in 0..m {
            let mut sum = T::zero();
            for l in 0..k {
                sum += a.at(op_a, i, l) * b.at(op_b, l, j);
            }
            let cij = if beta == T::zero() {
                T::zero()
            } else {
                beta * c[(i, j)]
            };
            c[(i, j)] = alpha * sum + cij;
        }
    }
}

/// `B = alpha op(A) B` (left) or `B = alpha B op(A)` (right), with `op(A)` triangular.
pub fn trmm<T: Scalar>(
    side: Side,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    alpha: T,
    a: &Tile<T>,
    b: &mut Tile<T>,
) {
    let (m, n) = (b.mb(), b.nb());
    match side {
        Side::Left => {
            let mut col = vec![T::zero(); m];
            for j in 0..n {
                for (i, out) in col.iter_mut().enumerate() {
                    let mut sum = T::zero();
                    for l in 0..m {
                        sum += tri_at(a, op, uplo, diag, i, l) * b[(l, j)];
                    }
                    *out = sum;
                }
                for (i, value) in col.iter().enumerate() {
                    b[(i, j)] = alpha * *value;
                }
            }
        }
        Side::Right => {
            let mut row = vec![T::zero(); n];
            for i in 0..m {
                for (j, out) in row.iter_mut().enumerate() {
                    let mut sum = T::zero();
                    for l in 0..n {
                        sum += b[(i, l)] * tri_at(a, op, uplo, diag, l, j);
                    }
                    *out = sum;
                }
                for (j, value) in row.iter().enumerate() {
                    b[(i, j)] = alpha * *value;
                }
            }
        }
    }
}

/// Solve `op(A) X = alpha B` (left) or `X op(A) = alpha B` (right), `X` overwrites `B`.
pub fn trsm<T: Scalar>(
    side: Side,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    alpha: T,
    a: &Tile<T>,
    b: &mut Tile<T>,
) {
    let (m, n) = (b.mb(), b.nb());
    scale(alpha, b);
    let pivot = |k: usize| match diag {
        Diag::Unit => T::one(),
        Diag::NonUnit => a.at(op, k, k),
    };

    match (side, uplo) {
        (Side::Left, Uplo::Lower) => {
            for j in 0..n {
                for i in 0..m {
                    let mut x = b[(i, j)];
                    for l in 0..i {
                        x -= a.at(op, i, l) * b[(l, j)];
                    }
                    b[(i, j)] = x / pivot(i);
                }
            }
        }
        (Side::Left, Uplo::Upper) => {
            for j in 0..n {
                for i in (0..m).rev() {
                    let mut x = b[(i, j)];
                    for l in (i + 1)..m {
                        x -= a.at(op, i, l) * b[(l, j)];
                    }
                    b[(i, j)] = x / pivot(i);
                }
            }
        }
        (Side::Right, Uplo::Lower) => {
            for i in 0..m {
                for j in (0..n).rev() {
                    let mut x = b[(i, j)];
                    for l in (j + 1)..n {
                        x -= b[(i, l)] * a.at(op, l, j);
                    }
                    b[(i, j)] = x / pivot(j);
                }
            }
        }
        (Side::Right, Uplo::Upper) => {
            for i in 0..m {
                for j in 0..n {
                    let mut x = b[(i, j)];
                    for l in 0..j {
                        x -= b[(i, l)] * a.at(op, l, j);
                    }
                    b[(i, j)] = x / pivot(j);
                }
            }
        }
    }
}

/// LU factorization without pivoting, in place: unit lower `L` below the diagonal, `U` on and
/// above it. Returns the local index of the first exactly zero pivot, if any.
pub fn getrf_nopiv<T: Scalar>(a: &mut Tile<T>) -> Option<usize> {
    let n = a.mb().min(a.nb());
    let mut zero_pivot = None;
    for k in 0..n {
        let pivot = a[(k, k)];
        if pivot == T::zero() {
            zero_pivot.get_or_insert(k);
            continue;
        }
        for i in (k + 1)..a.mb() {
            a[(i, k)] /= pivot;
        }
        for j in (k + 1)..a.nb() {
            let akj = a[(k, j)];
            for i in (k + 1)..a.mb() {
                let aik = a[(i, k)];
                a[(i, j)] -= aik * akj;
            }
        }
    }
    zero_pivot
}

pub fn scale<T: Scalar>(alpha: T, b: &mut Tile<T>) {
    if alpha == T::one() {
        return;
    }
    for x in b.as_mut_slice() {
        *x *= alpha;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    fn lower(n: usize) -> Tile<f64> {
        Tile::from_fn(n, n, |i, j| if i >= j { 1.0 + (i + 2 * j) as f64 } else { 0.0 })
    }

    #[test]
    fn trsm_undoes_trmm_on_every_side_and_triangle() {
        let a = lower(4);
        let b0 = Tile::from_fn(4, 4, |i, j| (i as f64) - 0.5 * j as f64 + 1.0);
        for side in [Side::Left, Side::Right] {
            for (op, uplo) in [(Op::NoTrans, Uplo::Lower), (Op::ConjTrans, Uplo::Upper)] {
                for diag in [Diag::Unit, Diag::NonUnit] {
                    let mut b = b0.clone();
                    trmm(side, uplo, op, diag, 2.0, &a, &mut b);
                    trsm(side, uplo, op, diag, 0.5, &a, &mut b);
                    for (x, y) in b.as_slice().iter().zip(b0.as_slice()) {
                        assert_relative_eq!(*x, *y, epsilon = 1e-10);
                    }
                }
            }
        }
    }

    #[test]
    fn gemm_conj_trans_conjugates() {
        let a = Tile::from_col_major(1, 1, vec![Complex64::new(0.0, 1.0)]);
        let b = Tile::from_col_major(1, 1, vec![Complex64::new(0.0, 1.0)]);
        let mut c = Tile::zeros(1, 1);
        let (one, zero) = (Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0));
        gemm(one, Op::ConjTrans, &a, Op::NoTrans, &b, zero, &mut c);
        assert_eq!(c[(0, 0)], Complex64::new(1.0, 0.0));
    }

    #[test]
    fn getrf_reconstructs_the_input() {
        let a0 = Tile::from_fn(3, 3, |i, j| if i == j { 4.0 } else { 1.0 + (i * j) as f64 });
        let mut lu = a0.clone();
        assert_eq!(getrf_nopiv(&mut lu), None);

        let mut product = Tile::from_fn(3, 3, |i, j| if i <= j { lu[(i, j)] } else { 0.0 });
        trmm(Side::Left, Uplo::Lower, Op::NoTrans, Diag::Unit, 1.0, &lu, &mut product);
        for (x, y) in product.as_slice().iter().zip(a0.as_slice()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn getrf_reports_the_first_zero_pivot() {
        let mut a = Tile::from_col_major(2, 2, vec![0.0, 1.0, 1.0, 1.0]);
        assert_eq!(getrf_nopiv(&mut a), Some(0));
    }
}
