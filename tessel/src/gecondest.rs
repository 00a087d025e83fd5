//! Reciprocal condition number of an LU-factored matrix.

use num_traits::{Float, One, Zero};
use tracing::{debug, debug_span, trace};

use crate::error::{Error, Result};
use crate::matrix::{Matrix, TriangularMatrix};
use crate::norm1est::{norm1est, synchronize, EstimatorState, Step};
use crate::options::Options;
use crate::scalar::{Real, Scalar};
use crate::trsm::trsm;
use crate::types::{Diag, Norm, Side, Uplo};

const OP: &str = "gecondest";

/// Estimate `1 / (||A^-1|| ||A||)` in the One or Inf norm.
///
/// `a` holds the factors of `A = L U` (`L` unit lower, `U` upper, as left by `getrf_nopiv`) and
/// `anorm` is `||A||` in the same norm. Collective over `a`'s group; invalid arguments are
/// reported before any communication.
pub fn gecondest<T: Scalar>(
    norm: Norm,
    a: &Matrix<T>,
    anorm: T::Real,
    opts: &Options,
) -> Result<T::Real> {
    // The estimator gives ||.||_1, applying the adjoint operator instead gives ||.||_inf.
    let kase1 = match norm {
        Norm::One => 1,
        Norm::Inf => 2,
        Norm::Max | Norm::Fro => return Err(Error::InvalidNorm { op: OP, norm }),
    };
    if anorm.is_nan() || anorm < T::Real::zero() {
        return Err(Error::InvalidAnorm(anorm.as_f64()));
    }
    let target = opts.target()?;
    if a.mt() != a.nt() || (0..a.mt()).any(|k| a.tile_mb(k) != a.tile_nb(k)) {
        return Err(Error::mismatch(
            OP,
            format!("A must be square with square diagonal tiles, is {} x {}", a.m(), a.n()),
        ));
    }

    if a.m() <= 1 {
        return Ok(T::Real::one());
    }
    if anorm == T::Real::zero() {
        return Ok(T::Real::zero());
    }

    let _span = debug_span!("gecondest", ?norm, n = a.m(), %target).entered();
    let l = TriangularMatrix::new(Uplo::Lower, Diag::Unit, a.clone());
    let u = TriangularMatrix::new(Uplo::Upper, Diag::NonUnit, a.clone());
    let (lh, uh) = (l.conj_transpose(), u.conj_transpose());

    let mut x: Matrix<T> = a.column_like();
    let mut v: Matrix<T> = a.column_like();
    let mut isgn: Matrix<i64> = a.column_like();
    let root = x.tile_rank(0, 0);
    let comm = a.comm().clone();

    let mut state = EstimatorState::new();
    let mut round = 0;
    let ainvnm = loop {
        norm1est(&mut x, &mut v, &mut isgn, &mut state)?;
        let local = (state.isave, state.kase);
        let step = synchronize(comm.as_ref(), root, &mut state)?;
        debug_assert_eq!(local, (state.isave, state.kase), "ranks disagree on the estimator state");
        trace!(round, kase = state.kase, isave = ?state.isave, "estimator round");
        round += 1;

        let kase = match step {
            Step::Done(est) => break est,
            Step::Apply => 1,
            Step::ApplyConjTrans => 2,
        };
        if kase == kase1 {
            // inv(L) then inv(U)
            trsm(Side::Left, T::one(), &l, &mut x, opts)?;
            trsm(Side::Left, T::one(), &u, &mut x, opts)?;
        } else {
            // inv(U^H) then inv(L^H)
            trsm(Side::Left, T::one(), &uh, &mut x, opts)?;
            trsm(Side::Left, T::one(), &lh, &mut x, opts)?;
        }
    };

    // Exactly singular factors make the solves produce Inf or NaN.
    let rcond = if ainvnm.is_finite() && ainvnm != T::Real::zero() {
        (T::Real::one() / ainvnm) / anorm
    } else {
        T::Real::zero()
    };
    debug!(rounds = round, ainvnm = ainvnm.as_f64(), rcond = rcond.as_f64(), "gecondest");
    Ok(rcond)
}
