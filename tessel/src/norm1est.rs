//! # 1-norm estimation by reverse communication
//!
//! Estimates `||A||_1` for an operator `A` the estimator never sees: each call either returns the
//! estimate or asks the caller to overwrite `X` with `A X` (`Step::Apply`) or `A^H X`
//! (`Step::ApplyConjTrans`) and call again. This is Hager's method as refined by Higham: a few
//! sign-vector power iterations, a probe at the largest entry, and a final check against an
//! alternating vector.
//!
//! Everything the estimator knows between two calls lives in `EstimatorState` and in the three
//! work vectors, so a computation can be suspended after any step and resumed by whoever holds
//! them. The vectors are distributed `n x 1` matrices; reductions over them are collectives of
//! their group, and every rank takes the same branch because it branches on reduced values only.

use num_traits::{Float, One, Zero};
use tracing::trace;

use crate::comm::{Collective, Communicator};
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::scalar::{Real, Scalar};

/// Maximum number of probe iterations.
pub const ITMAX: i64 = 5;

// Layout of `EstimatorState::isave`.
const JUMP: usize = 0;
const J: usize = 1;
const ITER: usize = 2;
const JLAST: usize = 3;

/// What the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step<R> {
    /// Estimation is over, with this estimate.
    Done(R),
    /// Overwrite `X` with `A X`, then call again.
    Apply,
    /// Overwrite `X` with `A^H X`, then call again.
    ApplyConjTrans,
}

/// Persistent estimator state.
///
/// `isave` holds the resume point, the index of the probed entry, the iteration count and the
/// previously probed index. `kase` is 0 before the first call and after the last one, 1 or 2
/// while an operator application is pending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorState<R> {
    pub isave: [i64; 4],
    pub kase: i32,
    pub est: R,
}

impl<R: Real> EstimatorState<R> {
    pub fn new() -> Self {
        Self {
            isave: [0; 4],
            kase: 0,
            est: R::zero(),
        }
    }

    /// The request encoded by `kase`.
    pub fn step(&self) -> Step<R> {
        match self.kase {
            1 => Step::Apply,
            2 => Step::ApplyConjTrans,
            _ => Step::Done(self.est),
        }
    }

    fn request(&mut self, kase: i32, jump: i64) -> Result<Step<R>> {
        self.kase = kase;
        self.isave[JUMP] = jump;
        Ok(self.step())
    }

    fn finish(&mut self) -> Result<Step<R>> {
        self.kase = 0;
        Ok(Step::Done(self.est))
    }
}

impl<R: Real> Default for EstimatorState<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance the estimation by one step.
///
/// `x`, `v` and `isgn` are `n x 1` with the same tiling and distribution. Start with
/// `state.kase == 0`. Collective over the group of `x`.
pub fn norm1est<T: Scalar>(
    x: &mut Matrix<T>,
    v: &mut Matrix<T>,
    isgn: &mut Matrix<i64>,
    state: &mut EstimatorState<T::Real>,
) -> Result<Step<T::Real>> {
    check_vectors(x, v, isgn)?;
    let n = x.m();
    let one = T::Real::one();

    if state.kase == 0 {
        if n == 0 {
            state.est = T::Real::zero();
            return state.finish();
        }
        let inv_n = T::from_real(one / T::Real::of(n as f64));
        fill(x, |_| inv_n);
        return state.request(1, 1);
    }

    let jump = state.isave[JUMP];
    trace!(jump, iter = state.isave[ITER], est = state.est.as_f64(), "norm1est");
    match jump {
        // X holds A x with x = (1/n, ..., 1/n).
        1 => {
            if n == 1 {
                copy(x, v)?;
                state.est = asum(v)?;
                return state.finish();
            }
            state.est = asum(x)?;
            signs(x, isgn);
            state.request(2, 2)
        }

        // X holds A^H sign(A x).
        2 => {
            state.isave[J] = iamax(x)?.0 as i64;
            state.isave[ITER] = 2;
            probe(x, state)
        }

        // X holds A e_j.
        3 => {
            copy(x, v)?;
            let estold = state.est;
            state.est = asum(v)?;
            // A repeated sign vector means convergence.
            if !T::IS_COMPLEX && signs_repeat(x, isgn)? {
                return alternating(x, state);
            }
            // Cycling.
            if state.est <= estold {
                return alternating(x, state);
            }
            signs(x, isgn);
            state.request(2, 4)
        }

        // X holds A^H sign(A e_j).
        4 => {
            let jlast = state.isave[J];
            state.isave[JLAST] = jlast;
            let (j, max) = iamax(x)?;
            state.isave[J] = j as i64;
            let at_jlast = entry(x, jlast as usize)?;
            let moved = if T::IS_COMPLEX {
                Scalar::abs(at_jlast) != max
            } else {
                at_jlast.re() != max
            };
            if moved && state.isave[ITER] < ITMAX {
                state.isave[ITER] += 1;
                return probe(x, state);
            }
            alternating(x, state)
        }

        // X holds A b with b the alternating vector.
        5 => {
            let three_n = T::Real::of(3.0 * n as f64);
            let temp = T::Real::of(2.0) * (asum(x)? / three_n);
            if temp > state.est {
                copy(x, v)?;
                state.est = temp;
            }
            state.finish()
        }

        _ => Err(Error::Unsupported(format!(
            "norm estimator resumed at step {}",
            jump
        ))),
    }
}

/// Broadcast `isave` then `kase` from `root`, so that every rank resumes from the root's state.
///
/// Both broadcasts are issued on every call, by every rank of `comm`.
pub fn synchronize<R: Real>(
    comm: &dyn Communicator,
    root: usize,
    state: &mut EstimatorState<R>,
) -> Result<Step<R>> {
    comm.broadcast(&mut state.isave, root)?;
    comm.broadcast(&mut state.kase, root)?;
    Ok(state.step())
}

// ———————————————————————————————— Steps ——————————————————————————————————— //

/// X = e_j
fn probe<T: Scalar>(x: &mut Matrix<T>, state: &mut EstimatorState<T::Real>) -> Result<Step<T::Real>> {
    let j = state.isave[J] as usize;
    fill(x, |i| if i == j { T::one() } else { T::zero() });
    state.request(1, 3)
}

/// X(i) = (-1)^i (1 + i / (n - 1))
fn alternating<T: Scalar>(
    x: &mut Matrix<T>,
    state: &mut EstimatorState<T::Real>,
) -> Result<Step<T::Real>> {
    let n = x.m();
    let denom = T::Real::of((n - 1) as f64);
    fill(x, |i| {
        let value = T::Real::one() + T::Real::of(i as f64) / denom;
        let value = if i % 2 == 0 { value } else { -value };
        T::from_real(value)
    });
    state.request(1, 5)
}

// ——————————————————————————— Vector Operations ———————————————————————————— //

fn check_vectors<T: Scalar>(x: &Matrix<T>, v: &Matrix<T>, isgn: &Matrix<i64>) -> Result<()> {
    let conforming = x.nt() == 1
        && v.nt() == 1
        && isgn.nt() == 1
        && v.mt() == x.mt()
        && isgn.mt() == x.mt()
        && (0..x.mt()).all(|i| {
            v.tile_mb(i) == x.tile_mb(i)
                && isgn.tile_mb(i) == x.tile_mb(i)
                && v.tile_rank(i, 0) == x.tile_rank(i, 0)
                && isgn.tile_rank(i, 0) == x.tile_rank(i, 0)
        });
    if conforming {
        Ok(())
    } else {
        Err(Error::mismatch(
            "norm1est",
            "work vectors must be single tile columns with the same tiling",
        ))
    }
}

/// Set every local entry from its global row index.
fn fill<T: Scalar>(x: &Matrix<T>, f: impl Fn(usize) -> T) {
    for ((i, _), handle) in x.local_tiles() {
        let row0 = x.row_offset(i);
        let mut tile = handle.lock();
        for (ii, value) in tile.as_mut_slice().iter_mut().enumerate() {
            *value = f(row0 + ii);
        }
    }
}

fn copy<T: Scalar>(src: &Matrix<T>, dst: &Matrix<T>) -> Result<()> {
    for ((i, j), handle) in src.local_tiles() {
        let tile = handle.lock().clone();
        *dst.local_tile("norm1est", i, j)?.lock() = tile;
    }
    Ok(())
}

/// Sum of moduli.
fn asum<T: Scalar>(x: &Matrix<T>) -> Result<T::Real> {
    let local = x
        .local_tiles()
        .map(|(_, handle)| {
            let tile = handle.lock();
            tile.as_slice()
                .iter()
                .fold(T::Real::zero(), |acc, &value| acc + Scalar::abs(value))
        })
        .fold(T::Real::zero(), |acc, sum| acc + sum);
    x.comm().all_reduce_sum(local)
}

/// Global index and modulus of the entry of largest modulus, the first one on ties.
fn iamax<T: Scalar>(x: &Matrix<T>) -> Result<(usize, T::Real)> {
    let mut local: Option<(T::Real, usize)> = None;
    for ((i, _), handle) in x.local_tiles() {
        let row0 = x.row_offset(i);
        let tile = handle.lock();
        for (ii, &value) in tile.as_slice().iter().enumerate() {
            local = better(local, (Scalar::abs(value), row0 + ii));
        }
    }
    let best = x
        .comm()
        .all_gather(local)?
        .into_iter()
        .flatten()
        .fold(None, better::<T::Real>);
    Ok(best.map_or((0, T::Real::zero()), |(max, index)| (index, max)))
}

fn better<R: Real>(best: Option<(R, usize)>, candidate: (R, usize)) -> Option<(R, usize)> {
    match best {
        None => Some(candidate),
        Some((max, index)) => {
            if candidate.0 > max || (candidate.0 == max && candidate.1 < index) {
                Some(candidate)
            } else {
                best
            }
        }
    }
}

/// Entry `row` of `x`, on every rank.
fn entry<T: Scalar>(x: &Matrix<T>, row: usize) -> Result<T> {
    let (i, ii) = x.row_tile(row);
    let root = x.tile_rank(i, 0);
    let mut value = match x.tile(i, 0) {
        Some(handle) if x.tile_is_local(i, 0) => handle.lock()[(ii, 0)],
        _ => T::zero(),
    };
    x.comm().broadcast(&mut value, root)?;
    Ok(value)
}

/// Real: X(i) = sign(X(i)), recorded in `isgn`. Complex: X(i) = X(i) / |X(i)|.
fn signs<T: Scalar>(x: &Matrix<T>, isgn: &Matrix<i64>) {
    let safmin = T::Real::min_positive_value();
    for ((i, j), handle) in x.local_tiles() {
        let mut tile = handle.lock();
        if T::IS_COMPLEX {
            for value in tile.as_mut_slice() {
                let modulus = Scalar::abs(*value);
                *value = if modulus > safmin {
                    *value / T::from_real(modulus)
                } else {
                    T::one()
                };
            }
        } else if let Some(signs) = isgn.tile(i, j) {
            let mut signs = signs.lock();
            for (value, sign) in tile.as_mut_slice().iter_mut().zip(signs.as_mut_slice()) {
                *sign = sign_of(*value);
                *value = T::from_real(T::Real::of(*sign as f64));
            }
        }
    }
}

fn sign_of<T: Scalar>(value: T) -> i64 {
    if value.re() >= T::Real::zero() {
        1
    } else {
        -1
    }
}

/// Whether the signs of `x` are those recorded in `isgn`, on every rank.
fn signs_repeat<T: Scalar>(x: &Matrix<T>, isgn: &Matrix<i64>) -> Result<bool> {
    let mut local = true;
    for ((i, j), handle) in x.local_tiles() {
        let tile = handle.lock();
        let signs = isgn.local_tile("norm1est", i, j)?.lock();
        local &= tile
            .as_slice()
            .iter()
            .zip(signs.as_slice())
            .all(|(&value, &sign)| sign_of(value) == sign);
    }
    Ok(x.comm().all_gather(local)?.into_iter().all(|same| same))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use approx::assert_relative_eq;
    use num_complex::Complex;

    /// Drive the estimator with a dense column-major operator, counting operator applications.
    fn estimate<T: Scalar>(n: usize, nb: usize, op: &[T]) -> (T::Real, usize) {
        let a = Matrix::<T>::uniform(n, n, nb, 1, 1, SelfComm::shared()).unwrap();
        let mut x: Matrix<T> = a.column_like();
        let mut v: Matrix<T> = a.column_like();
        let mut isgn: Matrix<i64> = a.column_like();
        let mut state = EstimatorState::new();
        let mut applications = 0;
        loop {
            let step = norm1est(&mut x, &mut v, &mut isgn, &mut state).unwrap();
            let conj = match step {
                Step::Done(est) => return (est, applications),
                Step::Apply => false,
                Step::ApplyConjTrans => true,
            };
            applications += 1;
            let xs = x.to_dense().unwrap();
            let ys: Vec<T> = (0..n)
                .map(|i| {
                    (0..n).fold(T::zero(), |acc, l| {
                        let aij = if conj { op[l + i * n].conj() } else { op[i + l * n] };
                        acc + aij * xs[l]
                    })
                })
                .collect();
            x.fill_with(|i, _| ys[i]);
        }
    }

    fn exact_norm1(n: usize, op: &[f64]) -> f64 {
        (0..n)
            .map(|j| (0..n).map(|i| op[i + j * n].abs()).sum::<f64>())
            .fold(0.0, f64::max)
    }

    #[test]
    fn diagonal_operator_is_exact() {
        let n = 6;
        let mut op = vec![0.0; n * n];
        for i in 0..n {
            op[i + i * n] = 1.0 / (1.0 + i as f64);
        }
        op[3 + 3 * n] = -4.0;
        let (est, applications) = estimate(n, 4, &op);
        assert_relative_eq!(est, 4.0);
        assert!(applications <= 2 * ITMAX as usize + 1);
    }

    #[test]
    fn dense_operator_is_bounded_by_the_norm() {
        let n = 5;
        let op: Vec<f64> = (0..n * n)
            .map(|k| ((k * 7 + 3) % 11) as f64 - 5.0)
            .collect();
        let exact = exact_norm1(n, &op);
        let (est, _) = estimate(n, 2, &op);
        assert!(est <= exact * (1.0 + 1e-12));
        assert!(est >= exact / 3.0);
    }

    #[test]
    fn complex_operator() {
        let n = 3;
        let mut op = vec![Complex::new(0.0_f64, 0.0); n * n];
        op[0] = Complex::new(0.0, 2.0);
        op[4] = Complex::new(3.0, 4.0);
        op[8] = Complex::new(1.0, 0.0);
        let (est, _) = estimate(n, 2, &op);
        assert_relative_eq!(est, 5.0, max_relative = 1e-12);
    }

    #[test]
    fn one_by_one_finishes_after_one_application() {
        let (est, applications) = estimate(1, 1, &[-3.0_f32]);
        assert_eq!((est, applications), (3.0, 1));
    }

    #[test]
    fn ties_pick_the_first_index() {
        assert_eq!(better(Some((2.0, 5)), (2.0, 3)), Some((2.0, 3)));
        assert_eq!(better(Some((2.0, 3)), (2.0, 5)), Some((2.0, 3)));
        assert_eq!(better(None, (1.0_f64, 9)), Some((1.0, 9)));
    }

    #[test]
    fn corrupted_state_is_an_error() {
        let a = Matrix::<f64>::uniform(3, 3, 2, 1, 1, SelfComm::shared()).unwrap();
        let mut x: Matrix<f64> = a.column_like();
        let mut v: Matrix<f64> = a.column_like();
        let mut isgn: Matrix<i64> = a.column_like();
        let mut state = EstimatorState {
            isave: [9, 0, 0, 0],
            kase: 1,
            est: 0.0,
        };
        assert!(norm1est(&mut x, &mut v, &mut isgn, &mut state).is_err());
    }
}
