//! Tiled LU factorization without pivoting.
//!
//! The right-looking tile algorithm: at step `k` the diagonal tile is factored, the tiles below
//! it are solved against `U(k, k)`, the tiles to its right against `L(k, k)`, and the trailing
//! matrix gets a rank-`nb` update. Every step is a `task!`, so the runtime orders the accesses to
//! shared tiles and independent updates run concurrently.

use std::cell::UnsafeCell;

use tracing::{debug, debug_span, trace};

use crate::blas;
use crate::error::{Error, Result};
use crate::matrix::{Matrix, TileHandle};
use crate::options::Options;
use crate::runtime::{block_cyclic, run_tasks, worker_count, Runtime};
use crate::scalar::Scalar;
use crate::task;
use crate::tile::Tile;
use crate::types::{Diag, Op, Side, Uplo};

const OP: &str = "getrf_nopiv";

// ———————————————————————————————— Tasks ——————————————————————————————————— //

fn factor<T: Scalar>(tile: &mut Tile<T>) {
    // Zero pivots are looked for once the region is joined.
    blas::getrf_nopiv(tile);
}

/// `A(i, k) = A(i, k) U(k, k)^-1`
fn panel_update<T: Scalar>(pivot_tile: &Tile<T>, tile: &mut Tile<T>) {
    blas::trsm(
        Side::Right,
        Uplo::Upper,
        Op::NoTrans,
        Diag::NonUnit,
        T::one(),
        pivot_tile,
        tile,
    );
}

/// `A(k, j) = L(k, k)^-1 A(k, j)`
fn row_update<T: Scalar>(pivot_tile: &Tile<T>, tile: &mut Tile<T>) {
    blas::trsm(
        Side::Left,
        Uplo::Lower,
        Op::NoTrans,
        Diag::Unit,
        T::one(),
        pivot_tile,
        tile,
    );
}

fn trailing_update<T: Scalar>(a: &Tile<T>, b: &Tile<T>, c: &mut Tile<T>) {
    blas::gemm(-T::one(), Op::NoTrans, a, Op::NoTrans, b, T::one(), c);
}

// ———————————————————————————————— Program ————————————————————————————————— //

/// Return a mutable reference to tile (i, j).
///
/// Safety: no two references to the same tile may be alive at the same time.
unsafe fn get_mut<T>(tiles: &UnsafeCell<Matrix<T>>, i: usize, j: usize) -> &mut TileHandle<T> {
    match (*tiles.get()).tile_mut(i, j) {
        Some(handle) => handle,
        // Residency of every tile is checked before the region starts.
        None => unreachable!("tile ({}, {}) is not resident", i, j),
    }
}

fn lu_fact<T: Scalar>(mut rt: Runtime<(usize, usize)>, a: Matrix<T>) {
    let (mt, nt) = (a.mt(), a.nt());
    let tiles = UnsafeCell::new(a);
    unsafe {
        for k in 0..mt.min(nt) {
            let pivot_tile = get_mut(&tiles, k, k);
            task! {
                rt, factor,
                map: (k, k);
                RW: pivot_tile;
            }

            for row in (k + 1)..mt {
                let tile = get_mut(&tiles, row, k);
                task! {
                    rt, panel_update,
                    map: (row, k);
                    R: pivot_tile;
                    RW: tile;
                }
            }

            for col in (k + 1)..nt {
                let tile = get_mut(&tiles, k, col);
                task! {
                    rt, row_update,
                    map: (k, col);
                    R: pivot_tile;
                    RW: tile;
                }
            }

            for row in (k + 1)..mt {
                for col in (k + 1)..nt {
                    let a = get_mut(&tiles, row, k);
                    let b = get_mut(&tiles, k, col);
                    let c = get_mut(&tiles, row, col);
                    task! {
                        rt, trailing_update,
                        map: (row, col);
                        R: a, b;
                        RW: c;
                    }
                }
            }
        }
    }
    trace!(
        worker = rt.worker_id().thread_id,
        declared = rt.declared(),
        executed = rt.executed(),
        "lu worker done"
    );
}

/// Factor `A = L U` in place, `L` unit lower triangular, without pivoting.
///
/// Runs on the task runtime of the calling process, so every tile of `A` must be resident:
/// multi-process groups are rejected. An exactly zero pivot is reported with its global row
/// index once the factorization is done.
pub fn getrf_nopiv<T: Scalar>(a: &mut Matrix<T>, opts: &Options) -> Result<()> {
    let target = opts.target()?;
    if a.comm().size() != 1 {
        return Err(Error::Unsupported(format!(
            "{} over {} processes",
            OP,
            a.comm().size()
        )));
    }
    if a.op() != Op::NoTrans {
        return Err(Error::Unsupported(format!("{} of a transposed view", OP)));
    }
    let (mt, nt) = (a.mt(), a.nt());
    for k in 0..mt.min(nt) {
        if a.tile_mb(k) != a.tile_nb(k) {
            return Err(Error::mismatch(
                OP,
                format!("diagonal tile {} is {} x {}", k, a.tile_mb(k), a.tile_nb(k)),
            ));
        }
    }
    for i in 0..mt {
        for j in 0..nt {
            a.local_tile(OP, i, j)?;
        }
    }

    let nb_workers = worker_count(mt * nt);
    let _span = debug_span!("getrf_nopiv", mt, nt, nb_workers, %target).entered();
    run_tasks(nb_workers, 0, block_cyclic(nb_workers), a.clone(), lu_fact)?;

    for k in 0..mt.min(nt) {
        let tile = a.local_tile(OP, k, k)?.lock();
        let zero = (0..tile.mb()).find(|&d| tile[(d, d)] == T::zero());
        if let Some(d) = zero {
            let index = a.row_offset(k) + d;
            debug!(index, "zero pivot");
            return Err(Error::ZeroPivot { index });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use approx::assert_relative_eq;

    #[test]
    fn factors_multiply_back() {
        let n = 7;
        let init = |i: usize, j: usize| {
            if i == j {
                20.0 + i as f64
            } else {
                ((i * 3 + j * 5) % 7) as f64 - 3.0
            }
        };
        let mut a = Matrix::uniform(n, n, 3, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(init);
        getrf_nopiv(&mut a, &Options::new()).unwrap();

        let lu = a.to_dense().unwrap();
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..=i.min(j) {
                    let lil = if l == i { 1.0 } else { lu[i + l * n] };
                    sum += lil * lu[l + j * n];
                }
                assert_relative_eq!(sum, init(i, j), epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn zero_pivot_is_reported_with_its_global_row() {
        let mut a = Matrix::uniform(4, 4, 2, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|i, j| if i == j && i != 2 { 1.0 } else { 0.0 });
        let err = getrf_nopiv(&mut a, &Options::new());
        assert!(matches!(err, Err(Error::ZeroPivot { index: 2 })));
    }

    #[test]
    fn transposed_views_are_rejected() {
        let mut a = Matrix::<f32>::uniform(4, 4, 2, 1, 1, SelfComm::shared())
            .unwrap()
            .conj_transpose();
        assert!(matches!(
            getrf_nopiv(&mut a, &Options::new()),
            Err(Error::Unsupported(_))
        ));
    }
}
