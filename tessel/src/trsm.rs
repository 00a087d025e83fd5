//! Distributed triangular solve, `op(A) X = alpha B` with `X` overwriting `B`.
//!
//! Every rank of `B`'s group walks the same sequence of block steps. At step `k` the diagonal
//! tile is shipped to the owners of block row `k` of `B`, which solve their tiles; the solved
//! tiles and the tiles of column `k` of `op(A)` are then shipped to the owners of the trailing
//! tiles, which update them locally. Transfers follow one global order (diagonal tile, then
//! solved tiles by column, then `A` tiles by row) so that matching sends and receives pair up on
//! the ordered channel between two ranks.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::{debug_span, trace};

use crate::blas;
use crate::error::{Error, Result};
use crate::matrix::{Matrix, TriangularMatrix};
use crate::options::Options;
use crate::scalar::Scalar;
use crate::tile::Tile;
use crate::types::{Op, Side, Uplo};

const OP: &str = "trsm";

fn check<T: Scalar>(a: &TriangularMatrix<T>, b: &Matrix<T>) -> Result<()> {
    if b.op() != Op::NoTrans {
        return Err(Error::Unsupported("trsm on a transposed B".into()));
    }
    if a.mt() != a.nt() || a.mt() != b.mt() {
        return Err(Error::mismatch(
            OP,
            format!("A is {} x {} tiles, B has {} tile-rows", a.mt(), a.nt(), b.mt()),
        ));
    }
    for k in 0..a.mt() {
        if a.tile_mb(k) != a.tile_nb(k) || a.tile_mb(k) != b.tile_mb(k) {
            return Err(Error::mismatch(
                OP,
                format!(
                    "block {} is {} x {} in A, {} rows in B",
                    k,
                    a.tile_mb(k),
                    a.tile_nb(k),
                    b.tile_mb(k)
                ),
            ));
        }
    }
    Ok(())
}

/// Left triangular solve over the ranks of `B`'s group. Collective.
pub fn trsm<T: Scalar>(
    side: Side,
    alpha: T,
    a: &TriangularMatrix<T>,
    b: &mut Matrix<T>,
    opts: &Options,
) -> Result<()> {
    if side == Side::Right {
        return Err(Error::Unsupported("trsm with A on the right".into()));
    }
    let target = opts.target()?;
    check(a, b)?;

    let (uplo, op, diag) = (a.uplo(), a.op(), a.diag());
    let _span = debug_span!("trsm", ?uplo, ?op, ?diag, %target, mt = b.mt(), nt = b.nt())
        .entered();

    let b: &Matrix<T> = b;
    b.local_tiles()
        .collect::<Vec<_>>()
        .par_iter()
        .for_each(|(_, handle)| blas::scale(alpha, &mut handle.lock()));

    let mt = b.mt();
    let steps: Vec<usize> = match uplo {
        Uplo::Lower => (0..mt).collect(),
        Uplo::Upper => (0..mt).rev().collect(),
    };
    for k in steps {
        let trailing: Vec<usize> = match uplo {
            Uplo::Lower => ((k + 1)..mt).collect(),
            Uplo::Upper => (0..k).collect(),
        };
        solve_step(a, b, k, &trailing)?;
    }
    Ok(())
}

fn solve_step<T: Scalar>(
    a: &TriangularMatrix<T>,
    b: &Matrix<T>,
    k: usize,
    trailing: &[usize],
) -> Result<()> {
    let (uplo, op, diag) = (a.uplo(), a.op(), a.diag());
    let nt = b.nt();
    let me = b.comm().rank();

    // Diagonal block to the owners of block row k.
    let row_owners: BTreeSet<usize> = (0..nt).map(|j| b.tile_rank(k, j)).collect();
    let akk = a.share_tile(OP, k, k, &row_owners)?;
    trace!(k, owners = row_owners.len(), "trsm step");

    let mut solved: BTreeMap<usize, Tile<T>> = BTreeMap::new();
    for j in 0..nt {
        if !b.tile_is_local(k, j) {
            continue;
        }
        let akk = akk.as_ref().ok_or(Error::TileNotLocal {
            op: OP,
            i: k,
            j: k,
            rank: me,
        })?;
        let mut bkj = b.local_tile(OP, k, j)?.lock();
        blas::trsm(Side::Left, uplo, op, diag, T::one(), akk, &mut bkj);
    }

    // Solved tiles to the owners of the trailing tiles of their column.
    for j in 0..nt {
        let dests: BTreeSet<usize> = trailing.iter().map(|&i| b.tile_rank(i, j)).collect();
        if let Some(tile) = b.share_tile(OP, k, j, &dests)? {
            solved.insert(j, tile);
        }
    }

    // Column k of op(A) to the owners of the matching trailing rows.
    let mut panel: BTreeMap<usize, Tile<T>> = BTreeMap::new();
    for &i in trailing {
        let dests: BTreeSet<usize> = (0..nt).map(|j| b.tile_rank(i, j)).collect();
        if let Some(tile) = a.share_tile(OP, i, k, &dests)? {
            panel.insert(i, tile);
        }
    }

    let updates: Vec<(usize, usize)> = trailing
        .iter()
        .flat_map(|&i| (0..nt).map(move |j| (i, j)))
        .filter(|&(i, j)| b.tile_is_local(i, j))
        .collect();
    updates.par_iter().try_for_each(|&(i, j)| {
        let missing = |(ti, tj): (usize, usize)| Error::TileNotLocal {
            op: OP,
            i: ti,
            j: tj,
            rank: me,
        };
        let aik = panel.get(&i).ok_or_else(|| missing((i, k)))?;
        let bkj = solved.get(&j).ok_or_else(|| missing((k, j)))?;
        let mut bij = b.local_tile(OP, i, j)?.lock();
        blas::gemm(-T::one(), op, aik, Op::NoTrans, bkj, T::one(), &mut bij);
        Ok(())
    })
}
