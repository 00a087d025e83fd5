//! # Triangular matrix multiply over tiles
//!
//! `B = alpha op(A) B` (left) or `B = alpha B op(A)` (right) for the trailing block of a blocked
//! triangular multiply: `A` is a single block row (left) or block column (right) whose last tile
//! is the triangular diagonal block, and only the last block row (left) or column (right) of `B`
//! is updated.
//!
//! Each updated tile of `B` is the end of a chain: first the diagonal product, then one
//! accumulation per remaining tile of `A`, for `k` going down. Chains are independent of each
//! other; inside a chain every step writes the same tile and the steps run in that order on every
//! target.
//!
//! Operand tiles owned by another rank are shipped to the owner of the output tile before any
//! chain runs, and the ranks agree that every operand is resident first, so a failing call
//! leaves `B` untouched everywhere.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use std::sync::Arc;

use crossbeam::thread;
use rayon::prelude::*;
use tracing::{debug, debug_span, trace};

use crate::blas;
use crate::data::Fence;
use crate::error::{Error, Result};
use crate::matrix::{Matrix, TileHandle, TriangularMatrix};
use crate::comm::Collective;
use crate::runtime::{round_robin, run_tasks, worker_count, Runtime};
use crate::scalar::Scalar;
use crate::task;
use crate::tile::Tile;
use crate::types::{Diag, Op, Side, Target, Uplo};

type Coord = (usize, usize);

const OP: &str = "trmm";

#[derive(Debug, Clone, Copy)]
struct Params<T> {
    side: Side,
    uplo: Uplo,
    op: Op,
    diag: Diag,
    alpha: T,
}

/// The updates applied to one output tile of `B`, in execution order.
#[derive(Debug, Clone)]
struct Chain {
    out: Coord,
    // Diagonal tile of A.
    diag: Coord,
    // (tile of A, tile of B) for each accumulation.
    terms: Vec<(Coord, Coord)>,
}

fn diag_step<T: Scalar>(p: Params<T>, a: &Tile<T>, out: &mut Tile<T>) {
    blas::trmm(p.side, p.uplo, p.op, p.diag, p.alpha, a, out);
}

fn update_step<T: Scalar>(p: Params<T>, a: &Tile<T>, b: &Tile<T>, out: &mut Tile<T>) {
    match p.side {
        Side::Left => blas::gemm(p.alpha, p.op, a, Op::NoTrans, b, T::one(), out),
        Side::Right => blas::gemm(p.alpha, Op::NoTrans, b, p.op, a, T::one(), out),
    }
}

/// Triangular matrix multiply, dispatched to the implementation of `target`.
///
/// Collective over the group of `A` and `B`: each process updates the tiles of `B` it owns,
/// receiving the operand tiles it lacks from their owners. Returns once all of `B`'s local
/// updates are done.
pub fn trmm<T: Scalar>(
    side: Side,
    diag: Diag,
    alpha: T,
    a: TriangularMatrix<T>,
    b: Matrix<T>,
    priority: i32,
    target: Target,
) -> Result<()> {
    let _span = debug_span!("trmm", ?side, ?diag, %target, priority, mt = b.mt(), nt = b.nt())
        .entered();

    let chains = plan(side, &a, &b)?;
    let params = Params {
        side,
        uplo: a.uplo(),
        op: a.op(),
        diag,
        alpha,
    };
    check_residency(&a, &b, &chains)?;
    let (a, b_work) = stage(&a, &b, &chains)?;
    let chains: Vec<Chain> = chains
        .into_iter()
        .filter(|chain| b.tile_is_local(chain.out.0, chain.out.1))
        .collect();
    debug!(chains = chains.len(), "trmm planned");
    if chains.is_empty() {
        return Ok(());
    }

    match target {
        Target::HostTask => host_task(params, a, b_work, chains, priority),
        Target::HostNest => host_nest(params, &a, &b_work, &chains),
        Target::HostBatch => host_batch(params, &a, &b_work, &chains),
        Target::Devices => devices(params, &a, &b_work, &chains),
    }
}

/// Check shapes and list the chains of every output tile, in the same order on every rank.
fn plan<T: Scalar>(side: Side, a: &TriangularMatrix<T>, b: &Matrix<T>) -> Result<Vec<Chain>> {
    if b.op() != Op::NoTrans {
        return Err(Error::Unsupported("trmm on a transposed B".into()));
    }
    let (a_comm, b_comm) = (a.comm(), b.comm());
    if a_comm.size() != b_comm.size() || a_comm.rank() != b_comm.rank() {
        return Err(Error::mismatch(OP, "A and B live on different process groups"));
    }

    // Left: A is 1 x K tiles against the K tile-rows of B. Right: A is K x 1 against the K
    // tile-columns of B. `extent(k)` is the contraction size of step k on each side.
    let (a_count, b_count, a_lead) = match side {
        Side::Left => (a.nt(), b.mt(), a.mt()),
        Side::Right => (a.mt(), b.nt(), a.nt()),
    };
    if a_lead != 1 {
        return Err(Error::mismatch(OP, format!("A must be a single tile block, has {}", a_lead)));
    }
    if a_count != b_count || a_count == 0 {
        return Err(Error::mismatch(
            OP,
            format!("A has {} tile blocks, B has {}", a_count, b_count),
        ));
    }
    let last = a_count - 1;
    for k in 0..a_count {
        let (ak, bk) = match side {
            Side::Left => (a.tile_nb(k), b.tile_mb(k)),
            Side::Right => (a.tile_mb(k), b.tile_nb(k)),
        };
        if ak != bk {
            return Err(Error::mismatch(
                OP,
                format!("block {} is {} wide in A and {} in B", k, ak, bk),
            ));
        }
    }
    let (diag_rows, diag_cols) = match side {
        Side::Left => (a.tile_mb(0), a.tile_nb(last)),
        Side::Right => (a.tile_mb(last), a.tile_nb(0)),
    };
    if diag_rows != diag_cols {
        return Err(Error::mismatch(
            OP,
            format!("diagonal tile is {} x {}", diag_rows, diag_cols),
        ));
    }

    let others = match side {
        Side::Left => b.nt(),
        Side::Right => b.mt(),
    };
    let chains = (0..others)
        .map(|n| match side {
            Side::Left => Chain {
                out: (last, n),
                diag: (0, last),
                terms: (0..last).rev().map(|k| ((0, k), (k, n))).collect(),
            },
            Side::Right => Chain {
                out: (n, last),
                diag: (last, 0),
                terms: (0..last).rev().map(|k| ((k, 0), (n, k))).collect(),
            },
        })
        .collect();
    Ok(chains)
}

fn a_coords(chain: &Chain) -> impl Iterator<Item = Coord> + '_ {
    iter::once(chain.diag).chain(chain.terms.iter().map(|term| term.0))
}

fn b_coords(chain: &Chain) -> impl Iterator<Item = Coord> + '_ {
    iter::once(chain.out).chain(chain.terms.iter().map(|term| term.1))
}

fn missing_tile<T>(m: &Matrix<T>, mut coords: impl Iterator<Item = Coord>) -> Option<Coord> {
    coords.find(|&(i, j)| m.tile_is_local(i, j) && m.tile(i, j).is_none())
}

/// Fail on every rank if any rank lacks a tile it owns and some chain reads. Collective.
fn check_residency<T: Scalar>(a: &Matrix<T>, b: &Matrix<T>, chains: &[Chain]) -> Result<()> {
    let missing = chains.iter().find_map(|chain| {
        missing_tile(a, a_coords(chain)).or_else(|| missing_tile(b, b_coords(chain)))
    });

    let gathered = b.comm().all_gather(missing)?;
    match gathered
        .into_iter()
        .enumerate()
        .find_map(|(rank, missing)| missing.map(|(i, j)| (rank, i, j)))
    {
        Some((rank, i, j)) => Err(Error::TileNotLocal { op: OP, i, j, rank }),
        None => Ok(()),
    }
}

/// Send tile `(i, j)` of `m` from its owner to `dest`, once. The copy lands in `work` on `dest`.
fn ship<T: Scalar>(
    m: &Matrix<T>,
    work: &mut Matrix<T>,
    (i, j): Coord,
    dest: usize,
    shipped: &mut BTreeSet<(Coord, usize)>,
) -> Result<()> {
    if m.tile_rank(i, j) == dest || !shipped.insert(((i, j), dest)) {
        return Ok(());
    }
    let dests = iter::once(dest).collect();
    if let Some(tile) = m.share_tile(OP, i, j, &dests)? {
        if m.comm().rank() == dest {
            work.stage_tile(i, j, tile);
        }
    }
    Ok(())
}

/// Private views of A and B that also hold, on each rank, the remote tiles its chains read.
///
/// Every rank walks all chains in the same order, so the transfers pair up. The tiles of B that
/// are read are never written by a chain, so copying them first is exact.
fn stage<T: Scalar>(a: &Matrix<T>, b: &Matrix<T>, chains: &[Chain]) -> Result<(Matrix<T>, Matrix<T>)> {
    let (mut a_work, mut b_work) = (a.clone(), b.clone());
    let (mut a_shipped, mut b_shipped) = (BTreeSet::new(), BTreeSet::new());
    for chain in chains {
        let dest = b.tile_rank(chain.out.0, chain.out.1);
        for coord in a_coords(chain) {
            ship(a, &mut a_work, coord, dest, &mut a_shipped)?;
        }
        for &(_, coord) in &chain.terms {
            ship(b, &mut b_work, coord, dest, &mut b_shipped)?;
        }
    }
    Ok((a_work, b_work))
}

/// Copy of the tiles of `A` a set of chains reads.
fn snapshot<T: Scalar>(a: &Matrix<T>, chains: &[Chain]) -> Result<BTreeMap<Coord, Tile<T>>> {
    let mut tiles = BTreeMap::new();
    for chain in chains {
        let coords = std::iter::once(chain.diag).chain(chain.terms.iter().map(|term| term.0));
        for (i, j) in coords {
            if !tiles.contains_key(&(i, j)) {
                tiles.insert((i, j), a.local_tile(OP, i, j)?.lock().clone());
            }
        }
    }
    Ok(tiles)
}

fn unstaged((i, j): Coord) -> Error {
    Error::mismatch(OP, format!("tile ({}, {}) was not staged", i, j))
}

/// Run one chain on tiles already at hand.
fn run_chain<T: Scalar>(
    params: Params<T>,
    a: &BTreeMap<Coord, Tile<T>>,
    chain: &Chain,
    b_tile: impl Fn(Coord) -> Result<Tile<T>>,
    out: &mut Tile<T>,
) -> Result<()> {
    diag_step(params, a.get(&chain.diag).ok_or_else(|| unstaged(chain.diag))?, out);
    for &(ak, bk) in &chain.terms {
        let a_tile = a.get(&ak).ok_or_else(|| unstaged(ak))?;
        update_step(params, a_tile, &b_tile(bk)?, out);
    }
    Ok(())
}

// ——————————————————————————————— HostTask ———————————————————————————————— //

#[derive(Clone)]
struct TrmmRegion<T> {
    params: Params<T>,
    a: Matrix<T>,
    b: Matrix<T>,
    chains: Arc<Vec<Chain>>,
}

impl<T> Fence for TrmmRegion<T> {
    unsafe fn fence(&mut self) {
        self.a.fence();
        self.b.fence();
    }
}

/// Return a mutable reference to tile `(i, j)`.
///
/// Safety: the caller must not keep two references to the same tile alive.
unsafe fn tile_mut<T>(matrix: &UnsafeCell<Matrix<T>>, (i, j): Coord) -> Option<&mut TileHandle<T>> {
    (*matrix.get()).tile_mut(i, j)
}

fn trmm_tasks<T: Scalar>(mut rt: Runtime, region: TrmmRegion<T>) {
    let TrmmRegion {
        params,
        a,
        b,
        chains,
    } = region;
    let a = UnsafeCell::new(a);
    let b = UnsafeCell::new(b);
    let depth = chains.first().map_or(0, |chain| chain.terms.len());

    // Every task below holds at most one reference per tile: the diagonal tile and the tiles of
    // A are never written, and the output tile of a chain is never one of its inputs.
    unsafe {
        // Diagonal products, independent.
        for (index, chain) in chains.iter().enumerate() {
            let (a_diag, out) = match (tile_mut(&a, chain.diag), tile_mut(&b, chain.out)) {
                (Some(a_diag), Some(out)) => (a_diag, out),
                _ => continue,
            };
            task! {
                rt, diag_step,
                map: index;
                args: (params);
                R: a_diag;
                RW: out;
            }
        }

        // Accumulations, serialized on each output tile by program order.
        for level in 0..depth {
            for (index, chain) in chains.iter().enumerate() {
                let (ak, bk) = chain.terms[level];
                let (a_k, b_k, out) =
                    match (tile_mut(&a, ak), tile_mut(&b, bk), tile_mut(&b, chain.out)) {
                        (Some(a_k), Some(b_k), Some(out)) => (a_k, b_k, out),
                        _ => continue,
                    };
                task! {
                    rt, update_step,
                    map: index;
                    args: (params);
                    R: a_k, b_k;
                    RW: out;
                }
            }
        }
    }
    trace!(
        worker = rt.worker_id().thread_id,
        priority = rt.priority(),
        declared = rt.declared(),
        executed = rt.executed(),
        "trmm worker done"
    );
}

fn host_task<T: Scalar>(
    params: Params<T>,
    a: Matrix<T>,
    b: Matrix<T>,
    chains: Vec<Chain>,
    priority: i32,
) -> Result<()> {
    let nb_workers = worker_count(chains.len());
    let region = TrmmRegion {
        params,
        a,
        b,
        chains: Arc::new(chains),
    };
    // All the tasks of a chain go to one worker, chains are dealt round robin.
    run_tasks(nb_workers, priority, round_robin(nb_workers), region, trmm_tasks)
}

// ——————————————————————————————— HostNest ———————————————————————————————— //

fn host_nest<T: Scalar>(
    params: Params<T>,
    a: &Matrix<T>,
    b: &Matrix<T>,
    chains: &[Chain],
) -> Result<()> {
    let a_tiles = snapshot(a, chains)?;
    chains.par_iter().try_for_each(|chain| {
        let mut out = b.local_tile(OP, chain.out.0, chain.out.1)?.lock();
        run_chain(
            params,
            &a_tiles,
            chain,
            |(i, j)| Ok(b.local_tile(OP, i, j)?.lock().clone()),
            &mut out,
        )
    })
}

// ——————————————————————————————— HostBatch ——————————————————————————————— //

fn host_batch<T: Scalar>(
    params: Params<T>,
    a: &Matrix<T>,
    b: &Matrix<T>,
    chains: &[Chain],
) -> Result<()> {
    let a_tiles = snapshot(a, chains)?;
    let outputs = chains
        .iter()
        .map(|chain| b.local_tile(OP, chain.out.0, chain.out.1))
        .collect::<Result<Vec<_>>>()?;

    // First batch: every diagonal product.
    let diag_batch: Vec<(&Tile<T>, &TileHandle<T>)> = chains
        .iter()
        .zip(&outputs)
        .filter_map(|(chain, &out)| a_tiles.get(&chain.diag).map(|tile| (tile, out)))
        .collect();
    diag_batch.par_iter().for_each(|&(a_tile, out)| {
        diag_step(params, a_tile, &mut out.lock());
    });

    // One batch per accumulation level, the batch boundary orders the updates of a tile.
    let depth = chains.first().map_or(0, |chain| chain.terms.len());
    for level in 0..depth {
        let mut batch: Vec<(&Tile<T>, Tile<T>, &TileHandle<T>)> = Vec::with_capacity(chains.len());
        for (chain, &out) in chains.iter().zip(&outputs) {
            let (ak, (bi, bj)) = chain.terms[level];
            if let Some(a_tile) = a_tiles.get(&ak) {
                batch.push((a_tile, b.local_tile(OP, bi, bj)?.lock().clone(), out));
            }
        }
        batch.par_iter().for_each(|(a_tile, b_tile, out)| {
            update_step(params, a_tile, b_tile, &mut out.lock());
        });
    }
    Ok(())
}

// ———————————————————————————————— Devices ———————————————————————————————— //

/// Everything a chain needs, copied to its device.
struct DeviceChain<T> {
    chain: Chain,
    b_tiles: BTreeMap<Coord, Tile<T>>,
    out: Tile<T>,
}

fn devices<T: Scalar>(
    params: Params<T>,
    a: &Matrix<T>,
    b: &Matrix<T>,
    chains: &[Chain],
) -> Result<()> {
    // Chains run on the device owning their output tile.
    let mut per_device: BTreeMap<usize, Vec<&Chain>> = BTreeMap::new();
    for chain in chains {
        per_device
            .entry(b.tile_device(chain.out.0, chain.out.1))
            .or_default()
            .push(chain);
    }

    let joined = thread::scope(|scope| -> Result<()> {
        let mut launches = Vec::with_capacity(per_device.len());
        for (&device, device_chains) in &per_device {
            // Host to device.
            let owned: Vec<Chain> = device_chains.iter().map(|&chain| chain.clone()).collect();
            let a_tiles = snapshot(a, &owned)?;
            let mut work = Vec::with_capacity(owned.len());
            for chain in owned {
                let mut b_tiles = BTreeMap::new();
                for &(_, (bi, bj)) in &chain.terms {
                    b_tiles.insert((bi, bj), b.local_tile(OP, bi, bj)?.lock().clone());
                }
                let out = b.local_tile(OP, chain.out.0, chain.out.1)?.lock().clone();
                work.push(DeviceChain {
                    chain,
                    b_tiles,
                    out,
                });
            }
            debug!(device, chains = work.len(), "trmm launch");

            let launch = scope
                .builder()
                .name(format!("device{}", device))
                .spawn(move |_| -> Result<Vec<DeviceChain<T>>> {
                    for item in work.iter_mut() {
                        let b_tiles = &item.b_tiles;
                        run_chain(
                            params,
                            &a_tiles,
                            &item.chain,
                            |coord| {
                                b_tiles.get(&coord).cloned().ok_or_else(|| unstaged(coord))
                            },
                            &mut item.out,
                        )?;
                    }
                    Ok(work)
                })?;
            launches.push(launch);
        }

        // Device to host.
        for launch in launches {
            let done = launch.join().map_err(|_| Error::WorkerPanicked)??;
            for item in done {
                let (i, j) = item.chain.out;
                *b.local_tile(OP, i, j)?.lock() = item.out;
            }
        }
        Ok(())
    });
    joined.unwrap_or(Err(Error::WorkerPanicked))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use crate::data::Handle;

    fn block_row(nb: usize, k: usize) -> TriangularMatrix<f64> {
        let mut a = Matrix::uniform(nb, nb * k, nb, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|i, j| 1.0 + (i + 2 * j) as f64 / 10.0);
        TriangularMatrix::new(Uplo::Lower, Diag::NonUnit, a)
    }

    #[test]
    fn mismatched_blocks_are_rejected_before_any_work() {
        let a = block_row(2, 3);
        let mut b = Matrix::uniform(4, 2, 2, 1, 1, SelfComm::shared()).unwrap();
        b.fill_with(|_, _| 1.0);
        let err = trmm(Side::Left, Diag::NonUnit, 1.0, a, b.clone(), 0, Target::HostTask);
        assert!(matches!(err, Err(Error::BlockMismatch { .. })));
        assert!(b.to_dense().unwrap().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn tall_a_is_rejected_on_the_left() {
        let mut a = Matrix::uniform(4, 4, 2, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|_, _| 1.0);
        let a = TriangularMatrix::new(Uplo::Lower, Diag::Unit, a);
        let b = Matrix::uniform(4, 2, 2, 1, 1, SelfComm::shared()).unwrap();
        let err = trmm(Side::Left, Diag::Unit, 1.0, a, b, 0, Target::HostNest);
        assert!(matches!(err, Err(Error::BlockMismatch { .. })));
    }

    #[test]
    fn chains_walk_k_downwards() {
        let a = block_row(2, 3);
        let b = Matrix::<f64>::uniform(6, 4, 2, 1, 1, SelfComm::shared()).unwrap();
        let chains = plan(Side::Left, &a, &b).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[1].out, (2, 1));
        assert_eq!(chains[1].diag, (0, 2));
        assert_eq!(chains[1].terms, vec![((0, 1), (1, 1)), ((0, 0), (0, 1))]);
    }

    #[test]
    fn update_step_accumulates() {
        let params = Params {
            side: Side::Left,
            uplo: Uplo::Lower,
            op: Op::NoTrans,
            diag: Diag::NonUnit,
            alpha: 2.0,
        };
        let a = Tile::from_col_major(1, 1, vec![3.0]);
        let b = Tile::from_col_major(1, 1, vec![4.0]);
        let out = Handle::new(Tile::from_col_major(1, 1, vec![1.0]));
        update_step(params, &a, &b, &mut out.lock());
        assert_eq!(out.lock()[(0, 0)], 25.0);
    }
}
