//! # Distributed tiled matrices
//!
//! A `Matrix` is a window over a tiled layout plus the tiles of that layout resident on the
//! calling process. Tiles are keyed by their coordinates in the full layout; a window (offsets,
//! tile counts and an `Op`) maps logical tile coordinates to those keys. Sub-matrices,
//! conjugate-transposed views and triangular views all share the same tiles: creating a view
//! never copies data.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::Arc;

use crate::comm::{Collective, Communicator};
use crate::data::{Fence, Handle};
use crate::error::{Error, Result};
use crate::layout::{block_cyclic_2d, single_process, uniform_blocksize, Layout, TileMapFn, TileSizeFn};
use crate::scalar::{Element, Scalar};
use crate::tile::Tile;
use crate::types::{Diag, Op, Uplo};

pub type TileHandle<T> = Handle<Tile<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    ioffset: usize,
    joffset: usize,
    // Tile counts of the stored (not transposed) window.
    mt: usize,
    nt: usize,
    op: Op,
}

impl Window {
    fn physical(&self, i: usize, j: usize) -> (usize, usize) {
        match self.op {
            Op::NoTrans => (self.ioffset + i, self.joffset + j),
            Op::ConjTrans => (self.ioffset + j, self.joffset + i),
        }
    }

    fn logical(&self, (pi, pj): (usize, usize)) -> Option<(usize, usize)> {
        let inside = pi >= self.ioffset
            && pi < self.ioffset + self.mt
            && pj >= self.joffset
            && pj < self.joffset + self.nt;
        if !inside {
            return None;
        }
        let (i, j) = (pi - self.ioffset, pj - self.joffset);
        match self.op {
            Op::NoTrans => Some((i, j)),
            Op::ConjTrans => Some((j, i)),
        }
    }
}

pub struct Matrix<T> {
    tiles: BTreeMap<(usize, usize), TileHandle<T>>,
    layout: Arc<Layout>,
    window: Window,
    comm: Arc<dyn Communicator>,
}

impl<T> Clone for Matrix<T> {
    fn clone(&self) -> Self {
        Self {
            tiles: self.tiles.clone(),
            layout: self.layout.clone(),
            window: self.window,
            comm: self.comm.clone(),
        }
    }
}

impl<T: Element> Matrix<T> {
    /// An `m x n` matrix with no tiles inserted yet.
    pub fn new(
        m: usize,
        n: usize,
        tile_mb: TileSizeFn,
        tile_nb: TileSizeFn,
        tile_rank: TileMapFn,
        tile_device: TileMapFn,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let layout = Layout::new(m, n, tile_mb, tile_nb, tile_rank, tile_device);
        Self::from_layout(Arc::new(layout), comm)
    }

    pub fn from_layout(layout: Arc<Layout>, comm: Arc<dyn Communicator>) -> Self {
        let window = Window {
            ioffset: 0,
            joffset: 0,
            mt: layout.mt(),
            nt: layout.nt(),
            op: Op::NoTrans,
        };
        Self {
            tiles: BTreeMap::new(),
            layout,
            window,
            comm,
        }
    }

    /// `nb x nb` tiles distributed 2D block cyclically over a `p x q` grid, with local tiles
    /// inserted. Each rank holds one device.
    pub fn uniform(
        m: usize,
        n: usize,
        nb: usize,
        p: usize,
        q: usize,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        if p * q != comm.size() {
            return Err(Error::mismatch(
                "Matrix::uniform",
                format!("{} x {} grid over {} ranks", p, q, comm.size()),
            ));
        }
        let mut matrix = Self::new(
            m,
            n,
            uniform_blocksize(m, nb),
            uniform_blocksize(n, nb),
            block_cyclic_2d(p, q),
            single_process(),
            comm,
        );
        matrix.insert_local_tiles();
        Ok(matrix)
    }

    /// An `m x 1` matrix sharing this matrix's row blocking and row distribution, with its
    /// local tiles inserted.
    pub fn column_like<U: Element>(&self) -> Matrix<U> {
        let window = self.window;
        let layout = self.layout.clone();
        let rows = Arc::new((0..self.mt()).map(|i| self.tile_mb(i)).collect::<Vec<_>>());
        let (rank_layout, device_layout) = (layout.clone(), layout);

        let mut column = Matrix::new(
            self.m(),
            1,
            Arc::new(move |i: usize| rows[i]),
            uniform_blocksize(1, 1),
            Arc::new(move |(i, j): (usize, usize)| {
                let (pi, pj) = window.physical(i, j);
                rank_layout.tile_rank(pi, pj)
            }),
            Arc::new(move |(i, j): (usize, usize)| {
                let (pi, pj) = window.physical(i, j);
                device_layout.tile_device(pi, pj)
            }),
            self.comm.clone(),
        );
        column.insert_local_tiles();
        column
    }

    /// Allocate a zero tile for every tile of the window owned by this process.
    pub fn insert_local_tiles(&mut self) {
        for i in 0..self.mt() {
            for j in 0..self.nt() {
                if self.tile_is_local(i, j) {
                    let key = self.window.physical(i, j);
                    let (mb, nb) = (self.layout.tile_mb(key.0), self.layout.tile_nb(key.1));
                    self.tiles
                        .entry(key)
                        .or_insert_with(|| Handle::new(Tile::zeros(mb, nb)));
                }
            }
        }
    }

    /// Make tile `(i, j)` available on every rank of `dests`.
    ///
    /// Returns the stored tile on its owner and on the destinations, `None` elsewhere. Every rank
    /// of the group must make the same sequence of calls so that sends and receives pair up.
    pub(crate) fn share_tile(
        &self,
        op: &'static str,
        i: usize,
        j: usize,
        dests: &BTreeSet<usize>,
    ) -> Result<Option<Tile<T>>> {
        let owner = self.tile_rank(i, j);
        let me = self.comm.rank();
        if me == owner {
            let tile = self.local_tile(op, i, j)?.lock().clone();
            for &dest in dests.iter().filter(|&&dest| dest != owner) {
                self.comm.send_value(dest, tile.clone())?;
            }
            Ok(Some(tile))
        } else if dests.contains(&me) {
            Ok(Some(self.comm.recv_value(owner)?))
        } else {
            Ok(None)
        }
    }

    /// Keep a copy of remote tile `(i, j)` in this matrix. Only meant for private clones: the
    /// copy is seen by this handle and its later clones, never by the owner.
    pub(crate) fn stage_tile(&mut self, i: usize, j: usize, tile: Tile<T>) {
        let key = self.window.physical(i, j);
        self.tiles.entry(key).or_insert_with(|| Handle::new(tile));
    }

    /// Set every locally stored element from its global coordinates in the stored matrix.
    pub fn fill_with(&mut self, f: impl Fn(usize, usize) -> T) {
        for (&(pi, pj), handle) in &self.tiles {
            let (row0, col0) = (self.layout.row_offset(pi), self.layout.col_offset(pj));
            let mut tile = handle.lock();
            for jj in 0..tile.nb() {
                for ii in 0..tile.mb() {
                    tile[(ii, jj)] = f(row0 + ii, col0 + jj);
                }
            }
        }
    }
}

impl<T> Matrix<T> {
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn op(&self) -> Op {
        self.window.op
    }

    /// Number of tile-rows.
    pub fn mt(&self) -> usize {
        match self.window.op {
            Op::NoTrans => self.window.mt,
            Op::ConjTrans => self.window.nt,
        }
    }

    /// Number of tile-columns.
    pub fn nt(&self) -> usize {
        match self.window.op {
            Op::NoTrans => self.window.nt,
            Op::ConjTrans => self.window.mt,
        }
    }

    pub fn m(&self) -> usize {
        (0..self.mt()).map(|i| self.tile_mb(i)).sum()
    }

    pub fn n(&self) -> usize {
        (0..self.nt()).map(|j| self.tile_nb(j)).sum()
    }

    pub fn tile_mb(&self, i: usize) -> usize {
        match self.window.op {
            Op::NoTrans => self.layout.tile_mb(self.window.ioffset + i),
            Op::ConjTrans => self.layout.tile_nb(self.window.joffset + i),
        }
    }

    pub fn tile_nb(&self, j: usize) -> usize {
        match self.window.op {
            Op::NoTrans => self.layout.tile_nb(self.window.joffset + j),
            Op::ConjTrans => self.layout.tile_mb(self.window.ioffset + j),
        }
    }

    /// First row of tile-row `i`, relative to the window.
    pub fn row_offset(&self, i: usize) -> usize {
        (0..i).map(|k| self.tile_mb(k)).sum()
    }

    /// First column of tile-column `j`, relative to the window.
    pub fn col_offset(&self, j: usize) -> usize {
        (0..j).map(|k| self.tile_nb(k)).sum()
    }

    /// Tile-row holding window row `row`, and the row within that tile.
    pub fn row_tile(&self, row: usize) -> (usize, usize) {
        let mut first = 0;
        for i in 0..self.mt() {
            let mb = self.tile_mb(i);
            if row < first + mb {
                return (i, row - first);
            }
            first += mb;
        }
        (self.mt(), row - first)
    }

    pub fn tile_rank(&self, i: usize, j: usize) -> usize {
        let (pi, pj) = self.window.physical(i, j);
        self.layout.tile_rank(pi, pj)
    }

    pub fn tile_device(&self, i: usize, j: usize) -> usize {
        let (pi, pj) = self.window.physical(i, j);
        self.layout.tile_device(pi, pj)
    }

    pub fn tile_is_local(&self, i: usize, j: usize) -> bool {
        self.tile_rank(i, j) == self.comm.rank()
    }

    /// The stored tile behind logical tile `(i, j)`, read through `self.op()`.
    pub fn tile(&self, i: usize, j: usize) -> Option<&TileHandle<T>> {
        self.tiles.get(&self.window.physical(i, j))
    }

    pub fn tile_mut(&mut self, i: usize, j: usize) -> Option<&mut TileHandle<T>> {
        let key = self.window.physical(i, j);
        self.tiles.get_mut(&key)
    }

    /// Like `tile`, but a missing tile is an error naming `op`.
    pub fn local_tile(&self, op: &'static str, i: usize, j: usize) -> Result<&TileHandle<T>> {
        self.tile(i, j).ok_or(Error::TileNotLocal {
            op,
            i,
            j,
            rank: self.comm.rank(),
        })
    }

    /// Logical coordinates of the resident tiles inside the window.
    pub fn local_tiles(&self) -> impl Iterator<Item = ((usize, usize), &TileHandle<T>)> + '_ {
        self.tiles
            .iter()
            .filter_map(move |(&key, handle)| self.window.logical(key).map(|ij| (ij, handle)))
    }

    /// Tiles `i1..=i2` by `j1..=j2` of this matrix.
    pub fn sub(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Result<Self> {
        if i1 > i2 || i2 >= self.mt() || j1 > j2 || j2 >= self.nt() {
            return Err(Error::mismatch(
                "Matrix::sub",
                format!(
                    "tiles {}..={} x {}..={} of a {} x {} tile grid",
                    i1,
                    i2,
                    j1,
                    j2,
                    self.mt(),
                    self.nt()
                ),
            ));
        }
        let (pi, pj) = self.window.physical(i1, j1);
        let (rows, cols) = (i2 - i1 + 1, j2 - j1 + 1);
        let (mt, nt) = match self.window.op {
            Op::NoTrans => (rows, cols),
            Op::ConjTrans => (cols, rows),
        };
        let window = Window {
            ioffset: pi,
            joffset: pj,
            mt,
            nt,
            op: self.window.op,
        };
        Ok(Self {
            window,
            ..self.clone()
        })
    }

    /// Conjugate-transposed view, sharing the tiles.
    pub fn conj_transpose(&self) -> Self {
        let mut view = self.clone();
        view.window.op = self.window.op.flip();
        view
    }
}

impl<T: Scalar> Matrix<T> {
    /// Assemble the whole (logical) matrix on every rank, column-major. Collective.
    pub fn to_dense(&self) -> Result<Vec<T>> {
        let local: Vec<((usize, usize), Tile<T>)> = self
            .local_tiles()
            .map(|(ij, handle)| (ij, handle.lock().clone()))
            .collect();
        let gathered = self.comm.all_gather(local)?;

        let m = self.m();
        let mut dense = vec![T::zero(); m * self.n()];
        let op = self.op();
        for ((i, j), tile) in gathered.into_iter().flatten() {
            let (row0, col0) = (self.row_offset(i), self.col_offset(j));
            let (mb, nb) = tile.shape(op);
            for jj in 0..nb {
                for ii in 0..mb {
                    dense[(row0 + ii) + (col0 + jj) * m] = tile.at(op, ii, jj);
                }
            }
        }
        Ok(dense)
    }
}

impl<T> Fence for Matrix<T> {
    unsafe fn fence(&mut self) {
        for handle in self.tiles.values_mut() {
            handle.fence();
        }
    }
}

// ——————————————————————————— Triangular Matrix ———————————————————————————— //

/// A matrix read as triangular, the other triangle being implicitly zero.
#[derive(Clone)]
pub struct TriangularMatrix<T> {
    matrix: Matrix<T>,
    // Triangle of the stored tiles.
    uplo: Uplo,
    diag: Diag,
}

impl<T> TriangularMatrix<T> {
    pub fn new(uplo: Uplo, diag: Diag, matrix: Matrix<T>) -> Self {
        Self { matrix, uplo, diag }
    }

    /// Triangle of `op(A)`, the one algorithms work with.
    pub fn uplo(&self) -> Uplo {
        match self.matrix.op() {
            Op::NoTrans => self.uplo,
            Op::ConjTrans => self.uplo.flip(),
        }
    }

    pub fn diag(&self) -> Diag {
        self.diag
    }

    pub fn conj_transpose(&self) -> Self {
        Self {
            matrix: self.matrix.conj_transpose(),
            uplo: self.uplo,
            diag: self.diag,
        }
    }

    pub fn sub(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Result<Self> {
        Ok(Self {
            matrix: self.matrix.sub(i1, i2, j1, j2)?,
            uplo: self.uplo,
            diag: self.diag,
        })
    }

    pub fn as_matrix(&self) -> &Matrix<T> {
        &self.matrix
    }
}

impl<T> Deref for TriangularMatrix<T> {
    type Target = Matrix<T>;

    fn deref(&self) -> &Matrix<T> {
        &self.matrix
    }
}

impl<T> Fence for TriangularMatrix<T> {
    unsafe fn fence(&mut self) {
        self.matrix.fence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{spawn_group, SelfComm};

    fn numbered(m: usize, n: usize, nb: usize) -> Matrix<f64> {
        let mut a = Matrix::uniform(m, n, nb, 1, 1, SelfComm::shared()).unwrap();
        a.fill_with(|i, j| (i * 100 + j) as f64);
        a
    }

    #[test]
    fn sub_and_conj_transpose_share_tiles() {
        let a = numbered(7, 5, 3);
        assert_eq!((a.mt(), a.nt()), (3, 2));

        let at = a.conj_transpose();
        assert_eq!((at.mt(), at.nt()), (2, 3));
        assert_eq!((at.tile_mb(1), at.tile_nb(2)), (2, 1));
        assert!(at.tile(1, 2).unwrap().same_data(a.tile(2, 1).unwrap()));

        let s = at.sub(1, 1, 1, 2).unwrap();
        assert_eq!((s.mt(), s.nt()), (1, 2));
        assert!(s.tile(0, 1).unwrap().same_data(a.tile(2, 1).unwrap()));
        assert_eq!(s.local_tiles().count(), 2);
    }

    #[test]
    fn sub_outside_the_grid_is_a_mismatch() {
        let a = numbered(7, 5, 3);
        assert!(matches!(a.sub(0, 3, 0, 0), Err(Error::BlockMismatch { .. })));
        assert!(matches!(a.sub(2, 1, 0, 0), Err(Error::BlockMismatch { .. })));
        let l = TriangularMatrix::new(Uplo::Lower, Diag::Unit, a);
        assert!(matches!(l.sub(0, 0, 1, 2), Err(Error::BlockMismatch { .. })));
    }

    #[test]
    fn shared_tiles_reach_their_destinations_only() {
        let seen = spawn_group(3, |comm| {
            let mut a = Matrix::uniform(4, 6, 2, 1, 3, comm).unwrap();
            a.fill_with(|i, j| (i * 10 + j) as f64);
            let dests: BTreeSet<usize> = [0].into_iter().collect();
            // Tile (1, 2) lives on rank 2.
            let tile = a.share_tile("test", 1, 2, &dests).unwrap();
            tile.map(|tile| tile[(0, 1)])
        })
        .unwrap();
        assert_eq!(seen, vec![Some(25.0), None, Some(25.0)]);
    }

    #[test]
    fn staged_tiles_stay_private() {
        let a = numbered(4, 4, 2);
        let mut work = a.sub(0, 0, 0, 1).unwrap();
        work.stage_tile(0, 1, Tile::zeros(2, 2));
        // Already resident: the staged copy is ignored.
        assert!(work.tile(0, 1).unwrap().same_data(a.tile(0, 1).unwrap()));
        let mut empty = Matrix::<f64>::new(
            4,
            4,
            uniform_blocksize(4, 2),
            uniform_blocksize(4, 2),
            single_process(),
            single_process(),
            SelfComm::shared(),
        );
        let view = empty.clone();
        empty.stage_tile(1, 0, Tile::zeros(2, 2));
        assert!(empty.tile(1, 0).is_some());
        assert!(view.tile(1, 0).is_none());
    }

    #[test]
    fn to_dense_applies_the_view() {
        let a = numbered(4, 3, 2);
        let dense = a.conj_transpose().to_dense().unwrap();
        // (0, 3) of A^H is A(3, 0).
        assert_eq!(dense[0 + 3 * 3], 300.0);
    }

    #[test]
    fn triangular_view_flips_with_conj_transpose() {
        let a = numbered(4, 4, 2);
        let l = TriangularMatrix::new(Uplo::Lower, Diag::Unit, a);
        assert_eq!(l.uplo(), Uplo::Lower);
        assert_eq!(l.conj_transpose().uplo(), Uplo::Upper);
        assert_eq!(l.conj_transpose().diag(), Diag::Unit);
    }

    #[test]
    fn tiles_live_on_their_owner_only() {
        let counts = spawn_group(4, |comm| {
            let a = Matrix::<f64>::uniform(8, 8, 2, 2, 2, comm).unwrap();
            let dense = a.to_dense().unwrap();
            (a.local_tiles().count(), dense.len())
        })
        .unwrap();
        assert_eq!(counts, vec![(4, 64); 4]);
    }

    #[test]
    fn column_like_follows_row_distribution() {
        spawn_group(2, |comm| {
            let a = Matrix::<f64>::uniform(5, 5, 2, 2, 1, comm).unwrap();
            let x: Matrix<i64> = a.column_like();
            assert_eq!((x.mt(), x.nt(), x.m()), (3, 1, 5));
            for i in 0..3 {
                assert_eq!(x.tile_rank(i, 0), a.tile_rank(i, 0));
                assert_eq!(x.tile_is_local(i, 0), x.tile(i, 0).is_some());
            }
        })
        .unwrap();
    }
}
