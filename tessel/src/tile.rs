//! # Tile
//!
//! A tile is the unit of distribution and of task granularity: a dense, column-major `mb x nb`
//! block. Tiles never know where they sit in a matrix; the matrix container maps tile
//! coordinates to tiles and to their owning process.

use std::ops::{Index, IndexMut};

use crate::scalar::{Element, Scalar};
use crate::types::Op;

#[derive(Debug, Clone, PartialEq)]
pub struct Tile<T> {
    mb: usize,
    nb: usize,
    data: Vec<T>,
}

impl<T: Element> Tile<T> {
    pub fn zeros(mb: usize, nb: usize) -> Self {
        Self {
            mb,
            nb,
            data: vec![T::default(); mb * nb],
        }
    }

    /// Build a tile from a column-major buffer.
    pub fn from_col_major(mb: usize, nb: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), mb * nb, "tile buffer has the wrong length");
        Self { mb, nb, data }
    }

    pub fn from_fn(mb: usize, nb: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(mb * nb);
        for j in 0..nb {
            for i in 0..mb {
                data.push(f(i, j));
            }
        }
        Self { mb, nb, data }
    }

    pub fn mb(&self) -> usize {
        self.mb
    }

    pub fn nb(&self) -> usize {
        self.nb
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Scalar> Tile<T> {
    /// Element `(i, j)` of `op(self)`.
    #[inline]
    pub fn at(&self, op: Op, i: usize, j: usize) -> T {
        match op {
            Op::NoTrans => self[(i, j)],
            Op::ConjTrans => self[(j, i)].conj(),
        }
    }

    /// Shape of `op(self)`.
    #[inline]
    pub fn shape(&self, op: Op) -> (usize, usize) {
        match op {
            Op::NoTrans => (self.mb, self.nb),
            Op::ConjTrans => (self.nb, self.mb),
        }
    }
}

impl<T> Index<(usize, usize)> for Tile<T> {
    type Output = T;

    #[inline]
    fn index(&self, (i, j): (usize, usize)) -> &T {
        &self.data[i + j * self.mb]
    }
}

impl<T> IndexMut<(usize, usize)> for Tile<T> {
    #[inline]
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        &mut self.data[i + j * self.mb]
    }
}
