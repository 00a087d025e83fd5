#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tessel::layout::{uniform_blocksize, TileMapFn, TileSizeFn};
use tessel::{Communicator, Matrix, Real, Scalar};

/// Column-major `rows x cols` values in `[lo, hi)`.
pub fn random_dense(rows: usize, cols: usize, lo: f64, hi: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols).map(|_| rng.gen_range(lo..hi)).collect()
}

pub fn tiled(
    dense: &[f64],
    (m, n): (usize, usize),
    (tile_mb, tile_nb): (TileSizeFn, TileSizeFn),
    (tile_rank, tile_device): (TileMapFn, TileMapFn),
    comm: Arc<dyn Communicator>,
) -> Matrix<f64> {
    let mut a = Matrix::new(m, n, tile_mb, tile_nb, tile_rank, tile_device, comm);
    a.insert_local_tiles();
    a.fill_with(|i, j| dense[i + j * m]);
    a
}

pub fn uniform(
    dense: &[f64],
    (m, n): (usize, usize),
    nb: usize,
    (p, q): (usize, usize),
    comm: Arc<dyn Communicator>,
) -> Matrix<f64> {
    let mut a = Matrix::uniform(m, n, nb, p, q, comm).unwrap();
    a.fill_with(|i, j| dense[i + j * m]);
    a
}

/// Size of the last of the blocks `uniform_blocksize(n, nb)` cuts.
pub fn last_block(n: usize, nb: usize) -> usize {
    let blocks = (n + nb - 1) / nb;
    uniform_blocksize(n, nb)(blocks - 1)
}

/// Dense `C = A B`, all column-major.
pub fn matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut c = vec![0.0; m * n];
    for j in 0..n {
        for l in 0..k {
            for i in 0..m {
                c[i + j * m] += a[i + l * m] * b[l + j * k];
            }
        }
    }
    c
}

/// Max column sum of `|A|` for a square column-major `A`.
pub fn norm1<T: Scalar>(a: &[T], n: usize) -> f64 {
    (0..n)
        .map(|j| (0..n).map(|i| Scalar::abs(a[i + j * n]).as_f64()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Inverse of a square column-major matrix by Gauss-Jordan elimination with partial pivoting.
pub fn inverse<T: Scalar>(a: &[T], n: usize) -> Vec<T> {
    let modulus = |x: T| Scalar::abs(x).as_f64();
    let mut work = a.to_vec();
    let mut inv: Vec<T> = (0..n * n)
        .map(|k| if k % n == k / n { T::one() } else { T::zero() })
        .collect();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| modulus(work[x + col * n]).total_cmp(&modulus(work[y + col * n])))
            .unwrap();
        for j in 0..n {
            work.swap(col + j * n, pivot + j * n);
            inv.swap(col + j * n, pivot + j * n);
        }
        let d = work[col + col * n];
        for j in 0..n {
            work[col + j * n] /= d;
            inv[col + j * n] /= d;
        }
        for i in (0..n).filter(|&i| i != col) {
            let f = work[i + col * n];
            for j in 0..n {
                let (w, v) = (work[col + j * n], inv[col + j * n]);
                work[i + j * n] -= f * w;
                inv[i + j * n] -= f * v;
            }
        }
    }
    inv
}
