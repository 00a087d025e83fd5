//! How a matrix is cut into tiles and spread over processes and devices.

use std::fmt;
use std::sync::Arc;

/// Tile index to tile size (rows of tile-row `i`, or columns of tile-column `j`).
pub type TileSizeFn = Arc<dyn Fn(usize) -> usize + Send + Sync>;

/// Tile coordinates to owner (process rank or device index).
pub type TileMapFn = Arc<dyn Fn((usize, usize)) -> usize + Send + Sync>;

/// Blocks of `nb`, the last one holding the remainder of `n`.
pub fn uniform_blocksize(n: usize, nb: usize) -> TileSizeFn {
    assert!(nb > 0, "block size must be positive");
    Arc::new(move |k: usize| {
        if k < n / nb {
            nb
        } else {
            n % nb
        }
    })
}

/// 2D block cyclic distribution over a `p x q` process grid, column-major rank order.
pub fn block_cyclic_2d(p: usize, q: usize) -> TileMapFn {
    assert!(p > 0 && q > 0, "process grid must be non-empty");
    Arc::new(move |(i, j): (usize, usize)| (i % p) + (j % q) * p)
}

/// Spread tiles over `num_devices` devices.
pub fn device_round_robin(num_devices: usize) -> TileMapFn {
    assert!(num_devices > 0, "need at least one device");
    Arc::new(move |(i, j): (usize, usize)| (i + j) % num_devices)
}

/// Every tile on process 0.
pub fn single_process() -> TileMapFn {
    Arc::new(|_: (usize, usize)| 0)
}

pub struct Layout {
    m: usize,
    n: usize,
    row_offsets: Vec<usize>,
    col_offsets: Vec<usize>,
    tile_rank: TileMapFn,
    tile_device: TileMapFn,
}

fn offsets(extent: usize, size: &TileSizeFn) -> Vec<usize> {
    let mut offsets = vec![0];
    let mut covered = 0;
    while covered < extent {
        let block = size(offsets.len() - 1).min(extent - covered);
        assert!(block > 0, "tile size function returned an empty tile");
        covered += block;
        offsets.push(covered);
    }
    offsets
}

impl Layout {
    pub fn new(
        m: usize,
        n: usize,
        tile_mb: TileSizeFn,
        tile_nb: TileSizeFn,
        tile_rank: TileMapFn,
        tile_device: TileMapFn,
    ) -> Self {
        Self {
            m,
            n,
            row_offsets: offsets(m, &tile_mb),
            col_offsets: offsets(n, &tile_nb),
            tile_rank,
            tile_device,
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn mt(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn nt(&self) -> usize {
        self.col_offsets.len() - 1
    }

    pub fn tile_mb(&self, i: usize) -> usize {
        self.row_offsets[i + 1] - self.row_offsets[i]
    }

    pub fn tile_nb(&self, j: usize) -> usize {
        self.col_offsets[j + 1] - self.col_offsets[j]
    }

    pub fn row_offset(&self, i: usize) -> usize {
        self.row_offsets[i]
    }

    pub fn col_offset(&self, j: usize) -> usize {
        self.col_offsets[j]
    }

    /// The tile-row holding global row `row`, and the row within that tile.
    pub fn row_tile(&self, row: usize) -> (usize, usize) {
        let i = self.row_offsets.partition_point(|&offset| offset <= row) - 1;
        (i, row - self.row_offsets[i])
    }

    pub fn tile_rank(&self, i: usize, j: usize) -> usize {
        (self.tile_rank)((i, j))
    }

    pub fn tile_device(&self, i: usize, j: usize) -> usize {
        (self.tile_device)((i, j))
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("m", &self.m)
            .field("n", &self.n)
            .field("mt", &self.mt())
            .field("nt", &self.nt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uneven_blocking_keeps_the_remainder() {
        let layout = Layout::new(
            10,
            7,
            uniform_blocksize(10, 4),
            uniform_blocksize(7, 7),
            single_process(),
            single_process(),
        );
        assert_eq!((layout.mt(), layout.nt()), (3, 1));
        assert_eq!(layout.tile_mb(2), 2);
        assert_eq!(layout.row_tile(9), (2, 1));
        assert_eq!(layout.row_tile(4), (1, 0));
    }

    #[test]
    fn block_cyclic_covers_the_grid() {
        let rank = block_cyclic_2d(2, 3);
        assert_eq!(rank((0, 0)), 0);
        assert_eq!(rank((1, 0)), 1);
        assert_eq!(rank((0, 1)), 2);
        assert_eq!(rank((3, 5)), 1 + 2 * 2);
    }
}
