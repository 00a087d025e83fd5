//! Error types for tessel.
//!
//! Every precondition is checked before any task is spawned or any collective is issued, so an
//! `Err` never leaves a matrix half updated or a process group half synchronized.

use crate::types::Norm;
use thiserror::Error;

/// Result type alias using tessel's Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Tile grids of the operands do not conform.
    #[error("{op}: tile grid mismatch, {detail}")]
    BlockMismatch { op: &'static str, detail: String },

    /// The norm class is not accepted by the operation.
    #[error("{op}: invalid norm {norm:?}")]
    InvalidNorm { op: &'static str, norm: Norm },

    /// The supplied matrix norm is negative or NaN.
    #[error("invalid Anorm {0}, expected a non-negative number")]
    InvalidAnorm(f64),

    /// An option carries a value that cannot be interpreted.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    /// A task needs a tile that lives on another process.
    #[error("{op}: tile ({i}, {j}) is not resident on rank {rank}")]
    TileNotLocal {
        op: &'static str,
        i: usize,
        j: usize,
        rank: usize,
    },

    /// LU without pivoting hit an exact zero on the diagonal (global row index).
    #[error("zero pivot at row {index}")]
    ZeroPivot { index: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure of the communication layer, e.g. a peer hung up.
    #[error("communication failure: {0}")]
    Comm(String),

    #[error("a worker thread panicked")]
    WorkerPanicked,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn mismatch(op: &'static str, detail: impl Into<String>) -> Self {
        Error::BlockMismatch {
            op,
            detail: detail.into(),
        }
    }
}
