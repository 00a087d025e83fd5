//! # Tessel
//!
//! Tiled dense linear algebra over a group of processes. Matrices are cut into tiles spread over
//! the ranks of a `Communicator`; blocked algorithms run as tasks over those tiles on one of the
//! execution `Target`s.
//!
//! The task runtime (`Handle`, `Runtime`, `run_tasks` and the `task!` macro) needs no scheduler
//! thread: every worker walks the same program, numbers tasks identically and only executes the
//! ones mapped to it, waiting on the handles of the tiles it touches.

pub mod blas;
pub mod comm;
mod data;
mod error;
pub mod gecondest;
mod getrf;
pub mod layout;
mod matrix;
pub mod norm;
pub mod norm1est;
mod options;
mod runtime;
mod scalar;
mod task_macro;
mod tile;
pub mod trmm;
mod trsm;
mod types;

pub use comm::{spawn_group, Collective, Communicator, SelfComm, ThreadComm};
pub use data::*;
pub use error::{Error, Result};
pub use gecondest::gecondest;
pub use getrf::getrf_nopiv;
pub use matrix::{Matrix, TileHandle, TriangularMatrix};
pub use norm::norm;
pub use norm1est::{norm1est, synchronize, EstimatorState, Step};
pub use options::{Options, TARGET};
pub use runtime::*;
pub use scalar::{Element, Real, Scalar};
pub use tile::Tile;
pub use trmm::trmm;
pub use trsm::trsm;
pub use types::{Diag, Norm, Op, Side, Target, Uplo};
