//! Grid-level algebra: vectors, sparse block matrices and the hierarchy

mod grid;
mod matrix;
mod multigrid;
mod pool;
mod vector;

pub use grid::{BlockVector, GridLevel, Prolongation};
pub use matrix::{LevelMatrix, MatrixEntry, SparseBlockMatrix};
pub use multigrid::{DEFAULT_COMPONENT_CAPACITY, Multigrid};
pub use pool::{ComponentPool, SharedPool, TempVector};
pub use vector::{Priority, SkipMask, Vector};
