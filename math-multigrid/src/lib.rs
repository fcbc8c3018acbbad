//! Algebraic multigrid solver core
//!
//! This crate provides the numerical core of a multigrid solver on a grid
//! hierarchy whose degrees of freedom are grouped into vectors of mesh
//! entities. Data is addressed symbolically through descriptors, so one
//! level storage holds every solution, defect and matrix of a problem.
//!
//! # Features
//!
//! - **Descriptors**: type-indexed vector and matrix descriptors with shape checks
//! - **Smoothers**: Jacobi, Gauss-Seidel, SOR, symmetric GS, block GS, ILU family,
//!   incomplete Cholesky, direct LU, tangential frequency filtering
//! - **Cycle**: recursive V/W-cycle with grid transfer and a base solver
//! - **Distributed consistency**: sum, overwrite, min/max and skip-mask merges over
//!   processor interfaces, with serial and in-process channel communicators
//!
//! # Example
//!
//! ```ignore
//! use math_audio_multigrid::{Lmgc, Multigrid, SolverConfig, solve_multigrid};
//!
//! let mut mg = Multigrid::new(4);
//! let x = mg.create_vec_desc("x", [1, 0, 0, 0])?;
//! let b = mg.create_vec_desc("b", [1, 0, 0, 0])?;
//! let a = mg.create_mat_desc("A", &b, &x)?;
//! // ... fill levels, prolongations and matrices ...
//!
//! let mut cycle = Lmgc::from_config(&SolverConfig::default())?;
//! let result = solve_multigrid(&mut mg, &mut cycle, &x, &b, &a, &Default::default())?;
//! ```

pub mod algebra;
pub mod base;
pub mod blas;
pub mod config;
pub mod cycle;
pub mod dense;
pub mod descriptor;
pub mod error;
pub mod parallel;
pub mod smoother;
pub mod transfer;

// Re-export main types
pub use algebra::{GridLevel, Multigrid, Prolongation, SkipMask, TempVector};
pub use descriptor::{GeomType, MAX_BLOCK_SIZE, MatDesc, VecDesc, check_vec_mat_vec, check_vec_vec};
pub use error::{MgError, Result};

// Re-export configuration
pub use config::{
    BlockGsConfig, BlockRange, ConsistencyMode, IcConfig, IluConfig, IluVariant,
    LinearSolverConfig, LuConfig, MultigridSolveConfig, SmootherConfig, SmootherSpec,
    SolverConfig, SorConfig, TffConfig, TffMode, TransferConfig, VCycleConfig,
};

// Re-export procedures
pub use base::{BaseSolver, LinearResult, LinearSolver};
pub use cycle::{Lmgc, MultigridResult, solve_multigrid};
pub use smoother::{Iteration, NpStatus, Operands, build_smoother};
pub use transfer::{MatrixTransfer, Transfer, galerkin_coarse_matrix};

// Re-export communicators
pub use parallel::{ChannelCommunicator, Communicator, SerialCommunicator};

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
