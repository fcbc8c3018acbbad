//! Smoothers and the shared iteration lifecycle
//!
//! Every numerical procedure that acts on a level implements [`Iteration`]:
//! `pre_process` builds per-level state (factorized copies, inverted
//! diagonals), `iterate` computes a correction `c` for the defect `b` and
//! updates `b -= A c`, `post_process` drops the level state again. Calling
//! `iterate` on a level that was not preprocessed is an error.
//!
//! The simple relaxation family (Jacobi, Gauss-Seidel, SOR, ILU, IC, LU) only
//! implements [`Step`]; [`iterate_with_step`] wraps it with the defect
//! collection, correction consistency, damping and defect update.

mod block_gs;
mod cholesky;
mod gauss_seidel;
mod ilu;
mod jacobi;
mod lu;
mod tff;

pub use block_gs::BlockGaussSeidel;
pub use cholesky::IncompleteCholesky;
pub use gauss_seidel::{GaussSeidel, SymmetricGaussSeidel};
pub use ilu::Ilu;
pub use jacobi::Jacobi;
pub use lu::DirectLu;
pub use tff::FrequencyFilter;

use crate::algebra::{GridLevel, LevelMatrix, Multigrid, Vector};
use crate::blas;
use crate::config::{ConsistencyMode, SmootherConfig, SmootherSpec};
use crate::dense;
use crate::descriptor::{MatDesc, VecDesc, check_vec_mat_vec, check_vec_vec};
use crate::error::{MgError, Result};
use crate::parallel;
use std::collections::BTreeMap;
use std::fmt;

/// Operands of one iteration: correction `c`, defect `b`, matrix `a`.
#[derive(Debug, Clone, Copy)]
pub struct Operands<'a> {
    /// Correction, overwritten by `iterate`
    pub c: &'a VecDesc,
    /// Defect, updated in place
    pub b: &'a VecDesc,
    /// Level matrix
    pub a: &'a MatDesc,
}

impl<'a> Operands<'a> {
    /// Bundle the operands
    pub fn new(c: &'a VecDesc, b: &'a VecDesc, a: &'a MatDesc) -> Self {
        Self { c, b, a }
    }

    /// Check that `a` maps `c`-shaped vectors to `b`-shaped vectors
    pub fn check(&self) -> Result<()> {
        check_vec_mat_vec(self.b, self.a, self.c)?;
        check_vec_vec(self.b, self.c)
    }
}

/// Configuration state of a numerical procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpStatus {
    /// Created without configuration
    Unconfigured,
    /// Configured, but a required part is missing
    Configured,
    /// Ready for `pre_process`
    Executable,
}

/// Uniform contract of smoothers, base solvers and cycles.
pub trait Iteration: fmt::Display + Send {
    /// Short procedure name used in logs and errors
    fn name(&self) -> &str;

    /// Configuration state
    fn status(&self) -> NpStatus {
        NpStatus::Executable
    }

    /// Build per-level state
    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()>;

    /// Compute the correction and update the defect
    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()>;

    /// Release per-level state
    fn post_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()>;
}

/// Local correction of the simple relaxation family.
///
/// `step` overwrites `c` with an approximate solution of `A c = b` using
/// the defect as it stands on this processor.
pub trait Step {
    /// Compute the local correction
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()>;
}

/// Per-level state of a procedure, present exactly between `pre_process`
/// and `post_process`.
#[derive(Debug)]
pub struct PerLevel<S> {
    states: BTreeMap<usize, S>,
}

impl<S> Default for PerLevel<S> {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
        }
    }
}

impl<S> PerLevel<S> {
    /// Fail if `level` is already preprocessed
    pub fn ensure_vacant(&self, procedure: &str, level: usize) -> Result<()> {
        if self.states.contains_key(&level) {
            return Err(MgError::AlreadyPreprocessed {
                procedure: procedure.to_string(),
                level,
            });
        }
        Ok(())
    }

    /// Store the state of a freshly preprocessed level
    pub fn insert(&mut self, procedure: &str, level: usize, state: S) -> Result<()> {
        self.ensure_vacant(procedure, level)?;
        self.states.insert(level, state);
        Ok(())
    }

    /// State of a preprocessed level
    pub fn get(&self, procedure: &str, level: usize) -> Result<&S> {
        self.states.get(&level).ok_or_else(|| MgError::NotPreprocessed {
            procedure: procedure.to_string(),
            level,
        })
    }

    /// Mutable state of a preprocessed level
    pub fn get_mut(&mut self, procedure: &str, level: usize) -> Result<&mut S> {
        self.states.get_mut(&level).ok_or_else(|| MgError::NotPreprocessed {
            procedure: procedure.to_string(),
            level,
        })
    }

    /// Take the state out, ending the level's lifecycle
    pub fn remove(&mut self, procedure: &str, level: usize) -> Result<S> {
        self.states.remove(&level).ok_or_else(|| MgError::NotPreprocessed {
            procedure: procedure.to_string(),
            level,
        })
    }

    /// Whether `level` is preprocessed
    pub fn contains(&self, level: usize) -> bool {
        self.states.contains_key(&level)
    }

    /// Number of preprocessed levels
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no level is preprocessed
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Shared iterate of the simple relaxation family.
///
/// In distributed mode the defect is first collected onto the master
/// copies; after the step the correction is made consistent (sum or
/// overwrite) and projected to ghosts. The correction is then damped per
/// component and `b -= A c` is applied with the local matrix.
pub fn iterate_with_step<S: Step + ?Sized>(
    smoother: &mut S,
    config: &SmootherConfig,
    mg: &mut Multigrid,
    level: usize,
    ops: &Operands<'_>,
) -> Result<()> {
    let distributed = mg.is_distributed();
    if distributed {
        parallel::vector_collect(mg, level, ops.b)?;
    }
    smoother.step(mg, level, ops)?;
    blas::clear_skip(&mut mg.level_mut(level)?.vectors, ops.c);
    if distributed {
        match config.consistency {
            ConsistencyMode::Sum => parallel::vector_consistent(mg, level, ops.c)?,
            ConsistencyMode::Overwrite => parallel::vector_overwrite_from_master(mg, level, ops.c)?,
        }
        parallel::vector_project_to_ghosts(mg, level, ops.c)?;
    }
    let damp = config.damp_factors(ops.c.max_comp())?;
    let grid = mg.level_mut(level)?;
    blas::scale_components(&mut grid.vectors, ops.c, &damp);
    blas::matmul_minus(&mut grid.vectors, ops.b, &grid.matrix, ops.a, ops.c)
}

/// Owned copy of the level matrix for factorizations.
///
/// In distributed mode the copy is made consistent: only the diagonal
/// blocks for `diagonal_only`, every shared entry otherwise.
pub(crate) fn working_matrix(
    mg: &Multigrid,
    level: usize,
    a: &MatDesc,
    name: &str,
    diagonal_only: bool,
) -> Result<LevelMatrix> {
    let mut m = mg.level(level)?.extract_matrix(a, name);
    if mg.is_distributed() {
        if diagonal_only {
            parallel::matrix_diag_consistent(mg, level, &mut m)?;
        } else {
            parallel::matrix_consistent(mg, level, &mut m)?;
        }
    }
    Ok(m)
}

/// Inverted diagonal blocks of `m`, locked components masked to identity.
///
/// Vectors whose type `c` does not define get `None`.
pub(crate) fn invert_diagonal(
    grid: &GridLevel,
    m: &LevelMatrix,
    c: &VecDesc,
    procedure: &str,
) -> Result<Vec<Option<Vec<f64>>>> {
    grid.vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let n = c.ncomp(v.gtype());
            if n == 0 {
                return Ok(None);
            }
            let mut block = m.matrix.diagonal(i).values().to_vec();
            dense::mask_diagonal_block(&mut block, n, v.skip());
            dense::block_invert(&block, n).map(Some).map_err(|_| MgError::Factorization {
                procedure: procedure.to_string(),
                level: grid.level,
                index: i,
            })
        })
        .collect()
}

/// Whether vector `v` takes part in a local solve: in distributed mode only
/// master copies do, the others hold a collected (zero) defect.
#[inline]
pub(crate) fn is_active(v: &Vector, c: &VecDesc, distributed: bool) -> bool {
    c.defines(v.gtype()) && (!distributed || v.is_master())
}

/// Zero the locked components of a block value
#[inline]
pub(crate) fn zero_locked(v: &Vector, values: &mut [f64]) {
    let skip = v.skip();
    if skip.is_empty() {
        return;
    }
    for (k, x) in values.iter_mut().enumerate() {
        if skip.is_locked(k) {
            *x = 0.0;
        }
    }
}

/// Build a smoother from its configuration
pub fn build_smoother(spec: &SmootherSpec) -> Result<Box<dyn Iteration>> {
    Ok(match spec {
        SmootherSpec::Jacobi(config) => Box::new(Jacobi::new(config.clone())?),
        SmootherSpec::GaussSeidel(config) => Box::new(GaussSeidel::new(config.clone())?),
        SmootherSpec::SymmetricGaussSeidel(config) => {
            Box::new(SymmetricGaussSeidel::new(config.clone())?)
        }
        SmootherSpec::Sor(config) => Box::new(GaussSeidel::sor(config.clone())?),
        SmootherSpec::Ilu(config) => Box::new(Ilu::new(config.clone())?),
        SmootherSpec::Ic(config) => Box::new(IncompleteCholesky::new(config.clone())?),
        SmootherSpec::Lu(config) => Box::new(DirectLu::new(config.clone())?),
        SmootherSpec::Tff(config) => Box::new(FrequencyFilter::new(config.clone())?),
        SmootherSpec::BlockGaussSeidel { layout, nested } => {
            let nested = nested
                .iter()
                .map(build_smoother)
                .collect::<Result<Vec<_>>>()?;
            Box::new(BlockGaussSeidel::new(layout.blocks.clone(), layout.order.clone(), nested)?)
        }
    })
}
