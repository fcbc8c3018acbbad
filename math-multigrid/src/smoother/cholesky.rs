//! Incomplete Cholesky
//!
//! Symmetric counterpart of ILU(0). On a symmetric matrix the incomplete
//! `LU` with the pattern of `A` equals `L D L^T`, so the factorization kernel
//! is shared; this smoother adds the symmetry check and rejects pivots that
//! are not positive.

use super::ilu::{FactorOptions, Factorization, factorize, substitute};
use super::{Iteration, Operands, PerLevel, Step, iterate_with_step, working_matrix};
use crate::algebra::{LevelMatrix, Multigrid};
use crate::config::{IcConfig, expand_components, validate_list};
use crate::error::{MgError, Result};
use std::fmt;

/// Check `A_ij == A_ji^T` up to `tolerance` times the largest coefficient.
fn check_symmetric(m: &LevelMatrix, dims: &[usize], level: usize, tolerance: f64) -> Result<()> {
    let matrix = &m.matrix;
    let scale = (0..matrix.num_rows())
        .flat_map(|i| matrix.row(i).iter().flat_map(|e| e.values().iter()))
        .fold(0.0_f64, |s, v| s.max(v.abs()));
    let tol = tolerance * scale;
    for i in 0..matrix.num_rows() {
        let ni = dims[i];
        for e in matrix.row(i) {
            let j = e.col();
            let nj = dims[j];
            if ni == 0 || nj == 0 {
                continue;
            }
            let transposed = matrix.entry(j, i).map(|t| t.values());
            for r in 0..ni {
                for c in 0..nj {
                    let aij = e.values()[r * nj + c];
                    let aji = transposed.map_or(0.0, |t| t[c * ni + r]);
                    if (aij - aji).abs() > tol {
                        return Err(MgError::NotSymmetric { level, row: i, col: j });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Incomplete Cholesky smoother.
#[derive(Debug)]
pub struct IncompleteCholesky {
    config: IcConfig,
    levels: PerLevel<Factorization>,
}

impl IncompleteCholesky {
    /// Create an incomplete Cholesky smoother
    pub fn new(config: IcConfig) -> Result<Self> {
        config.smoother.validate()?;
        validate_list("shift", &config.shift)?;
        if config.symmetry_tolerance.is_nan() || config.symmetry_tolerance < 0.0 {
            return Err(MgError::InvalidConfig(format!(
                "symmetry tolerance must be non-negative, got {}",
                config.symmetry_tolerance
            )));
        }
        Ok(Self {
            config,
            levels: PerLevel::default(),
        })
    }
}

impl fmt::Display for IncompleteCholesky {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ic")?;
        writeln!(f, "  shift       = {:?}", self.config.shift)?;
        writeln!(f, "  damp        = {:?}", self.config.smoother.damp)?;
        write!(f, "  consistency = {:?}", self.config.smoother.consistency)
    }
}

impl Step for IncompleteCholesky {
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let factors = self.levels.get("ic", level)?;
        substitute(mg.level_mut(level)?, factors, ops.c, ops.b);
        Ok(())
    }
}

impl Iteration for IncompleteCholesky {
    fn name(&self) -> &str {
        "ic"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("ic", level)?;
        ops.check()?;
        let m = working_matrix(mg, level, ops.a, "ic:llt", false)?;
        let grid = mg.level(level)?;
        let dims: Vec<usize> = grid.vectors.iter().map(|v| ops.c.ncomp(v.gtype())).collect();
        check_symmetric(&m, &dims, level, self.config.symmetry_tolerance)?;

        let opts = FactorOptions {
            shift: expand_components("shift", &self.config.shift, ops.c.max_comp())?,
            positive_pivots: true,
            ..Default::default()
        };
        let factors = factorize(grid, m.matrix, ops.c, &opts, "ic", mg.is_distributed())?;
        self.levels.insert("ic", level, factors)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("ic", level)?;
        let config = self.config.smoother.clone();
        iterate_with_step(self, &config, mg, level, ops)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove("ic", level).map(drop)
    }
}
