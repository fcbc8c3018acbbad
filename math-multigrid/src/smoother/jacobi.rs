//! Damped block Jacobi

use super::{
    Iteration, Operands, PerLevel, Step, invert_diagonal, is_active, iterate_with_step,
    working_matrix, zero_locked,
};
use crate::algebra::Multigrid;
use crate::config::SmootherConfig;
use crate::dense;
use crate::error::Result;
use std::fmt;

/// Block Jacobi: `c_i = D_i^-1 b_i` with the (consistent) diagonal block.
#[derive(Debug)]
pub struct Jacobi {
    config: SmootherConfig,
    inverses: PerLevel<Vec<Option<Vec<f64>>>>,
}

impl Jacobi {
    /// Create a Jacobi smoother
    pub fn new(config: SmootherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inverses: PerLevel::default(),
        })
    }
}

impl fmt::Display for Jacobi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "jac")?;
        writeln!(f, "  damp        = {:?}", self.config.damp)?;
        write!(f, "  consistency = {:?}", self.config.consistency)
    }
}

impl Step for Jacobi {
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let distributed = mg.is_distributed();
        let inverses = self.inverses.get("jac", level)?;
        let grid = mg.level_mut(level)?;
        for (v, inv) in grid.vectors.iter_mut().zip(inverses) {
            let Some(inv) = inv else {
                continue;
            };
            let n = ops.c.ncomp(v.gtype());
            let mut x = if is_active(v, ops.c, distributed) {
                dense::block_mul(inv, n, n, &v.get(ops.b))
            } else {
                vec![0.0; n]
            };
            zero_locked(v, &mut x);
            v.put(ops.c, &x);
        }
        Ok(())
    }
}

impl Iteration for Jacobi {
    fn name(&self) -> &str {
        "jac"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.inverses.ensure_vacant("jac", level)?;
        ops.check()?;
        let m = working_matrix(mg, level, ops.a, "jac:diag", true)?;
        let inverses = invert_diagonal(mg.level(level)?, &m, ops.c, "jac")?;
        self.inverses.insert("jac", level, inverses)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.inverses.get("jac", level)?;
        let config = self.config.clone();
        iterate_with_step(self, &config, mg, level, ops)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.inverses.remove("jac", level).map(drop)
    }
}
