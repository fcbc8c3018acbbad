//! Gauss-Seidel, SOR and symmetric Gauss-Seidel

use super::{
    Iteration, Operands, PerLevel, Step, invert_diagonal, is_active, iterate_with_step,
    working_matrix, zero_locked,
};
use crate::algebra::{GridLevel, LevelMatrix, Multigrid};
use crate::blas;
use crate::config::{ConsistencyMode, SmootherConfig, SorConfig, expand_components, validate_list};
use crate::dense;
use crate::descriptor::VecDesc;
use crate::error::Result;
use crate::parallel;
use std::fmt;

/// Consistent matrix copy with inverted diagonal blocks.
#[derive(Debug)]
pub(crate) struct Relaxation {
    matrix: LevelMatrix,
    inverses: Vec<Option<Vec<f64>>>,
}

impl Relaxation {
    fn build(mg: &Multigrid, level: usize, ops: &Operands<'_>, procedure: &str) -> Result<Self> {
        ops.check()?;
        let matrix = working_matrix(mg, level, ops.a, procedure, false)?;
        let inverses = invert_diagonal(mg.level(level)?, &matrix, ops.c, procedure)?;
        Ok(Self { matrix, inverses })
    }
}

/// Triangular sweep `x_i = w * D_i^-1 (b_i - sum_j A_ij x_j)` over the
/// strictly lower (forward) or strictly upper (backward) part.
fn sweep(
    grid: &mut GridLevel,
    state: &Relaxation,
    x: &VecDesc,
    b: &VecDesc,
    backward: bool,
    omega: Option<&[f64]>,
    distributed: bool,
) {
    let n = grid.vectors.len();
    let order: Box<dyn Iterator<Item = usize>> = if backward {
        Box::new((0..n).rev())
    } else {
        Box::new(0..n)
    };
    for i in order {
        let Some(inv) = &state.inverses[i] else {
            continue;
        };
        let v = &grid.vectors[i];
        let ni = x.ncomp(v.gtype());
        if !is_active(v, x, distributed) {
            grid.vectors[i].put(x, &vec![0.0; ni]);
            continue;
        }
        let mut r = v.get(b);
        for e in state.matrix.matrix.row(i) {
            let j = e.col();
            if (backward && j <= i) || (!backward && j >= i) {
                continue;
            }
            let vj = &grid.vectors[j];
            let nj = x.ncomp(vj.gtype());
            if nj == 0 || e.values().is_empty() {
                continue;
            }
            dense::block_mul_sub(e.values(), ni, nj, &vj.get(x), &mut r);
        }
        let mut xi = dense::block_mul(inv, ni, ni, &r);
        if let Some(w) = omega {
            for (value, wk) in xi.iter_mut().zip(w) {
                *value *= wk;
            }
        }
        zero_locked(&grid.vectors[i], &mut xi);
        grid.vectors[i].put(x, &xi);
    }
}

/// Forward Gauss-Seidel, optionally over-relaxed per component (SOR).
#[derive(Debug)]
pub struct GaussSeidel {
    name: &'static str,
    config: SmootherConfig,
    omega: Option<Vec<f64>>,
    levels: PerLevel<Relaxation>,
}

impl GaussSeidel {
    /// Plain Gauss-Seidel
    pub fn new(config: SmootherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: "gs",
            config,
            omega: None,
            levels: PerLevel::default(),
        })
    }

    /// Successive over-relaxation
    pub fn sor(config: SorConfig) -> Result<Self> {
        config.smoother.validate()?;
        validate_list("omega", &config.omega)?;
        Ok(Self {
            name: "sor",
            config: config.smoother,
            omega: Some(config.omega),
            levels: PerLevel::default(),
        })
    }
}

impl fmt::Display for GaussSeidel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        if let Some(omega) = &self.omega {
            writeln!(f, "  omega       = {:?}", omega)?;
        }
        writeln!(f, "  damp        = {:?}", self.config.damp)?;
        write!(f, "  consistency = {:?}", self.config.consistency)
    }
}

impl Step for GaussSeidel {
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let distributed = mg.is_distributed();
        let state = self.levels.get(self.name, level)?;
        let omega = match &self.omega {
            Some(w) => Some(expand_components("omega", w, ops.c.max_comp())?),
            None => None,
        };
        sweep(mg.level_mut(level)?, state, ops.c, ops.b, false, omega.as_deref(), distributed);
        Ok(())
    }
}

impl Iteration for GaussSeidel {
    fn name(&self) -> &str {
        self.name
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant(self.name, level)?;
        let state = Relaxation::build(mg, level, ops, self.name)?;
        self.levels.insert(self.name, level, state)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get(self.name, level)?;
        let config = self.config.clone();
        iterate_with_step(self, &config, mg, level, ops)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove(self.name, level).map(drop)
    }
}

/// Forward sweep, defect update, backward sweep, defect update.
#[derive(Debug)]
pub struct SymmetricGaussSeidel {
    config: SmootherConfig,
    levels: PerLevel<Relaxation>,
}

impl SymmetricGaussSeidel {
    /// Create a symmetric Gauss-Seidel smoother
    pub fn new(config: SmootherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            levels: PerLevel::default(),
        })
    }

    /// Make a half-correction consistent, damp it and update the defect
    fn finish_half(
        &self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        ops: &Operands<'_>,
    ) -> Result<()> {
        if mg.is_distributed() {
            match self.config.consistency {
                ConsistencyMode::Sum => parallel::vector_consistent(mg, level, x)?,
                ConsistencyMode::Overwrite => parallel::vector_overwrite_from_master(mg, level, x)?,
            }
            parallel::vector_project_to_ghosts(mg, level, x)?;
        }
        let damp = self.config.damp_factors(x.max_comp())?;
        let grid = mg.level_mut(level)?;
        blas::scale_components(&mut grid.vectors, x, &damp);
        blas::matmul_minus(&mut grid.vectors, ops.b, &grid.matrix, ops.a, x)
    }
}

impl fmt::Display for SymmetricGaussSeidel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sgs")?;
        writeln!(f, "  damp        = {:?}", self.config.damp)?;
        write!(f, "  consistency = {:?}", self.config.consistency)
    }
}

impl Iteration for SymmetricGaussSeidel {
    fn name(&self) -> &str {
        "sgs"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("sgs", level)?;
        let state = Relaxation::build(mg, level, ops, "sgs")?;
        self.levels.insert("sgs", level, state)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("sgs", level)?;
        let distributed = mg.is_distributed();

        if distributed {
            parallel::vector_collect(mg, level, ops.b)?;
        }
        sweep(
            mg.level_mut(level)?,
            self.levels.get("sgs", level)?,
            ops.c,
            ops.b,
            false,
            None,
            distributed,
        );
        self.finish_half(mg, level, ops.c, ops)?;

        let t = mg.alloc_temp_vector(ops.c)?;
        if distributed {
            parallel::vector_collect(mg, level, ops.b)?;
        }
        sweep(
            mg.level_mut(level)?,
            self.levels.get("sgs", level)?,
            &t,
            ops.b,
            true,
            None,
            distributed,
        );
        self.finish_half(mg, level, &t, ops)?;
        blas::add(&mut mg.level_mut(level)?.vectors, ops.c, &t)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove("sgs", level).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{GeomType, MatDesc};
    use approx::assert_relative_eq;

    /// 1D Laplacian chain with a scalar unknown per node
    fn chain(n: usize) -> (Multigrid, VecDesc, VecDesc, MatDesc) {
        let mut mg = Multigrid::new(1);
        let c = mg.create_vec_desc("c", [1, 0, 0, 0]).unwrap();
        let b = mg.create_vec_desc("b", [1, 0, 0, 0]).unwrap();
        let a = mg.create_mat_desc("A", &b, &c).unwrap();
        for _ in 0..n {
            mg.add_vector(0, GeomType::Node).unwrap();
        }
        for i in 1..n {
            mg.connect(0, i - 1, i).unwrap();
        }
        let level = mg.level_mut(0).unwrap();
        for i in 0..n {
            level.set_block(i, i, &a, &[2.0]).unwrap();
            if i > 0 {
                level.set_block(i, i - 1, &a, &[-1.0]).unwrap();
                level.set_block(i - 1, i, &a, &[-1.0]).unwrap();
            }
            level.set_values(i, &b, &[1.0]).unwrap();
        }
        (mg, c, b, a)
    }

    #[test]
    fn test_forward_sweep_values() {
        let (mut mg, c, b, a) = chain(3);
        let ops = Operands::new(&c, &b, &a);
        let mut gs = GaussSeidel::new(SmootherConfig::default()).unwrap();
        gs.pre_process(&mut mg, 0, &ops).unwrap();
        gs.iterate(&mut mg, 0, &ops).unwrap();
        let level = mg.level(0).unwrap();
        let got: Vec<f64> = (0..3).map(|i| level.values(i, &c).unwrap()[0]).collect();
        // c0 = 1/2, c1 = (1 + 1/2)/2, c2 = (1 + 3/4)/2
        assert_relative_eq!(got[0], 0.5);
        assert_relative_eq!(got[1], 0.75);
        assert_relative_eq!(got[2], 0.875);
        // lower triangle is exact after a forward sweep: only the upper coupling remains
        assert_relative_eq!(level.values(0, &b).unwrap()[0], 0.75);
        assert_relative_eq!(level.values(2, &b).unwrap()[0], 0.0);
        gs.post_process(&mut mg, 0, &ops).unwrap();
    }

    #[test]
    fn test_sor_scales_correction() {
        let (mut mg, c, b, a) = chain(1);
        let ops = Operands::new(&c, &b, &a);
        let mut sor = GaussSeidel::sor(SorConfig {
            omega: vec![1.5],
            ..Default::default()
        })
        .unwrap();
        sor.pre_process(&mut mg, 0, &ops).unwrap();
        sor.iterate(&mut mg, 0, &ops).unwrap();
        assert_relative_eq!(mg.level(0).unwrap().values(0, &c).unwrap()[0], 0.75);
        assert_relative_eq!(mg.level(0).unwrap().values(0, &b).unwrap()[0], -0.5);
    }

    #[test]
    fn test_symmetric_round_trip() {
        let n = 6;
        let (mut mg, c, b, a) = chain(n);
        let ops = Operands::new(&c, &b, &a);
        let b0 = mg.level(0).unwrap().gather(&b);
        let mut sgs = SymmetricGaussSeidel::new(SmootherConfig {
            damp: vec![0.8],
            ..Default::default()
        })
        .unwrap();
        sgs.pre_process(&mut mg, 0, &ops).unwrap();
        sgs.iterate(&mut mg, 0, &ops).unwrap();

        // b_after == b_before - A c for the summed correction
        let level = mg.level(0).unwrap();
        let cs = level.gather(&c);
        let bs = level.gather(&b);
        for i in 0..n {
            let mut ac = 2.0 * cs[i];
            if i > 0 {
                ac -= cs[i - 1];
            }
            if i + 1 < n {
                ac -= cs[i + 1];
            }
            assert_relative_eq!(bs[i], b0[i] - ac, epsilon = 1e-12);
        }
        sgs.post_process(&mut mg, 0, &ops).unwrap();
        // the temporary went back to the pool
        assert_eq!(mg.pool().lock().vec_in_use(GeomType::Node), 2);
    }
}
