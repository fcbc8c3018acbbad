//! Multigrid cycle and solve driver
//!
//! [`Lmgc`] is the linear multigrid cycle: pre-smoothing, restriction,
//! `gamma` coarse-grid recursions, interpolation and post-smoothing, with a
//! base solver at the bottom. It implements [`Iteration`] itself, so it can
//! be nested as a smoother or driven by [`solve_multigrid`].

use crate::algebra::Multigrid;
use crate::base::{BaseSolver, LinearSolver};
use crate::blas;
use crate::config::{MultigridSolveConfig, SolverConfig, VCycleConfig};
use crate::descriptor::{MatDesc, VecDesc};
use crate::error::{MgError, Result};
use crate::parallel;
use crate::smoother::{Iteration, NpStatus, Operands, PerLevel, build_smoother};
use crate::transfer::{MatrixTransfer, Transfer};
use std::fmt;

/// Linear multigrid cycle.
pub struct Lmgc {
    config: VCycleConfig,
    pre: Option<Box<dyn Iteration>>,
    post: Option<Box<dyn Iteration>>,
    transfer: Option<Box<dyn Transfer>>,
    base: Option<Box<dyn BaseSolver>>,
    /// Base level used for each preprocessed top level
    levels: PerLevel<usize>,
}

impl fmt::Debug for Lmgc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lmgc")
            .field("config", &self.config)
            .field("pre", &self.pre.as_ref().map(|s| s.name().to_string()))
            .field("post", &self.post.as_ref().map(|s| s.name().to_string()))
            .field("transfer", &self.transfer.as_ref().map(|t| t.name().to_string()))
            .field("base", &self.base.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl Lmgc {
    /// Create a cycle; smoothers, transfer and base solver are attached with
    /// the `with_*` builders.
    pub fn new(config: VCycleConfig) -> Result<Self> {
        if config.gamma == 0 {
            return Err(MgError::InvalidConfig("gamma must be at least 1".to_string()));
        }
        Ok(Self {
            config,
            pre: None,
            post: None,
            transfer: None,
            base: None,
            levels: PerLevel::default(),
        })
    }

    /// Build a complete cycle from a solver configuration: the smoother is
    /// used for post-smoothing too unless a separate one is given, the base
    /// level runs a [`LinearSolver`] around `base_smoother`.
    pub fn from_config(config: &SolverConfig) -> Result<Self> {
        let post = config.post_smoother.as_ref().unwrap_or(&config.smoother);
        let base = LinearSolver::new(config.base.clone(), build_smoother(&config.base_smoother)?)?;
        Ok(Self::new(config.cycle.clone())?
            .with_pre_smoother(build_smoother(&config.smoother)?)
            .with_post_smoother(build_smoother(post)?)
            .with_transfer(Box::new(MatrixTransfer::new(config.transfer.clone())?))
            .with_base_solver(Box::new(base)))
    }

    /// Attach the pre-smoother
    pub fn with_pre_smoother(mut self, smoother: Box<dyn Iteration>) -> Self {
        self.pre = Some(smoother);
        self
    }

    /// Attach the post-smoother
    pub fn with_post_smoother(mut self, smoother: Box<dyn Iteration>) -> Self {
        self.post = Some(smoother);
        self
    }

    /// Attach the grid transfer
    pub fn with_transfer(mut self, transfer: Box<dyn Transfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Attach the base solver
    pub fn with_base_solver(mut self, base: Box<dyn BaseSolver>) -> Self {
        self.base = Some(base);
        self
    }

    /// Cycle parameters
    pub fn config(&self) -> &VCycleConfig {
        &self.config
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.config.nu1 > 0 && self.pre.is_none() {
            missing.push("pre-smoother");
        }
        if self.config.nu2 > 0 && self.post.is_none() {
            missing.push("post-smoother");
        }
        if self.transfer.is_none() {
            missing.push("transfer");
        }
        if self.base.is_none() {
            missing.push("base solver");
        }
        missing
    }

    fn prepare_level(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        base: usize,
        ops: &Operands<'_>,
    ) -> Result<()> {
        if level == base {
            if let Some(solver) = self.base.as_mut() {
                solver.pre_process(mg, level, ops.c, ops.b, ops.a)?;
            }
            return Ok(());
        }
        if let Some(pre) = self.pre.as_mut() {
            pre.pre_process(mg, level, ops)?;
        }
        if let Some(post) = self.post.as_mut() {
            if let Err(err) = post.pre_process(mg, level, ops) {
                if let Some(pre) = self.pre.as_mut() {
                    pre.post_process(mg, level, ops)?;
                }
                return Err(err);
            }
        }
        if let Some(transfer) = self.transfer.as_mut() {
            if let Err(err) = transfer.pre_process(mg, level, ops.c, ops.b, ops.a) {
                if let Some(post) = self.post.as_mut() {
                    post.post_process(mg, level, ops)?;
                }
                if let Some(pre) = self.pre.as_mut() {
                    pre.post_process(mg, level, ops)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn release_level(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        base: usize,
        ops: &Operands<'_>,
    ) -> Result<()> {
        if level == base {
            return match self.base.as_mut() {
                Some(solver) => solver.post_process(mg, level, ops.c, ops.b, ops.a),
                None => Ok(()),
            };
        }
        let mut first: Result<()> = Ok(());
        let mut keep = |r: Result<()>| {
            if let Err(err) = r {
                if first.is_ok() {
                    first = Err(err);
                } else {
                    log::warn!("lmgc: further release error on level {}: {}", level, err);
                }
            }
        };
        if let Some(transfer) = self.transfer.as_mut() {
            keep(transfer.post_process(mg, level));
        }
        if let Some(post) = self.post.as_mut() {
            keep(post.post_process(mg, level, ops));
        }
        if let Some(pre) = self.pre.as_mut() {
            keep(pre.post_process(mg, level, ops));
        }
        first
    }

    /// One cycle on `level`.
    fn lmgc(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        base: usize,
        ops: &Operands<'_>,
    ) -> Result<()> {
        if level <= base {
            let solver = self
                .base
                .as_mut()
                .ok_or_else(|| MgError::not_executable("lmgc", "no base solver"))?;
            // b is the defect of the current c, which gamma > 1 visits
            // accumulate: solve for an increment
            let t = mg.alloc_temp_vector(ops.c)?;
            blas::set(&mut mg.level_mut(level)?.vectors, &t, 0.0);
            let defect = solver.residual(mg, level, &t, ops.b, ops.a)?;
            let result = solver.solve(mg, level, &t, ops.b, ops.a)?;
            blas::add(&mut mg.level_mut(level)?.vectors, ops.c, &t)?;
            if !result.converged {
                log::warn!(
                    "lmgc: base solver on level {} did not converge ({:.6e} -> {:.6e} in {} iterations)",
                    level,
                    defect,
                    result.last_defect,
                    result.iterations
                );
            }
            return Ok(());
        }

        let t = mg.alloc_temp_vector(ops.c)?;
        let smooth_ops = Operands::new(&t, ops.b, ops.a);
        if let Some(pre) = self.pre.as_mut() {
            for _ in 0..self.config.nu1 {
                pre.iterate(mg, level, &smooth_ops)?;
                blas::add(&mut mg.level_mut(level)?.vectors, ops.c, &t)?;
            }
        }

        {
            let transfer = self
                .transfer
                .as_mut()
                .ok_or_else(|| MgError::not_executable("lmgc", "no transfer"))?;
            transfer.restrict_defect(mg, level, ops.b, ops.b)?;
        }
        blas::set(&mut mg.level_mut(level - 1)?.vectors, ops.c, 0.0);
        for _ in 0..self.config.gamma {
            self.lmgc(mg, level - 1, base, ops)?;
        }
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.interpolate_correction(mg, level, &t, ops.c)?;
        }
        {
            let grid = mg.level_mut(level)?;
            blas::add(&mut grid.vectors, ops.c, &t)?;
            blas::matmul_minus(&mut grid.vectors, ops.b, &grid.matrix, ops.a, &t)?;
        }

        if let Some(post) = self.post.as_mut() {
            for _ in 0..self.config.nu2 {
                post.iterate(mg, level, &smooth_ops)?;
                blas::add(&mut mg.level_mut(level)?.vectors, ops.c, &t)?;
            }
        }
        drop(t);

        if let Some(transfer) = self.transfer.as_mut() {
            transfer.adapt_correction(mg, level, ops.c, ops.b, ops.a)?;
        }
        Ok(())
    }
}

impl fmt::Display for Lmgc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "lmgc")?;
        writeln!(f, "  gamma      = {}", self.config.gamma)?;
        writeln!(f, "  nu1        = {}", self.config.nu1)?;
        writeln!(f, "  nu2        = {}", self.config.nu2)?;
        writeln!(f, "  base_level = {}", self.config.base_level)?;
        let name = |n: Option<&str>| n.unwrap_or("---").to_string();
        writeln!(f, "  pre        = {}", name(self.pre.as_ref().map(|s| s.name())))?;
        writeln!(f, "  post       = {}", name(self.post.as_ref().map(|s| s.name())))?;
        writeln!(f, "  transfer   = {}", name(self.transfer.as_ref().map(|t| t.name())))?;
        write!(f, "  base       = {}", name(self.base.as_ref().map(|b| b.name())))
    }
}

impl Iteration for Lmgc {
    fn name(&self) -> &str {
        "lmgc"
    }

    fn status(&self) -> NpStatus {
        if self.missing().is_empty() {
            NpStatus::Executable
        } else {
            NpStatus::Configured
        }
    }

    /// Prepare every level from the base level up to `level`; on failure the
    /// levels prepared so far are released again.
    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("lmgc", level)?;
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(MgError::not_executable("lmgc", format!("missing {}", missing.join(", "))));
        }
        ops.check()?;
        mg.level(level)?;
        let base = self.config.base_level.min(level);
        for l in base..=level {
            if let Err(err) = self.prepare_level(mg, l, base, ops) {
                for done in (base..l).rev() {
                    if let Err(undo) = self.release_level(mg, done, base, ops) {
                        log::warn!("lmgc: rollback of level {} failed: {}", done, undo);
                    }
                }
                return Err(err);
            }
        }
        log::debug!("lmgc: prepared levels {}..={}", base, level);
        self.levels.insert("lmgc", level, base)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let base = *self.levels.get("lmgc", level)?;
        blas::set(&mut mg.level_mut(level)?.vectors, ops.c, 0.0);
        self.lmgc(mg, level, base, ops)
    }

    fn post_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let base = self.levels.remove("lmgc", level)?;
        let mut first: Result<()> = Ok(());
        for l in (base..=level).rev() {
            if let Err(err) = self.release_level(mg, l, base, ops) {
                if first.is_ok() {
                    first = Err(err);
                } else {
                    log::warn!("lmgc: release of level {} failed: {}", l, err);
                }
            }
        }
        first
    }
}

/// Outcome of [`solve_multigrid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultigridResult {
    /// Reduction or absolute limit reached
    pub converged: bool,
    /// Cycles performed
    pub iterations: usize,
    /// Defect norm of the initial guess
    pub first_defect: f64,
    /// Final defect norm
    pub last_defect: f64,
}

/// Solve `A x = b` on the top level with repeated cycles.
///
/// On entry `x` holds the initial guess and `b` the right-hand side; on
/// return `b` holds the defect of the returned `x`. The cycle is
/// preprocessed here and always postprocessed again, also on failure.
pub fn solve_multigrid(
    mg: &mut Multigrid,
    cycle: &mut dyn Iteration,
    x: &VecDesc,
    b: &VecDesc,
    a: &MatDesc,
    config: &MultigridSolveConfig,
) -> Result<MultigridResult> {
    let top = mg.top_level();
    let c = mg.alloc_temp_vector(x)?;
    let ops = Operands::new(&c, b, a);
    cycle.pre_process(mg, top, &ops)?;
    let result = run_cycles(mg, cycle, top, x, &ops, config);
    let released = cycle.post_process(mg, top, &ops);
    let result = result?;
    released?;
    Ok(result)
}

fn run_cycles(
    mg: &mut Multigrid,
    cycle: &mut dyn Iteration,
    top: usize,
    x: &VecDesc,
    ops: &Operands<'_>,
    config: &MultigridSolveConfig,
) -> Result<MultigridResult> {
    {
        let grid = mg.level_mut(top)?;
        blas::matmul_minus(&mut grid.vectors, ops.b, &grid.matrix, ops.a, x)?;
    }
    let first = parallel::global_defect_norm(mg, top, ops.b)?;
    let limit = config.abs_limit.max(config.reduction * first);
    let mut result = MultigridResult {
        converged: first <= limit,
        iterations: 0,
        first_defect: first,
        last_defect: first,
    };
    while !result.converged && result.iterations < config.max_iterations {
        cycle.iterate(mg, top, ops)?;
        blas::add(&mut mg.level_mut(top)?.vectors, x, ops.c)?;
        result.iterations += 1;
        let defect = parallel::global_defect_norm(mg, top, ops.b)?;
        if config.print_interval > 0 && result.iterations % config.print_interval == 0 {
            let rate = if result.last_defect > 0.0 { defect / result.last_defect } else { 0.0 };
            log::info!(
                "mg: cycle {:>4} defect {:.6e} rate {:.4}",
                result.iterations,
                defect,
                rate
            );
        }
        result.last_defect = defect;
        result.converged = defect <= limit;
    }
    if !result.converged {
        log::warn!(
            "mg: no convergence after {} cycles ({:.6e} -> {:.6e})",
            result.iterations,
            first,
            result.last_defect
        );
    }
    Ok(result)
}
