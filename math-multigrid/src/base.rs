//! Base solvers for the coarsest level of a cycle

use crate::algebra::Multigrid;
use crate::blas;
use crate::config::LinearSolverConfig;
use crate::descriptor::{MatDesc, VecDesc};
use crate::error::{MgError, Result};
use crate::parallel;
use crate::smoother::{Iteration, Operands};
use std::fmt;

/// Outcome of a base solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearResult {
    /// Reduction or absolute limit reached
    pub converged: bool,
    /// Iterations performed
    pub iterations: usize,
    /// Defect norm before the first iteration
    pub first_defect: f64,
    /// Defect norm after the last iteration
    pub last_defect: f64,
}

impl LinearResult {
    /// Average reduction per iteration
    pub fn rate(&self) -> f64 {
        if self.iterations == 0 || self.first_defect == 0.0 {
            return 0.0;
        }
        (self.last_defect / self.first_defect).powf(1.0 / self.iterations as f64)
    }
}

/// Solver for `A x = b` on one level, used at the bottom of the cycle.
pub trait BaseSolver: fmt::Display + Send {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Prepare the solver for `level`
    fn pre_process(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<()>;

    /// `b -= A x`, returning the global defect norm
    fn residual(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<f64>;

    /// Improve `x` and keep `b` the defect of the current `x`
    fn solve(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<LinearResult>;

    /// Release what `pre_process` built
    fn post_process(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<()>;
}

/// Linear iteration `x += M^-1 d` with a nested [`Iteration`].
pub struct LinearSolver {
    config: LinearSolverConfig,
    iteration: Box<dyn Iteration>,
}

impl fmt::Debug for LinearSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearSolver")
            .field("config", &self.config)
            .field("iteration", &self.iteration.name())
            .finish()
    }
}

impl LinearSolver {
    /// Create a linear solver around `iteration`
    pub fn new(config: LinearSolverConfig, iteration: Box<dyn Iteration>) -> Result<Self> {
        if config.max_iterations == 0 {
            return Err(MgError::InvalidConfig(
                "linear solver needs at least one iteration".to_string(),
            ));
        }
        if !(config.reduction >= 0.0 && config.reduction < 1.0) {
            return Err(MgError::InvalidConfig(format!(
                "reduction must lie in [0, 1), got {}",
                config.reduction
            )));
        }
        Ok(Self { config, iteration })
    }

    fn converged(&self, defect: f64, first: f64) -> bool {
        defect <= self.config.abs_limit || defect <= self.config.reduction * first
    }
}

impl fmt::Display for LinearSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ls")?;
        writeln!(f, "  max_iterations = {}", self.config.max_iterations)?;
        writeln!(f, "  reduction      = {:e}", self.config.reduction)?;
        writeln!(f, "  abs_limit      = {:e}", self.config.abs_limit)?;
        write!(f, "  iteration      = {}", self.iteration.name())
    }
}

impl BaseSolver for LinearSolver {
    fn name(&self) -> &str {
        "ls"
    }

    fn pre_process(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<()> {
        self.iteration.pre_process(mg, level, &Operands::new(x, b, a))
    }

    fn residual(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<f64> {
        let grid = mg.level_mut(level)?;
        blas::matmul_minus(&mut grid.vectors, b, &grid.matrix, a, x)?;
        parallel::global_defect_norm(mg, level, b)
    }

    fn solve(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<LinearResult> {
        let first = parallel::global_defect_norm(mg, level, b)?;
        let mut result = LinearResult {
            converged: self.converged(first, first),
            iterations: 0,
            first_defect: first,
            last_defect: first,
        };
        if result.converged {
            return Ok(result);
        }

        let c = mg.alloc_temp_vector(x)?;
        let ops = Operands::new(&c, b, a);
        while result.iterations < self.config.max_iterations {
            self.iteration.iterate(mg, level, &ops)?;
            blas::add(&mut mg.level_mut(level)?.vectors, x, &c)?;
            result.iterations += 1;
            result.last_defect = parallel::global_defect_norm(mg, level, b)?;
            if self.config.print_interval > 0
                && result.iterations % self.config.print_interval == 0
            {
                log::info!(
                    "ls: level {} iteration {:>4} defect {:.6e}",
                    level,
                    result.iterations,
                    result.last_defect
                );
            }
            if self.converged(result.last_defect, first) {
                result.converged = true;
                break;
            }
        }
        Ok(result)
    }

    fn post_process(
        &mut self,
        mg: &mut Multigrid,
        level: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<()> {
        self.iteration.post_process(mg, level, &Operands::new(x, b, a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LuConfig, SmootherConfig};
    use crate::descriptor::GeomType;
    use crate::smoother::{DirectLu, GaussSeidel};
    use approx::assert_relative_eq;

    fn chain(n: usize) -> (Multigrid, VecDesc, VecDesc, MatDesc) {
        let mut mg = Multigrid::new(1);
        let x = mg.create_vec_desc("x", [1, 0, 0, 0]).unwrap();
        let b = mg.create_vec_desc("b", [1, 0, 0, 0]).unwrap();
        let a = mg.create_mat_desc("A", &b, &x).unwrap();
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
        (mg, x, b, a)
    }

    #[test]
    fn test_direct_solver_converges_in_one_step() {
        let (mut mg, x, b, a) = chain(5);
        let mut ls = LinearSolver::new(
            LinearSolverConfig::default(),
            Box::new(DirectLu::new(LuConfig::default()).unwrap()),
        )
        .unwrap();
        ls.pre_process(&mut mg, 0, &x, &b, &a).unwrap();
        let result = ls.solve(&mut mg, 0, &x, &b, &a).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 1);
        assert_relative_eq!(result.first_defect, 5.0_f64.sqrt());
        // x_i = (i+1)(n-i)/2
        assert_relative_eq!(mg.level(0).unwrap().values(2, &x).unwrap()[0], 4.5, epsilon = 1e-12);
        ls.post_process(&mut mg, 0, &x, &b, &a).unwrap();
    }

    #[test]
    fn test_iteration_limit_reports_failure() {
        let (mut mg, x, b, a) = chain(20);
        let mut ls = LinearSolver::new(
            LinearSolverConfig {
                max_iterations: 3,
                ..Default::default()
            },
            Box::new(GaussSeidel::new(SmootherConfig::default()).unwrap()),
        )
        .unwrap();
        ls.pre_process(&mut mg, 0, &x, &b, &a).unwrap();
        let result = ls.solve(&mut mg, 0, &x, &b, &a).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
        assert!(result.last_defect < result.first_defect);
        assert!(result.rate() < 1.0);
    }

    #[test]
    fn test_residual_updates_defect() {
        let (mut mg, x, b, a) = chain(3);
        blas::set(&mut mg.level_mut(0).unwrap().vectors, &x, 1.0);
        let mut ls = LinearSolver::new(
            LinearSolverConfig::default(),
            Box::new(GaussSeidel::new(SmootherConfig::default()).unwrap()),
        )
        .unwrap();
        // A 1 = (1, 0, 1), so b - A x = (0, 1, 0)
        let norm = ls.residual(&mut mg, 0, &x, &b, &a).unwrap();
        assert_relative_eq!(norm, 1.0);
        assert!(LinearSolver::new(
            LinearSolverConfig {
                reduction: 1.5,
                ..Default::default()
            },
            Box::new(GaussSeidel::new(SmootherConfig::default()).unwrap()),
        )
        .is_err());
    }
}
