//! Direct solve with a dense LU factorization
//!
//! Meant for the coarsest level. The factorization does not pivot, so a
//! vanishing pivot names the unknown it belongs to: a singular pivot in the
//! last vector of the level is the expected outcome of a pure Neumann problem
//! and is regularized by pinning that vector to zero. Every other pivot
//! failure is fatal.

use super::{Iteration, Operands, PerLevel, Step, is_active, iterate_with_step, working_matrix};
use crate::algebra::{GridLevel, LevelMatrix, Multigrid};
use crate::config::LuConfig;
use crate::dense::{LuError, LuFactorization, lu_factorize};
use crate::descriptor::VecDesc;
use crate::error::{MgError, Result};
use ndarray::Array2;
use std::fmt;

/// Factorized dense system of one level.
#[derive(Debug)]
struct DenseSystem {
    lu: LuFactorization,
    /// First dense row of each vector, `None` outside the system
    offsets: Vec<Option<usize>>,
    /// Vector pinned to zero by regularization
    pinned: Option<usize>,
}

impl DenseSystem {
    fn owner(&self, row: usize) -> Option<usize> {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.map(|o| (i, o)))
            .filter(|&(_, o)| o <= row)
            .max_by_key(|&(_, o)| o)
            .map(|(i, _)| i)
    }
}

/// Dense matrix of the active unknowns with locked components decoupled.
fn assemble(
    grid: &GridLevel,
    m: &LevelMatrix,
    c: &VecDesc,
    offsets: &[Option<usize>],
    size: usize,
) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((size, size));
    for (i, v) in grid.vectors.iter().enumerate() {
        let Some(oi) = offsets[i] else {
            continue;
        };
        let ni = c.ncomp(v.gtype());
        for e in m.matrix.row(i) {
            let j = e.col();
            let Some(oj) = offsets[j] else {
                continue;
            };
            let nj = c.ncomp(grid.vectors[j].gtype());
            for r in 0..ni {
                for col in 0..nj {
                    dense[[oi + r, oj + col]] = e.values()[r * nj + col];
                }
            }
        }
    }
    for (i, v) in grid.vectors.iter().enumerate() {
        let Some(oi) = offsets[i] else {
            continue;
        };
        let skip = v.skip();
        for k in (0..c.ncomp(v.gtype())).filter(|&k| skip.is_locked(k)) {
            pin_row(&mut dense, oi + k);
        }
    }
    dense
}

/// Replace row and column `k` by the identity
fn pin_row(dense: &mut Array2<f64>, k: usize) {
    dense.row_mut(k).fill(0.0);
    dense.column_mut(k).fill(0.0);
    dense[[k, k]] = 1.0;
}

/// Direct LU smoother.
#[derive(Debug)]
pub struct DirectLu {
    config: LuConfig,
    levels: PerLevel<DenseSystem>,
}

impl DirectLu {
    /// Create a direct LU smoother
    pub fn new(config: LuConfig) -> Result<Self> {
        config.smoother.validate()?;
        if config.max_unknowns == 0 {
            return Err(MgError::InvalidConfig(
                "lu max_unknowns must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            levels: PerLevel::default(),
        })
    }

    fn factorize(
        &self,
        grid: &GridLevel,
        m: &LevelMatrix,
        c: &VecDesc,
        distributed: bool,
    ) -> Result<DenseSystem> {
        let mut offsets = Vec::with_capacity(grid.vectors.len());
        let mut size = 0;
        for v in &grid.vectors {
            if is_active(v, c, distributed) {
                offsets.push(Some(size));
                size += c.ncomp(v.gtype());
            } else {
                offsets.push(None);
            }
        }
        if size > self.config.max_unknowns {
            return Err(MgError::Allocation {
                what: format!("dense LU on level {}", grid.level),
                requested: size,
                capacity: self.config.max_unknowns,
            });
        }

        let mut dense = assemble(grid, m, c, &offsets, size);
        let mut system = DenseSystem {
            lu: LuFactorization {
                lu: Array2::zeros((0, 0)),
                n: 0,
            },
            offsets,
            pinned: None,
        };
        let fatal = |index: usize| MgError::Factorization {
            procedure: "lu".to_string(),
            level: grid.level,
            index,
        };

        system.lu = match lu_factorize(&dense) {
            Ok(lu) => lu,
            Err(LuError::ZeroPivot { row }) => {
                let owner = system.owner(row).ok_or_else(|| fatal(row))?;
                if !self.config.regularize || Some(owner) != grid.last_vector() {
                    return Err(fatal(owner));
                }
                log::warn!(
                    "lu: singular pivot in the last vector of level {}, pinning it to zero",
                    grid.level
                );
                let start = system.offsets[owner].unwrap_or(row);
                let n = c.ncomp(grid.vectors[owner].gtype());
                for k in start..start + n {
                    pin_row(&mut dense, k);
                }
                system.pinned = Some(owner);
                lu_factorize(&dense).map_err(|_| fatal(owner))?
            }
            Err(err) => return Err(err.into()),
        };
        Ok(system)
    }
}

impl fmt::Display for DirectLu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "lu")?;
        writeln!(f, "  regularize   = {}", self.config.regularize)?;
        writeln!(f, "  max_unknowns = {}", self.config.max_unknowns)?;
        writeln!(f, "  damp         = {:?}", self.config.smoother.damp)?;
        write!(f, "  consistency  = {:?}", self.config.smoother.consistency)
    }
}

impl Step for DirectLu {
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let system = self.levels.get("lu", level)?;
        let grid = mg.level_mut(level)?;
        let mut x = vec![0.0; system.lu.n];
        for (i, v) in grid.vectors.iter().enumerate() {
            let Some(o) = system.offsets[i] else {
                continue;
            };
            if system.pinned == Some(i) {
                continue;
            }
            let skip = v.skip();
            for (k, value) in v.get(ops.b).into_iter().enumerate() {
                if !skip.is_locked(k) {
                    x[o + k] = value;
                }
            }
        }
        system.lu.solve_in_place(&mut x)?;
        for (i, v) in grid.vectors.iter_mut().enumerate() {
            let n = ops.c.ncomp(v.gtype());
            if n == 0 {
                continue;
            }
            match system.offsets[i] {
                Some(o) => v.put(ops.c, &x[o..o + n]),
                None => v.put(ops.c, &vec![0.0; n]),
            }
        }
        Ok(())
    }
}

impl Iteration for DirectLu {
    fn name(&self) -> &str {
        "lu"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("lu", level)?;
        ops.check()?;
        let m = working_matrix(mg, level, ops.a, "lu:dense", false)?;
        let system = self.factorize(mg.level(level)?, &m, ops.c, mg.is_distributed())?;
        log::debug!("lu: level {} factorized with {} unknowns", level, system.lu.n);
        self.levels.insert("lu", level, system)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("lu", level)?;
        let config = self.config.smoother.clone();
        iterate_with_step(self, &config, mg, level, ops)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove("lu", level).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{GeomType, MatDesc};
    use approx::assert_relative_eq;

    /// Chain with pure Neumann ends: `[1 -1; -1 2 -1; ...; -1 1]`
    fn neumann_chain(n: usize, rhs: &[f64]) -> (Multigrid, VecDesc, VecDesc, MatDesc) {
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
            let d = if i == 0 || i + 1 == n { 1.0 } else { 2.0 };
            level.set_block(i, i, &a, &[d]).unwrap();
            if i > 0 {
                level.set_block(i, i - 1, &a, &[-1.0]).unwrap();
                level.set_block(i - 1, i, &a, &[-1.0]).unwrap();
            }
            level.set_values(i, &b, &[rhs[i]]).unwrap();
        }
        (mg, c, b, a)
    }

    #[test]
    fn test_neumann_problem_is_regularized() {
        let (mut mg, c, b, a) = neumann_chain(3, &[1.0, 0.0, -1.0]);
        let ops = Operands::new(&c, &b, &a);
        let mut lu = DirectLu::new(LuConfig::default()).unwrap();
        lu.pre_process(&mut mg, 0, &ops).unwrap();
        lu.iterate(&mut mg, 0, &ops).unwrap();
        let level = mg.level(0).unwrap();
        assert_eq!(level.gather(&c).len(), 3);
        let expected = [2.0, 1.0, 0.0];
        for (i, e) in expected.iter().enumerate() {
            assert_relative_eq!(level.values(i, &c).unwrap()[0], *e, epsilon = 1e-12);
            assert_relative_eq!(level.values(i, &b).unwrap()[0], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_singularity_without_regularization_is_fatal() {
        let (mut mg, c, b, a) = neumann_chain(3, &[1.0, 0.0, -1.0]);
        let ops = Operands::new(&c, &b, &a);
        let mut lu = DirectLu::new(LuConfig {
            regularize: false,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            lu.pre_process(&mut mg, 0, &ops),
            Err(MgError::Factorization { index: 2, .. })
        ));
    }

    #[test]
    fn test_early_zero_pivot_is_fatal() {
        let (mut mg, c, b, a) = neumann_chain(2, &[1.0, 1.0]);
        mg.level_mut(0).unwrap().set_block(0, 0, &a, &[0.0]).unwrap();
        let ops = Operands::new(&c, &b, &a);
        let mut lu = DirectLu::new(LuConfig::default()).unwrap();
        let err = lu.pre_process(&mut mg, 0, &ops).unwrap_err();
        assert!(err.is_factorization_error());
        assert!(matches!(err, MgError::Factorization { index: 0, .. }));
    }

    #[test]
    fn test_too_many_unknowns() {
        let (mut mg, c, b, a) = neumann_chain(3, &[0.0; 3]);
        let ops = Operands::new(&c, &b, &a);
        let mut lu = DirectLu::new(LuConfig {
            max_unknowns: 2,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            lu.pre_process(&mut mg, 0, &ops),
            Err(MgError::Allocation { requested: 3, capacity: 2, .. })
        ));
    }
}
