//! Tangential frequency filtering
//!
//! The level is treated as a sequence of grid lines (the blockvectors of the
//! level, in id order). With `D_i` the coupling inside line `i`, `L_i` and
//! `U_i` the couplings to the previous and next line, the block LU
//! decomposition `(L + T) T^-1 (T + U)` uses pivots
//!
//! ```text
//! T_0 = D_0
//! T_i = D_i - w t^T / (t, t),   w = L_i T_{i-1}^-1 U_{i-1} t
//! ```
//!
//! so that every pivot acts like the exact Schur complement on the test
//! vector `t_j = sin(pi k h (j + 1))` of wavenumber `k`. Couplings between
//! lines that are not neighbours are ignored.

use super::{Iteration, Operands, PerLevel, is_active};
use crate::algebra::{GridLevel, LevelMatrix, Multigrid, TempVector, Vector};
use crate::blas;
use crate::config::{ConsistencyMode, TffConfig, TffMode};
use crate::dense::{LuFactorization, lu_factorize};
use crate::descriptor::VecDesc;
use crate::error::{MgError, Result};
use crate::parallel;
use ndarray::{Array1, Array2};
use std::f64::consts::PI;
use std::fmt;

/// Line structure and couplings of one level.
#[derive(Debug)]
struct Lines {
    members: Vec<Vec<usize>>,
    diag: Vec<Array2<f64>>,
    /// Coupling of line `i` to line `i - 1`
    lower: Vec<Option<Array2<f64>>>,
    /// Coupling of line `i` to line `i + 1`
    upper: Vec<Option<Array2<f64>>>,
}

/// Filtered pivots for one wavenumber.
#[derive(Debug)]
struct Decomposition {
    wavenumber: f64,
    pivots: Vec<LuFactorization>,
}

#[derive(Debug)]
struct LevelState {
    lines: Lines,
    decompositions: Vec<Decomposition>,
}

/// Wavenumbers below the Nyquist limit `floor(1/h) - 1`.
fn nyquist(h: f64) -> usize {
    ((1.0 / h).floor() as usize).saturating_sub(1)
}

fn test_vector(len: usize, wavenumber: f64, h: f64) -> Array1<f64> {
    Array1::from_shape_fn(len, |j| (PI * wavenumber * h * (j + 1) as f64).sin())
}

fn participates(v: &Vector, c: &VecDesc, distributed: bool) -> bool {
    is_active(v, c, distributed) && !v.skip().is_locked(0)
}

fn build_lines(grid: &GridLevel, m: &LevelMatrix, c: &VecDesc, distributed: bool) -> Result<Lines> {
    let n = grid.vectors.len();
    let mut position: Vec<Option<(usize, usize)>> = vec![None; n];
    let mut members = Vec::with_capacity(grid.blockvectors.len());
    for (line, bv) in grid.blockvectors.iter().enumerate() {
        for (p, &v) in bv.vectors.iter().enumerate() {
            position[v] = Some((line, p));
        }
        members.push(bv.vectors.clone());
    }
    if let Some(i) = (0..n).find(|&i| position[i].is_none() && c.defines(grid.vectors[i].gtype())) {
        return Err(MgError::InvalidConfig(format!(
            "tff: vector {} on level {} belongs to no blockvector",
            i, grid.level
        )));
    }

    let lens: Vec<usize> = members.iter().map(Vec::len).collect();
    let nl = members.len();
    let mut diag: Vec<Array2<f64>> = lens.iter().map(|&l| Array2::zeros((l, l))).collect();
    let mut lower: Vec<Option<Array2<f64>>> = (0..nl)
        .map(|i| (i > 0).then(|| Array2::zeros((lens[i], lens[i - 1]))))
        .collect();
    let mut upper: Vec<Option<Array2<f64>>> = (0..nl)
        .map(|i| (i + 1 < nl).then(|| Array2::zeros((lens[i], lens[i + 1]))))
        .collect();

    for i in 0..n {
        let Some((li, p)) = position[i] else {
            continue;
        };
        if !participates(&grid.vectors[i], c, distributed) {
            diag[li][[p, p]] = 1.0;
            continue;
        }
        for e in m.matrix.row(i) {
            let j = e.col();
            let Some((lj, q)) = position[j] else {
                continue;
            };
            if e.values().is_empty() || !participates(&grid.vectors[j], c, distributed) {
                continue;
            }
            let a = e.values()[0];
            if lj == li {
                diag[li][[p, q]] += a;
            } else if lj + 1 == li {
                if let Some(l) = lower[li].as_mut() {
                    l[[p, q]] += a;
                }
            } else if li + 1 == lj {
                if let Some(u) = upper[li].as_mut() {
                    u[[p, q]] += a;
                }
            }
        }
    }
    Ok(Lines {
        members,
        diag,
        lower,
        upper,
    })
}

fn decompose(lines: &Lines, wavenumber: f64, h: f64, level: usize) -> Result<Decomposition> {
    let mut pivots: Vec<LuFactorization> = Vec::with_capacity(lines.diag.len());
    for (i, d) in lines.diag.iter().enumerate() {
        let mut pivot = d.clone();
        if let (Some(prev), Some(l), Some(u)) = (
            pivots.last(),
            &lines.lower[i],
            &lines.upper[i.saturating_sub(1)],
        ) {
            let t = test_vector(d.nrows(), wavenumber, h);
            let tt = t.dot(&t);
            if tt > f64::EPSILON {
                let w = l.dot(&prev.solve(&u.dot(&t))?);
                for r in 0..pivot.nrows() {
                    for col in 0..pivot.ncols() {
                        pivot[[r, col]] -= w[r] * t[col] / tt;
                    }
                }
            }
        }
        let lu = lu_factorize(&pivot).map_err(|_| MgError::Factorization {
            procedure: "tff".to_string(),
            level,
            index: lines.members[i].first().copied().unwrap_or(0),
        })?;
        pivots.push(lu);
    }
    Ok(Decomposition { wavenumber, pivots })
}

/// `x = M^-1 b` with the filtered block LU decomposition
fn apply(
    grid: &mut GridLevel,
    state: &LevelState,
    k: usize,
    x: &VecDesc,
    b: &VecDesc,
    distributed: bool,
) -> Result<()> {
    let lines = &state.lines;
    let dec = &state.decompositions[k];
    let nl = lines.members.len();

    let rhs = |grid: &GridLevel, line: usize| -> Array1<f64> {
        Array1::from_iter(lines.members[line].iter().map(|&v| {
            let node = &grid.vectors[v];
            if participates(node, x, distributed) {
                node.get(b)[0]
            } else {
                0.0
            }
        }))
    };

    let mut y: Vec<Array1<f64>> = Vec::with_capacity(nl);
    for i in 0..nl {
        let mut r = rhs(&*grid, i);
        if let (Some(l), Some(prev)) = (&lines.lower[i], y.last()) {
            r -= &l.dot(prev);
        }
        y.push(dec.pivots[i].solve(&r)?);
    }
    for i in (0..nl.saturating_sub(1)).rev() {
        if let Some(u) = &lines.upper[i] {
            let z = dec.pivots[i].solve(&u.dot(&y[i + 1]))?;
            y[i] -= &z;
        }
    }

    for (line, values) in lines.members.iter().zip(&y) {
        for (&v, &value) in line.iter().zip(values) {
            let node = &mut grid.vectors[v];
            let value = if participates(node, x, distributed) { value } else { 0.0 };
            node.put(x, &[value]);
        }
    }
    Ok(())
}

/// Frequency filtering smoother or line solver.
#[derive(Debug)]
pub struct FrequencyFilter {
    config: TffConfig,
    levels: PerLevel<LevelState>,
}

impl FrequencyFilter {
    /// Create a frequency filter
    pub fn new(config: TffConfig) -> Result<Self> {
        config.smoother.validate()?;
        if config.mode == TffMode::Smoother
            && !(config.wavenumber > 0.0 && config.wavenumber <= 1.0)
        {
            return Err(MgError::InvalidConfig(format!(
                "tff wavenumber must lie in (0, 1], got {}",
                config.wavenumber
            )));
        }
        Ok(Self {
            config,
            levels: PerLevel::default(),
        })
    }

    fn wavenumbers(&self, limit: usize) -> Vec<f64> {
        match self.config.mode {
            TffMode::Smoother => vec![self.config.wavenumber * limit as f64],
            TffMode::Solver => std::iter::successors(Some(1usize), |k| k.checked_mul(2))
                .take_while(|&k| k <= limit)
                .map(|k| k as f64)
                .collect(),
        }
    }

    /// Solve with decomposition `k` into `x`, make it consistent, damp it and
    /// update the defect.
    fn sweep(
        &self,
        mg: &mut Multigrid,
        level: usize,
        k: usize,
        x: &VecDesc,
        ops: &Operands<'_>,
    ) -> Result<()> {
        let distributed = mg.is_distributed();
        let state = self.levels.get("tff", level)?;
        if distributed {
            parallel::vector_collect(mg, level, ops.b)?;
        }
        apply(mg.level_mut(level)?, state, k, x, ops.b, distributed)?;
        if distributed {
            match self.config.smoother.consistency {
                ConsistencyMode::Sum => {
                    parallel::vector_consistent_in_block(mg, level, x, &|v| v.block().is_some())?
                }
                ConsistencyMode::Overwrite => parallel::vector_overwrite_from_master(mg, level, x)?,
            }
            parallel::vector_project_to_ghosts(mg, level, x)?;
        }
        let damp = self.config.smoother.damp_factors(x.max_comp())?;
        let grid = mg.level_mut(level)?;
        blas::scale_components(&mut grid.vectors, x, &damp);
        blas::matmul_minus(&mut grid.vectors, ops.b, &grid.matrix, ops.a, x)
    }
}

impl fmt::Display for FrequencyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tff")?;
        writeln!(f, "  mode        = {:?}", self.config.mode)?;
        if self.config.mode == TffMode::Smoother {
            writeln!(f, "  wavenumber  = {}", self.config.wavenumber)?;
        }
        writeln!(f, "  damp        = {:?}", self.config.smoother.damp)?;
        write!(f, "  consistency = {:?}", self.config.smoother.consistency)
    }
}

impl Iteration for FrequencyFilter {
    fn name(&self) -> &str {
        "tff"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("tff", level)?;
        ops.check()?;
        if !ops.c.is_scalar() || !ops.b.is_scalar() || ops.a.scalar_comp().is_none() {
            return Err(MgError::InvalidConfig(
                "tff works on scalar descriptors only".to_string(),
            ));
        }
        let grid = mg.level(level)?;
        let h = grid
            .mesh_width
            .filter(|h| *h > 0.0)
            .ok_or_else(|| {
                MgError::InvalidConfig(format!("tff: level {} has no mesh width", level))
            })?;
        let limit = nyquist(h);
        if limit == 0 {
            return Err(MgError::InvalidConfig(format!(
                "tff: mesh width {} leaves no wavenumber below the Nyquist limit",
                h
            )));
        }

        let m = super::working_matrix(mg, level, ops.a, "tff:lines", false)?;
        let grid = mg.level(level)?;
        let lines = build_lines(grid, &m, ops.c, mg.is_distributed())?;
        let decompositions = self
            .wavenumbers(limit)
            .into_iter()
            .map(|k| decompose(&lines, k, h, level))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "tff: level {}, {} lines, wavenumbers {:?}",
            level,
            lines.members.len(),
            decompositions.iter().map(|d| d.wavenumber).collect::<Vec<_>>()
        );
        self.levels.insert("tff", level, LevelState { lines, decompositions })
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let count = self.levels.get("tff", level)?.decompositions.len();
        if self.config.mode == TffMode::Smoother {
            return self.sweep(mg, level, 0, ops.c, ops);
        }

        blas::set(&mut mg.level_mut(level)?.vectors, ops.c, 0.0);
        let t: TempVector = mg.alloc_temp_vector(ops.c)?;
        let mut last = if self.config.display {
            parallel::global_defect_norm(mg, level, ops.b)?
        } else {
            0.0
        };
        for k in 0..count {
            self.sweep(mg, level, k, &t, ops)?;
            blas::add(&mut mg.level_mut(level)?.vectors, ops.c, &t)?;
            if self.config.display {
                let norm = parallel::global_defect_norm(mg, level, ops.b)?;
                let rate = if last > 0.0 { norm / last } else { 0.0 };
                let wavenumber = self.levels.get("tff", level)?.decompositions[k].wavenumber;
                log::info!("tff: k = {:>5} defect {:.6e} rate {:.4}", wavenumber, norm, rate);
                last = norm;
            }
        }
        Ok(())
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove("tff", level).map(drop)
    }
}
