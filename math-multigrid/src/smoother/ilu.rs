//! Incomplete block LU factorization
//!
//! The factorization works row by row on a consistent copy of the level
//! matrix and keeps the sparsity pattern (ILU(0)); the threshold variant also
//! keeps fill-in that is large relative to the diagonal. Dropped fill can be
//! moved to the diagonal with the modification parameter `beta`.

use super::{
    Iteration, Operands, PerLevel, Step, iterate_with_step, working_matrix, zero_locked,
};
use crate::algebra::{GridLevel, Multigrid, SparseBlockMatrix};
use crate::config::{IluConfig, IluVariant, expand_components, validate_list};
use crate::dense;
use crate::descriptor::VecDesc;
use crate::error::{MgError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Knobs of the shared factorization kernel, already expanded per component.
#[derive(Debug, Clone, Default)]
pub(crate) struct FactorOptions {
    pub(crate) shift: Vec<f64>,
    /// Scale the shift by the magnitude of the diagonal coefficient
    pub(crate) relative_shift: bool,
    pub(crate) beta: Option<Vec<f64>>,
    pub(crate) threshold: Option<Vec<f64>>,
    /// Only vectors created on the level itself take part
    pub(crate) fine_only: bool,
    /// Reject pivots with a non-positive diagonal coefficient
    pub(crate) positive_pivots: bool,
}

/// Incomplete factors: strict lower part holds `L`, the rest `U`.
#[derive(Debug)]
pub(crate) struct Factorization {
    lu: SparseBlockMatrix,
    dims: Vec<usize>,
    /// Inverted pivot blocks, `None` for rows outside the factorization
    inverses: Vec<Option<Vec<f64>>>,
}

fn is_participating(
    grid: &GridLevel,
    i: usize,
    c: &VecDesc,
    opts: &FactorOptions,
    distributed: bool,
) -> bool {
    let v = &grid.vectors[i];
    super::is_active(v, c, distributed) && (!opts.fine_only || v.is_fine())
}

/// Factorize `m` in place.
pub(crate) fn factorize(
    grid: &GridLevel,
    mut m: SparseBlockMatrix,
    c: &VecDesc,
    opts: &FactorOptions,
    procedure: &str,
    distributed: bool,
) -> Result<Factorization> {
    let n = grid.vectors.len();
    let dims: Vec<usize> = grid.vectors.iter().map(|v| c.ncomp(v.gtype())).collect();
    let active: Vec<bool> = (0..n)
        .map(|i| is_participating(grid, i, c, opts, distributed))
        .collect();

    for i in (0..n).filter(|&i| active[i]) {
        let outside: Vec<usize> = m
            .row(i)
            .iter()
            .map(|e| e.col())
            .filter(|&j| j != i && !active[j])
            .collect();
        for j in outside {
            m.remove_entry(i, j);
        }
    }

    let mut inverses: Vec<Option<Vec<f64>>> = vec![None; n];
    for i in 0..n {
        if !active[i] {
            continue;
        }
        let ni = dims[i];
        {
            let d = &mut m.diagonal_mut(i).values;
            for r in 0..ni {
                let s = opts.shift[r];
                let drr = d[r * ni + r];
                d[r * ni + r] += if opts.relative_shift { s * drr.abs() } else { s };
            }
        }
        let pivot_scale: Vec<f64> = (0..ni)
            .map(|r| m.diagonal(i).values()[r * ni + r].abs())
            .collect();

        let mut pending: BTreeSet<usize> = m.lower_cols(i).into_iter().collect();
        while let Some(k) = pending.pop_first() {
            let Some(inv_k) = &inverses[k] else {
                continue;
            };
            let nk = dims[k];
            let Some(a_ik) = m.entry(i, k).map(|e| e.values().to_vec()) else {
                continue;
            };
            let l_ik = dense::block_product(&a_ik, ni, nk, inv_k, nk);
            let upper: Vec<(usize, Vec<f64>)> = m
                .row(k)
                .iter()
                .filter(|e| e.col() > k)
                .map(|e| (e.col(), e.values().to_vec()))
                .collect();
            if let Some(e) = m.entry_mut(i, k) {
                e.values = l_ik.clone();
            }

            for (j, u_kj) in upper {
                let nj = dims[j];
                let update = dense::block_product(&l_ik, ni, nk, &u_kj, nj);
                if let Some(e) = m.entry_mut(i, j) {
                    for (a, u) in e.values.iter_mut().zip(&update) {
                        *a -= u;
                    }
                    continue;
                }
                let keep = opts.threshold.as_ref().is_some_and(|thr| {
                    (0..ni).any(|r| {
                        update[r * nj..(r + 1) * nj]
                            .iter()
                            .any(|u| u.abs() > thr[r] * pivot_scale[r])
                    })
                });
                if keep {
                    m.ensure_entry(i, j, 0).values = update.iter().map(|u| -u).collect();
                    if j < i {
                        pending.insert(j);
                    }
                } else if let Some(beta) = &opts.beta {
                    let d = &mut m.diagonal_mut(i).values;
                    for r in 0..ni {
                        let dropped: f64 = update[r * nj..(r + 1) * nj].iter().sum();
                        d[r * ni + r] -= beta[r] * dropped;
                    }
                }
            }
        }

        let mut pivot = m.diagonal(i).values().to_vec();
        let skip = grid.vectors[i].skip();
        if opts.positive_pivots
            && (0..ni).any(|r| !skip.is_locked(r) && pivot[r * ni + r] <= 0.0)
        {
            return Err(MgError::Factorization {
                procedure: procedure.to_string(),
                level: grid.level,
                index: i,
            });
        }
        dense::mask_diagonal_block(&mut pivot, ni, skip);
        let inv = dense::block_invert(&pivot, ni).map_err(|_| MgError::Factorization {
            procedure: procedure.to_string(),
            level: grid.level,
            index: i,
        })?;
        inverses[i] = Some(inv);
    }

    Ok(Factorization {
        lu: m,
        dims,
        inverses,
    })
}

/// Forward and backward substitution, `c = (LU)^-1 b`.
pub(crate) fn substitute(grid: &mut GridLevel, f: &Factorization, c: &VecDesc, b: &VecDesc) {
    let n = grid.vectors.len();
    let mut y: Vec<Vec<f64>> = vec![Vec::new(); n];
    for i in 0..n {
        if f.inverses[i].is_none() {
            continue;
        }
        let ni = f.dims[i];
        let mut yi = grid.vectors[i].get(b);
        for e in f.lu.row(i).iter().filter(|e| e.col() < i) {
            let k = e.col();
            dense::block_mul_sub(e.values(), ni, f.dims[k], &y[k], &mut yi);
        }
        y[i] = yi;
    }

    let mut x: Vec<Vec<f64>> = vec![Vec::new(); n];
    for i in (0..n).rev() {
        let ni = f.dims[i];
        let Some(inv) = &f.inverses[i] else {
            x[i] = vec![0.0; ni];
            continue;
        };
        let mut r = std::mem::take(&mut y[i]);
        for e in f.lu.row(i).iter().filter(|e| e.col() > i) {
            let j = e.col();
            dense::block_mul_sub(e.values(), ni, f.dims[j], &x[j], &mut r);
        }
        let mut xi = dense::block_mul(inv, ni, ni, &r);
        zero_locked(&grid.vectors[i], &mut xi);
        x[i] = xi;
    }

    for (v, xi) in grid.vectors.iter_mut().zip(&x) {
        if !xi.is_empty() {
            v.put(c, xi);
        }
    }
}

/// Incomplete LU smoother in four variants.
#[derive(Debug)]
pub struct Ilu {
    config: IluConfig,
    levels: PerLevel<Factorization>,
}

impl Ilu {
    /// Create an ILU smoother
    pub fn new(config: IluConfig) -> Result<Self> {
        config.smoother.validate()?;
        validate_list("beta", &config.beta)?;
        validate_list("shift", &config.shift)?;
        validate_list("threshold", &config.threshold)?;
        if config.threshold.iter().any(|t| *t < 0.0) {
            return Err(MgError::InvalidConfig(format!(
                "ilu threshold must not be negative: {:?}",
                config.threshold
            )));
        }
        Ok(Self {
            config,
            levels: PerLevel::default(),
        })
    }

    fn options(&self, ncomp: usize) -> Result<FactorOptions> {
        let cfg = &self.config;
        Ok(FactorOptions {
            shift: expand_components("shift", &cfg.shift, ncomp)?,
            relative_shift: cfg.variant == IluVariant::Spectral,
            beta: Some(expand_components("beta", &cfg.beta, ncomp)?),
            threshold: match cfg.variant {
                IluVariant::Threshold => {
                    Some(expand_components("threshold", &cfg.threshold, ncomp)?)
                }
                _ => None,
            },
            fine_only: cfg.variant == IluVariant::Fine,
            positive_pivots: false,
        })
    }
}

impl fmt::Display for Ilu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ilu")?;
        writeln!(f, "  variant     = {:?}", self.config.variant)?;
        writeln!(f, "  beta        = {:?}", self.config.beta)?;
        writeln!(f, "  shift       = {:?}", self.config.shift)?;
        if self.config.variant == IluVariant::Threshold {
            writeln!(f, "  threshold   = {:?}", self.config.threshold)?;
        }
        writeln!(f, "  damp        = {:?}", self.config.smoother.damp)?;
        write!(f, "  consistency = {:?}", self.config.smoother.consistency)
    }
}

impl Step for Ilu {
    fn step(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        let factors = self.levels.get("ilu", level)?;
        substitute(mg.level_mut(level)?, factors, ops.c, ops.b);
        Ok(())
    }
}

impl Iteration for Ilu {
    fn name(&self) -> &str {
        "ilu"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("ilu", level)?;
        ops.check()?;
        let opts = self.options(ops.c.max_comp())?;
        let m = working_matrix(mg, level, ops.a, "ilu:lu", false)?;
        let factors = factorize(
            mg.level(level)?,
            m.matrix,
            ops.c,
            &opts,
            "ilu",
            mg.is_distributed(),
        )?;
        log::debug!(
            "ilu: level {} factorized, {} block entries",
            level,
            factors.lu.nnz()
        );
        self.levels.insert("ilu", level, factors)
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("ilu", level)?;
        let config = self.config.smoother.clone();
        iterate_with_step(self, &config, mg, level, ops)
    }

    fn post_process(
        &mut self,
        _mg: &mut Multigrid,
        level: usize,
        _ops: &Operands<'_>,
    ) -> Result<()> {
        self.levels.remove("ilu", level).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{GeomType, MatDesc};
    use approx::assert_relative_eq;

    /// Tridiagonal chain `[-1, d, -1]` with unit defect
    fn chain(n: usize, d: f64) -> (Multigrid, VecDesc, VecDesc, MatDesc) {
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
            level.set_block(i, i, &a, &[d]).unwrap();
            if i > 0 {
                level.set_block(i, i - 1, &a, &[-1.0]).unwrap();
                level.set_block(i - 1, i, &a, &[-1.0]).unwrap();
            }
            level.set_values(i, &b, &[1.0]).unwrap();
        }
        (mg, c, b, a)
    }

    #[test]
    fn test_ilu0_is_exact_on_tridiagonal() {
        let n = 8;
        let (mut mg, c, b, a) = chain(n, 2.0);
        let ops = Operands::new(&c, &b, &a);
        let mut ilu = Ilu::new(IluConfig::default()).unwrap();
        ilu.pre_process(&mut mg, 0, &ops).unwrap();
        ilu.iterate(&mut mg, 0, &ops).unwrap();
        let level = mg.level(0).unwrap();
        // no fill on a tridiagonal matrix: the defect vanishes
        for i in 0..n {
            assert_relative_eq!(level.values(i, &b).unwrap()[0], 0.0, epsilon = 1e-12);
        }
        // exact solution of the discrete Poisson problem: x_i = (i+1)(n-i)/2
        for i in 0..n {
            let exact = ((i + 1) * (n - i)) as f64 / 2.0;
            assert_relative_eq!(level.values(i, &c).unwrap()[0], exact, epsilon = 1e-10);
        }
    }

    /// 2x2 periodic block: full coupling produces fill on the corner
    fn ring(beta: f64, variant: IluVariant, threshold: f64) -> (Vec<f64>, Vec<f64>) {
        let mut mg = Multigrid::new(1);
        let c = mg.create_vec_desc("c", [1, 0, 0, 0]).unwrap();
        let b = mg.create_vec_desc("b", [1, 0, 0, 0]).unwrap();
        let a = mg.create_mat_desc("A", &b, &c).unwrap();
        for _ in 0..4 {
            mg.add_vector(0, GeomType::Node).unwrap();
        }
        for i in 0..4 {
            mg.connect(0, i, (i + 1) % 4).unwrap();
        }
        let level = mg.level_mut(0).unwrap();
        for i in 0..4 {
            level.set_block(i, i, &a, &[4.0]).unwrap();
            level.set_block(i, (i + 1) % 4, &a, &[-1.0]).unwrap();
            level.set_block((i + 1) % 4, i, &a, &[-1.0]).unwrap();
            level.set_values(i, &b, &[1.0]).unwrap();
        }
        let ops = Operands::new(&c, &b, &a);
        let mut ilu = Ilu::new(IluConfig {
            variant,
            beta: vec![beta],
            threshold: vec![threshold],
            ..Default::default()
        })
        .unwrap();
        ilu.pre_process(&mut mg, 0, &ops).unwrap();
        ilu.iterate(&mut mg, 0, &ops).unwrap();
        let level = mg.level(0).unwrap();
        (level.gather(&c), level.gather(&b))
    }

    #[test]
    fn test_threshold_fill_improves_defect() {
        let (_, plain) = ring(0.0, IluVariant::Plain, 0.0);
        let (_, filled) = ring(0.0, IluVariant::Threshold, 0.0);
        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!(norm(&filled) < norm(&plain));
        // with all fill kept the factorization is exact
        assert!(norm(&filled) < 1e-12);
    }

    #[test]
    fn test_modified_ilu_preserves_row_sums() {
        // MILU with beta = 1 is exact on the constant vector, and the unit
        // defect here is A times a constant
        let (c, b) = ring(1.0, IluVariant::Plain, 0.0);
        for (ci, bi) in c.iter().zip(&b) {
            assert_relative_eq!(*ci, 0.5, epsilon = 1e-12);
            assert_relative_eq!(*bi, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_fine_variant_skips_coarse_vectors() {
        let (mut mg, c, b, a) = chain(3, 2.0);
        mg.level_mut(0).unwrap().vector_mut(1).unwrap().set_fine(false);
        let ops = Operands::new(&c, &b, &a);
        let mut ilu = Ilu::new(IluConfig {
            variant: IluVariant::Fine,
            ..Default::default()
        })
        .unwrap();
        ilu.pre_process(&mut mg, 0, &ops).unwrap();
        ilu.iterate(&mut mg, 0, &ops).unwrap();
        let c = mg.level(0).unwrap().gather(&c);
        assert_eq!(c, vec![0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_singular_pivot_is_fatal() {
        let (mut mg, c, b, a) = chain(2, 1.0);
        let ops = Operands::new(&c, &b, &a);
        let mut ilu = Ilu::new(IluConfig::default()).unwrap();
        // [1 -1; -1 1] leaves a zero second pivot
        let err = ilu.pre_process(&mut mg, 0, &ops).unwrap_err();
        assert!(matches!(err, MgError::Factorization { index: 1, .. }));
        assert!(ilu.iterate(&mut mg, 0, &ops).is_err());
    }

    #[test]
    fn test_spectral_shift_is_relative() {
        let (mut mg, c, b, a) = chain(1, 2.0);
        let ops = Operands::new(&c, &b, &a);
        let mut ilu = Ilu::new(IluConfig {
            variant: IluVariant::Spectral,
            shift: vec![1.0],
            ..Default::default()
        })
        .unwrap();
        ilu.pre_process(&mut mg, 0, &ops).unwrap();
        ilu.iterate(&mut mg, 0, &ops).unwrap();
        // pivot 2 + 1 * |2| = 4
        assert_relative_eq!(mg.level(0).unwrap().values(0, &c).unwrap()[0], 0.25);
    }
}
