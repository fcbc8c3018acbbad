//! Grid transfer between neighbouring levels
//!
//! Levels are addressed by the finer of the two: `fine` and `fine - 1`. The
//! prolongation lives on the fine level; restriction applies its transpose.
//! Restricting an additive defect and interpolating a consistent correction
//! both stay local, so no exchange happens here.

use crate::algebra::{GridLevel, Multigrid, Prolongation};
use crate::config::{TransferConfig, expand_components, validate_list};
use crate::descriptor::{MatDesc, VecDesc, check_vec_vec};
use crate::error::{MgError, Result};
use std::fmt;

/// Restriction, interpolation and the optional correction hook.
pub trait Transfer: fmt::Display + Send {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Prepare the transfer between `fine - 1` and `fine`
    fn pre_process(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        x: &VecDesc,
        b: &VecDesc,
        a: &MatDesc,
    ) -> Result<()>;

    /// `coarse = R fine` for the defect
    fn restrict_defect(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        coarse: &VecDesc,
        fine_b: &VecDesc,
    ) -> Result<()>;

    /// `fine = damp * P coarse` for the correction
    fn interpolate_correction(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        fine_c: &VecDesc,
        coarse: &VecDesc,
    ) -> Result<()>;

    /// Adjust the correction after the coarse-grid step
    fn adapt_correction(
        &mut self,
        _mg: &mut Multigrid,
        _level: usize,
        _c: &VecDesc,
        _b: &VecDesc,
        _a: &MatDesc,
    ) -> Result<()> {
        Ok(())
    }

    /// Release what `pre_process` built
    fn post_process(&mut self, _mg: &mut Multigrid, _fine: usize) -> Result<()> {
        Ok(())
    }
}

fn prolongation(grid: &GridLevel) -> Result<&Prolongation> {
    grid.prolongation.as_ref().ok_or_else(|| {
        MgError::not_executable("transfer", format!("level {} has no prolongation", grid.level))
    })
}

/// Transfer through the stored prolongation matrices.
#[derive(Debug, Clone, Default)]
pub struct MatrixTransfer {
    config: TransferConfig,
}

impl MatrixTransfer {
    /// Create a matrix transfer
    pub fn new(config: TransferConfig) -> Result<Self> {
        validate_list("damp", &config.damp)?;
        Ok(Self { config })
    }
}

impl fmt::Display for MatrixTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "transfer")?;
        write!(f, "  damp = {:?}", self.config.damp)
    }
}

impl Transfer for MatrixTransfer {
    fn name(&self) -> &str {
        "transfer"
    }

    fn pre_process(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        x: &VecDesc,
        b: &VecDesc,
        _a: &MatDesc,
    ) -> Result<()> {
        check_vec_vec(x, b)?;
        let (coarse_grid, fine_grid) = mg.levels_pair_mut(fine)?;
        let p = prolongation(fine_grid)?;
        if p.num_fine() > fine_grid.num_vectors() {
            return Err(MgError::InvalidConfig(format!(
                "prolongation of level {} has {} rows for {} vectors",
                fine,
                p.num_fine(),
                fine_grid.num_vectors()
            )));
        }
        let ncoarse = coarse_grid.num_vectors();
        if let Some(i) = (0..p.num_fine()).find(|&i| p.row(i).iter().any(|&(c, _)| c >= ncoarse)) {
            return Err(MgError::NoSuchVector {
                level: fine - 1,
                index: p.row(i).iter().map(|&(c, _)| c).max().unwrap_or(0),
                len: ncoarse,
            });
        }
        expand_components("damp", &self.config.damp, x.max_comp())?;
        Ok(())
    }

    fn restrict_defect(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        coarse: &VecDesc,
        fine_b: &VecDesc,
    ) -> Result<()> {
        check_vec_vec(coarse, fine_b)?;
        let (coarse_grid, fine_grid) = mg.levels_pair_mut(fine)?;
        let p = prolongation(fine_grid)?;
        let mut sums: Vec<Vec<f64>> = coarse_grid
            .vectors
            .iter()
            .map(|v| vec![0.0; coarse.ncomp(v.gtype())])
            .collect();
        for (i, v) in fine_grid.vectors.iter().enumerate() {
            let values = v.get(fine_b);
            for &(cj, w) in p.row(i) {
                for (s, value) in sums[cj].iter_mut().zip(&values) {
                    *s += w * value;
                }
            }
        }
        for (v, mut s) in coarse_grid.vectors.iter_mut().zip(sums) {
            if s.is_empty() {
                continue;
            }
            let skip = v.skip();
            for (k, value) in s.iter_mut().enumerate() {
                if skip.is_locked(k) {
                    *value = 0.0;
                }
            }
            v.put(coarse, &s);
        }
        Ok(())
    }

    fn interpolate_correction(
        &mut self,
        mg: &mut Multigrid,
        fine: usize,
        fine_c: &VecDesc,
        coarse: &VecDesc,
    ) -> Result<()> {
        check_vec_vec(fine_c, coarse)?;
        let damp = expand_components("damp", &self.config.damp, fine_c.max_comp())?;
        let (coarse_grid, fine_grid) = mg.levels_pair_mut(fine)?;
        let p = prolongation(fine_grid)?;
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(fine_grid.num_vectors());
        for (i, v) in fine_grid.vectors.iter().enumerate() {
            let n = fine_c.ncomp(v.gtype());
            let mut x = vec![0.0; n];
            for &(cj, w) in p.row(i) {
                for (xk, ck) in x.iter_mut().zip(coarse_grid.vectors[cj].get(coarse)) {
                    *xk += w * ck;
                }
            }
            let skip = v.skip();
            for (k, xk) in x.iter_mut().enumerate() {
                *xk = if skip.is_locked(k) { 0.0 } else { damp[k] * *xk };
            }
            values.push(x);
        }
        for (v, x) in fine_grid.vectors.iter_mut().zip(values) {
            if !x.is_empty() {
                v.put(fine_c, &x);
            }
        }
        Ok(())
    }
}

/// Assemble the Galerkin matrix `P^T A P` of level `fine - 1` into `a`.
///
/// Missing coarse connections are created; the coarse blocks of `a` are
/// overwritten.
pub fn galerkin_coarse_matrix(mg: &mut Multigrid, fine: usize, a: &MatDesc) -> Result<()> {
    let contributions = {
        let fine_grid = mg.level(fine)?;
        let p = prolongation(fine_grid)?;
        let mut out: Vec<(usize, usize, Vec<f64>)> = Vec::new();
        for i in 0..fine_grid.num_vectors() {
            for e in fine_grid.matrix.row(i) {
                let j = e.col();
                let Some(block) = fine_grid.block(i, j, a) else {
                    continue;
                };
                for &(ci, wi) in p.row(i) {
                    for &(cj, wj) in p.row(j) {
                        out.push((ci, cj, block.iter().map(|v| wi * wj * v).collect()));
                    }
                }
            }
        }
        out
    };

    for &(ci, cj, _) in &contributions {
        mg.connect(fine - 1, ci, cj)?;
    }
    let coarse_grid = mg.level_mut(fine - 1)?;
    crate::blas::mat_set(&coarse_grid.vectors, &mut coarse_grid.matrix, a, 0.0);
    for (ci, cj, values) in contributions {
        coarse_grid.add_block(ci, cj, a, &values)?;
    }
    log::debug!(
        "galerkin: level {} assembled, {} block entries",
        fine - 1,
        coarse_grid.matrix.nnz()
    );
    Ok(())
}
