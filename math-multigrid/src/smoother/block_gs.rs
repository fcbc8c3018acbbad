//! Block Gauss-Seidel over component groups
//!
//! The components of every vector are split into contiguous blocks. Each
//! block gets its own nested smoother, applied to the diagonal sub-matrix;
//! after a block is smoothed its correction is carried into the defect of
//! every other block before the next one is visited.

use super::{Iteration, Operands, PerLevel};
use crate::algebra::Multigrid;
use crate::blas;
use crate::config::BlockRange;
use crate::descriptor::{MatDesc, VecDesc};
use crate::error::{MgError, Result};
use crate::parallel;
use std::fmt;
use std::ops::Range;

/// Sub-descriptors of one set of operands.
struct Split {
    c: Vec<VecDesc>,
    b: Vec<VecDesc>,
    /// `a[j][k]` couples row block `j` to column block `k`
    a: Vec<Vec<MatDesc>>,
}

/// Block Gauss-Seidel with one nested smoother per block.
pub struct BlockGaussSeidel {
    blocks: Vec<Range<usize>>,
    order: Vec<usize>,
    nested: Vec<Box<dyn Iteration>>,
    levels: PerLevel<()>,
}

impl fmt::Debug for BlockGaussSeidel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGaussSeidel")
            .field("blocks", &self.blocks)
            .field("order", &self.order)
            .field(
                "nested",
                &self.nested.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BlockGaussSeidel {
    /// Create from a partition, a visiting order (empty means natural order)
    /// and one nested smoother per block.
    pub fn new(
        blocks: Vec<BlockRange>,
        order: Vec<usize>,
        nested: Vec<Box<dyn Iteration>>,
    ) -> Result<Self> {
        if blocks.is_empty() {
            return Err(MgError::InvalidPartition("no blocks given".to_string()));
        }
        let mut next = 0;
        for (k, b) in blocks.iter().enumerate() {
            if b.start != next {
                return Err(MgError::InvalidPartition(format!(
                    "block {} starts at {}, expected {}",
                    k, b.start, next
                )));
            }
            if b.end <= b.start {
                return Err(MgError::InvalidPartition(format!("block {} is empty", k)));
            }
            next = b.end;
        }
        if nested.len() != blocks.len() {
            return Err(MgError::InvalidConfig(format!(
                "{} blocks need {} nested smoothers, got {}",
                blocks.len(),
                blocks.len(),
                nested.len()
            )));
        }
        let order = if order.is_empty() {
            (0..blocks.len()).collect()
        } else {
            order
        };
        let mut seen = vec![false; blocks.len()];
        for &k in &order {
            if k >= blocks.len() || seen[k] {
                return Err(MgError::InvalidConfig(format!(
                    "block order {:?} is not a permutation of 0..{}",
                    order,
                    blocks.len()
                )));
            }
            seen[k] = true;
        }
        if order.len() != blocks.len() {
            return Err(MgError::InvalidConfig(format!(
                "block order {:?} is not a permutation of 0..{}",
                order,
                blocks.len()
            )));
        }
        Ok(Self {
            blocks: blocks.iter().map(|b| b.start..b.end).collect(),
            order,
            nested,
            levels: PerLevel::default(),
        })
    }

    /// Number of components the partition covers
    fn total(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.end)
    }

    fn check_partition(&self, x: &VecDesc) -> Result<()> {
        let total = self.total();
        for t in x.defined_types() {
            if x.ncomp(t) != total {
                return Err(MgError::InvalidPartition(format!(
                    "{} has {} components of type {}, the blocks cover {}",
                    x.name(),
                    x.ncomp(t),
                    t,
                    total
                )));
            }
        }
        Ok(())
    }

    fn split_vec(&self, x: &VecDesc) -> Result<Vec<VecDesc>> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(k, r)| x.sub(format!("{}[{}]", x.name(), k), r.clone()))
            .collect()
    }

    fn split(&self, ops: &Operands<'_>) -> Result<Split> {
        ops.check()?;
        self.check_partition(ops.c)?;
        let mut a = Vec::with_capacity(self.blocks.len());
        for (j, rows) in self.blocks.iter().enumerate() {
            let row = self
                .blocks
                .iter()
                .enumerate()
                .map(|(k, cols)| {
                    ops.a
                        .sub(format!("{}[{},{}]", ops.a.name(), j, k), rows.clone(), cols.clone())
                })
                .collect::<Result<Vec<_>>>()?;
            a.push(row);
        }
        Ok(Split {
            c: self.split_vec(ops.c)?,
            b: self.split_vec(ops.b)?,
            a,
        })
    }
}

impl fmt::Display for BlockGaussSeidel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bgs")?;
        writeln!(f, "  blocks = {:?}", self.blocks)?;
        write!(f, "  order  = {:?}", self.order)?;
        for (k, s) in self.nested.iter().enumerate() {
            write!(f, "\n  block {}: {}", k, s.name())?;
        }
        Ok(())
    }
}

impl Iteration for BlockGaussSeidel {
    fn name(&self) -> &str {
        "bgs"
    }

    fn pre_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.ensure_vacant("bgs", level)?;
        let split = self.split(ops)?;
        for k in 0..self.nested.len() {
            let sub = Operands::new(&split.c[k], &split.b[k], &split.a[k][k]);
            if let Err(err) = self.nested[k].pre_process(mg, level, &sub) {
                for done in (0..k).rev() {
                    let sub = Operands::new(&split.c[done], &split.b[done], &split.a[done][done]);
                    if let Err(undo) = self.nested[done].post_process(mg, level, &sub) {
                        log::warn!("bgs: rollback of block {} failed: {}", done, undo);
                    }
                }
                return Err(err);
            }
        }
        self.levels.insert("bgs", level, ())
    }

    fn iterate(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("bgs", level)?;
        let split = self.split(ops)?;
        if mg.is_distributed() {
            parallel::vector_collect(mg, level, ops.b)?;
        }
        blas::set(&mut mg.level_mut(level)?.vectors, ops.c, 0.0);

        let t = mg.alloc_temp_vector(ops.c)?;
        let t_parts = self.split_vec(&t)?;
        for &k in &self.order {
            let sub = Operands::new(&t_parts[k], &split.b[k], &split.a[k][k]);
            self.nested[k].iterate(mg, level, &sub)?;
            let grid = mg.level_mut(level)?;
            for j in (0..self.blocks.len()).filter(|&j| j != k) {
                blas::matmul_minus(
                    &mut grid.vectors,
                    &split.b[j],
                    &grid.matrix,
                    &split.a[j][k],
                    &t_parts[k],
                )?;
            }
            blas::add(&mut grid.vectors, &split.c[k], &t_parts[k])?;
        }
        Ok(())
    }

    /// Release every nested smoother, also after one of them fails; the
    /// first error is returned.
    fn post_process(&mut self, mg: &mut Multigrid, level: usize, ops: &Operands<'_>) -> Result<()> {
        self.levels.get("bgs", level)?;
        let split = self.split(ops)?;
        self.levels.remove("bgs", level)?;
        let mut first: Result<()> = Ok(());
        for k in 0..self.nested.len() {
            let sub = Operands::new(&split.c[k], &split.b[k], &split.a[k][k]);
            if let Err(err) = self.nested[k].post_process(mg, level, &sub) {
                if first.is_ok() {
                    first = Err(err);
                } else {
                    log::warn!("bgs: release of block {} failed: {}", k, err);
                }
            }
        }
        first
    }
}
