//! One level of the grid hierarchy as seen by the algebra
//!
//! The grid manager owns geometry and refinement; this core only needs the
//! vectors of a level, their matrix rows, the structured blockvectors, the
//! processor interfaces and the prolongation from the next coarser level.

use super::matrix::{LevelMatrix, MatrixEntry, SparseBlockMatrix};
use super::vector::{SkipMask, Vector};
use crate::descriptor::{MatDesc, VecDesc};
use crate::error::{MgError, Result};
use crate::parallel::{InterfaceKind, LevelInterfaces};

/// A structured group of vectors, e.g. one grid line.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockVector {
    /// Identifier used by block-restricted exchanges
    pub id: usize,
    /// Member vectors in line order
    pub vectors: Vec<usize>,
}

/// Interpolation weights from the next coarser level.
///
/// Row `i` lists `(coarse vector, weight)` pairs for fine vector `i`; the
/// same weights apply to every component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prolongation {
    rows: Vec<Vec<(usize, f64)>>,
}

impl Prolongation {
    /// Empty prolongation for `num_fine` fine vectors
    pub fn new(num_fine: usize) -> Self {
        Self {
            rows: vec![Vec::new(); num_fine],
        }
    }

    /// Add weight `w` between fine vector `fine` and coarse vector `coarse`
    pub fn add(&mut self, fine: usize, coarse: usize, w: f64) {
        if fine >= self.rows.len() {
            self.rows.resize(fine + 1, Vec::new());
        }
        match self.rows[fine].iter_mut().find(|(c, _)| *c == coarse) {
            Some((_, weight)) => *weight += w,
            None => self.rows[fine].push((coarse, w)),
        }
    }

    /// Number of fine vectors
    pub fn num_fine(&self) -> usize {
        self.rows.len()
    }

    /// Weights of fine vector `i`
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        self.rows.get(i).map_or(&[], Vec::as_slice)
    }
}

/// Vectors, matrix and metadata of one level.
#[derive(Debug, Clone)]
pub struct GridLevel {
    /// Level number, 0 is the coarsest
    pub level: usize,
    /// Degree-of-freedom vectors
    pub vectors: Vec<Vector>,
    /// Row lists of the level matrix
    pub matrix: SparseBlockMatrix,
    /// Structured line groupings
    pub blockvectors: Vec<BlockVector>,
    /// Processor interfaces
    pub interfaces: LevelInterfaces,
    /// Mesh width of a structured level
    pub mesh_width: Option<f64>,
    /// Interpolation from level `level - 1`
    pub prolongation: Option<Prolongation>,
}

impl GridLevel {
    /// Empty level
    pub fn new(level: usize) -> Self {
        Self {
            level,
            vectors: Vec::new(),
            matrix: SparseBlockMatrix::default(),
            blockvectors: Vec::new(),
            interfaces: LevelInterfaces::default(),
            mesh_width: None,
            prolongation: None,
        }
    }

    /// Number of vectors
    #[inline]
    pub fn num_vectors(&self) -> usize {
        self.vectors.len()
    }

    /// Index of the last vector of the level
    pub fn last_vector(&self) -> Option<usize> {
        self.vectors.len().checked_sub(1)
    }

    fn check_index(&self, i: usize) -> Result<()> {
        if i >= self.vectors.len() {
            return Err(MgError::NoSuchVector {
                level: self.level,
                index: i,
                len: self.vectors.len(),
            });
        }
        Ok(())
    }

    /// Vector `i`
    pub fn vector(&self, i: usize) -> Result<&Vector> {
        self.check_index(i)?;
        Ok(&self.vectors[i])
    }

    /// Mutable vector `i`
    pub fn vector_mut(&mut self, i: usize) -> Result<&mut Vector> {
        self.check_index(i)?;
        Ok(&mut self.vectors[i])
    }

    /// Components of `x` on vector `i`
    pub fn values(&self, i: usize, x: &VecDesc) -> Result<Vec<f64>> {
        Ok(self.vector(i)?.get(x))
    }

    /// Write the components of `x` on vector `i`
    pub fn set_values(&mut self, i: usize, x: &VecDesc, values: &[f64]) -> Result<()> {
        self.vector_mut(i)?.put(x, values);
        Ok(())
    }

    /// Components of `x` on all vectors, concatenated in vector order
    pub fn gather(&self, x: &VecDesc) -> Vec<f64> {
        self.vectors.iter().flat_map(|v| v.get(x)).collect()
    }

    /// Lock components of vector `i`
    pub fn set_skip(&mut self, i: usize, skip: SkipMask) -> Result<()> {
        self.vector_mut(i)?.set_skip(skip);
        Ok(())
    }

    fn entry_block<'a>(
        &'a mut self,
        i: usize,
        j: usize,
        a: &'a MatDesc,
    ) -> Result<(&'a mut MatrixEntry, &'a [usize])> {
        self.check_index(i)?;
        self.check_index(j)?;
        let rt = self.vectors[i].gtype();
        let ct = self.vectors[j].gtype();
        let block = a.block(rt, ct).ok_or_else(|| {
            MgError::InvalidConfig(format!(
                "matrix {} has no ({}, {}) block",
                a.name(),
                rt,
                ct
            ))
        })?;
        let level = self.level;
        let entry = self.matrix.entry_mut(i, j).ok_or_else(|| {
            MgError::InvalidConfig(format!(
                "vectors {} and {} are not connected on level {}",
                i, j, level
            ))
        })?;
        Ok((entry, block.components()))
    }

    /// Overwrite block `(i, j)` of `a` with row-major `values`.
    ///
    /// The connection must exist.
    pub fn set_block(&mut self, i: usize, j: usize, a: &MatDesc, values: &[f64]) -> Result<()> {
        let (entry, comps) = self.entry_block(i, j, a)?;
        for (&c, &v) in comps.iter().zip(values) {
            entry.values[c] = v;
        }
        Ok(())
    }

    /// Add row-major `values` to block `(i, j)` of `a`
    pub fn add_block(&mut self, i: usize, j: usize, a: &MatDesc, values: &[f64]) -> Result<()> {
        let (entry, comps) = self.entry_block(i, j, a)?;
        for (&c, &v) in comps.iter().zip(values) {
            entry.values[c] += v;
        }
        Ok(())
    }

    /// Block `(i, j)` of `a` as row-major values
    pub fn block(&self, i: usize, j: usize, a: &MatDesc) -> Option<Vec<f64>> {
        let rt = self.vectors.get(i)?.gtype();
        let ct = self.vectors.get(j)?.gtype();
        let block = a.block(rt, ct)?;
        let entry = self.matrix.entry(i, j)?;
        Some(block.components().iter().map(|&c| entry.values[c]).collect())
    }

    /// Compact owned copy of the blocks `a` defines.
    ///
    /// Entries between type pairs `a` leaves undefined are dropped, the
    /// diagonal of every row is kept (empty when its block is undefined).
    pub fn extract_matrix(&self, a: &MatDesc, name: &str) -> LevelMatrix {
        let mut matrix = SparseBlockMatrix::default();
        for (i, v) in self.vectors.iter().enumerate() {
            let rt = v.gtype();
            let width = a.block(rt, rt).map_or(0, |b| b.components().len());
            matrix.push_row(width);
            for e in self.matrix.row(i) {
                let Some(block) = a.block(rt, self.vectors[e.col()].gtype()) else {
                    continue;
                };
                let values: Vec<f64> = block.components().iter().map(|&c| e.values[c]).collect();
                if e.col() == i {
                    matrix.diagonal_mut(i).values = values;
                } else {
                    matrix.ensure_entry(i, e.col(), 0).values = values;
                }
            }
        }
        LevelMatrix {
            matrix,
            desc: a.compacted(name),
        }
    }

    /// Register a blockvector and tag its members
    pub fn add_blockvector(&mut self, vectors: Vec<usize>) -> Result<usize> {
        for &v in &vectors {
            self.check_index(v)?;
        }
        let id = self.blockvectors.len();
        for &v in &vectors {
            self.vectors[v].set_block(Some(id));
        }
        self.blockvectors.push(BlockVector { id, vectors });
        Ok(id)
    }

    /// Declare that `vectors` are replicated on processor `partner`.
    ///
    /// Links are kept in global id order so both sides agree on the payload
    /// layout.
    pub fn link_replicas(
        &mut self,
        kind: InterfaceKind,
        partner: usize,
        vectors: &[usize],
    ) -> Result<()> {
        for &v in vectors {
            self.check_index(v)?;
        }
        let gids: Vec<u64> = self.vectors.iter().map(Vector::gid).collect();
        let iface = self.interfaces.get_mut(kind);
        iface.add_link(partner, vectors.to_vec());
        iface.sort_links(|v| gids[v]);
        Ok(())
    }
}
