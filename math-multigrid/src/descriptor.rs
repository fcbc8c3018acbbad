//! Vector and matrix descriptors
//!
//! A descriptor binds a symbolic operand name to a per-geometric-type list of
//! component offsets inside the storage of each vector (or matrix entry).
//! One algorithm can then run over unknowns placed on nodes, edges, sides and
//! elements alike: for a vector of type `t`, the descriptor yields the
//! ordered offsets of its scalar components.
//!
//! Descriptors whose every defined type carries exactly one component at the
//! same offset are *scalar*; they expose a single-offset fast path that skips
//! the per-type lookup.

use crate::error::{MgError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Number of geometric entity types a degree of freedom can attach to.
pub const NUM_GEOM_TYPES: usize = 4;

/// Largest row or column dimension of a single matrix block.
///
/// Dense block work buffers and the skip mask are sized for this bound.
pub const MAX_BLOCK_SIZE: usize = 40;

/// Mesh entity kind carrying degrees of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeomType {
    /// Corner / node
    Node,
    /// Edge
    Edge,
    /// Side (face in 3D)
    Side,
    /// Element interior
    Elem,
}

impl GeomType {
    /// All types in storage order.
    pub const ALL: [GeomType; NUM_GEOM_TYPES] =
        [GeomType::Node, GeomType::Edge, GeomType::Side, GeomType::Elem];

    /// Position of the type in per-type tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for GeomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeomType::Node => "node",
            GeomType::Edge => "edge",
            GeomType::Side => "side",
            GeomType::Elem => "elem",
        };
        f.write_str(name)
    }
}

/// Per-type component layout of a vector operand.
#[derive(Debug, Clone, PartialEq)]
pub struct VecDesc {
    name: String,
    comps: [Vec<usize>; NUM_GEOM_TYPES],
    scalar: Option<usize>,
}

impl VecDesc {
    /// Create a descriptor from per-type offset lists.
    pub fn new(name: impl Into<String>, comps: [Vec<usize>; NUM_GEOM_TYPES]) -> Self {
        let scalar = scalar_offset(comps.iter().map(Vec::as_slice));
        Self {
            name: name.into(),
            comps,
            scalar,
        }
    }

    /// Descriptor with a single component at `offset` for each of `types`.
    pub fn scalar(name: impl Into<String>, types: &[GeomType], offset: usize) -> Self {
        let mut comps: [Vec<usize>; NUM_GEOM_TYPES] = Default::default();
        for t in types {
            comps[t.index()] = vec![offset];
        }
        Self::new(name, comps)
    }

    /// Symbolic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same layout under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Number of components for vectors of type `t`.
    #[inline]
    pub fn ncomp(&self, t: GeomType) -> usize {
        self.comps[t.index()].len()
    }

    /// Ordered storage offsets for vectors of type `t`.
    #[inline]
    pub fn components(&self, t: GeomType) -> &[usize] {
        &self.comps[t.index()]
    }

    /// Whether the descriptor places any component on type `t`.
    #[inline]
    pub fn defines(&self, t: GeomType) -> bool {
        !self.comps[t.index()].is_empty()
    }

    /// Types with at least one component.
    pub fn defined_types(&self) -> impl Iterator<Item = GeomType> + '_ {
        GeomType::ALL.into_iter().filter(|t| self.defines(*t))
    }

    /// Largest component count over all types.
    pub fn max_comp(&self) -> usize {
        self.comps.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Single storage offset when the descriptor is scalar.
    #[inline]
    pub fn scalar_comp(&self) -> Option<usize> {
        self.scalar
    }

    /// Whether the single-offset fast path applies.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.scalar.is_some()
    }

    pub(crate) fn all_components(&self) -> &[Vec<usize>; NUM_GEOM_TYPES] {
        &self.comps
    }

    /// Sub-descriptor made of the components `range` of every defined type.
    ///
    /// Every defined type must carry at least `range.end` components.
    pub fn sub(&self, name: impl Into<String>, range: Range<usize>) -> Result<VecDesc> {
        let mut comps: [Vec<usize>; NUM_GEOM_TYPES] = Default::default();
        for t in self.defined_types() {
            let own = self.components(t);
            if range.start >= range.end || range.end > own.len() {
                return Err(MgError::InvalidPartition(format!(
                    "{}: range {}..{} does not fit {} components of type {}",
                    self.name,
                    range.start,
                    range.end,
                    own.len(),
                    t
                )));
            }
            comps[t.index()] = own[range.clone()].to_vec();
        }
        Ok(VecDesc::new(name, comps))
    }
}

/// One (row-type, column-type) block of a matrix descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MatBlock {
    rows: usize,
    cols: usize,
    comps: Vec<usize>,
}

impl MatBlock {
    /// Block with row-major storage offsets (`rows * cols` of them).
    pub fn new(rows: usize, cols: usize, comps: Vec<usize>) -> Self {
        debug_assert_eq!(comps.len(), rows * cols);
        Self { rows, cols, comps }
    }

    /// Block whose offsets are `0..rows*cols`, the layout of extracted copies.
    pub fn compact(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, (0..rows * cols).collect())
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major storage offsets
    #[inline]
    pub fn components(&self) -> &[usize] {
        &self.comps
    }

    /// Storage offset of coefficient `(r, c)`
    #[inline]
    pub fn offset(&self, r: usize, c: usize) -> usize {
        self.comps[r * self.cols + c]
    }
}

type BlockTable = [[Option<MatBlock>; NUM_GEOM_TYPES]; NUM_GEOM_TYPES];

/// Per (row-type, column-type) layout of a matrix operand.
#[derive(Debug, Clone, PartialEq)]
pub struct MatDesc {
    name: String,
    blocks: BlockTable,
    scalar: Option<usize>,
}

impl MatDesc {
    /// Create a matrix descriptor from its block table.
    pub fn new(name: impl Into<String>, blocks: BlockTable) -> Self {
        let scalar = scalar_offset(
            blocks
                .iter()
                .flatten()
                .map(|b| b.as_ref().map_or(&[][..], |b| b.components())),
        );
        Self {
            name: name.into(),
            blocks,
            scalar,
        }
    }

    /// Scalar matrix with one coefficient at `offset` between all `types`.
    pub fn scalar(name: impl Into<String>, types: &[GeomType], offset: usize) -> Self {
        let mut blocks: BlockTable = Default::default();
        for rt in types {
            for ct in types {
                blocks[rt.index()][ct.index()] = Some(MatBlock::new(1, 1, vec![offset]));
            }
        }
        Self::new(name, blocks)
    }

    /// Symbolic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block for a (row-type, column-type) pair.
    #[inline]
    pub fn block(&self, rt: GeomType, ct: GeomType) -> Option<&MatBlock> {
        self.blocks[rt.index()][ct.index()].as_ref()
    }

    /// All defined blocks with their type pair.
    pub fn defined_blocks(&self) -> impl Iterator<Item = (GeomType, GeomType, &MatBlock)> + '_ {
        GeomType::ALL.into_iter().flat_map(move |rt| {
            GeomType::ALL
                .into_iter()
                .filter_map(move |ct| self.block(rt, ct).map(|b| (rt, ct, b)))
        })
    }

    /// Largest row or column count over all blocks.
    pub fn max_block_dim(&self) -> usize {
        self.defined_blocks()
            .map(|(_, _, b)| b.rows.max(b.cols))
            .max()
            .unwrap_or(0)
    }

    /// Single storage offset when every block is a 1x1 at the same offset.
    #[inline]
    pub fn scalar_comp(&self) -> Option<usize> {
        self.scalar
    }

    /// Same layout with every block re-based to `0..rows*cols`.
    pub fn compacted(&self, name: impl Into<String>) -> MatDesc {
        let mut blocks: BlockTable = Default::default();
        for (rt, ct, b) in self.defined_blocks() {
            blocks[rt.index()][ct.index()] = Some(MatBlock::compact(b.rows, b.cols));
        }
        MatDesc::new(name, blocks)
    }

    /// Sub-matrix coupling row components `rows` to column components `cols`.
    pub fn sub(
        &self,
        name: impl Into<String>,
        rows: Range<usize>,
        cols: Range<usize>,
    ) -> Result<MatDesc> {
        let mut blocks: BlockTable = Default::default();
        for (rt, ct, b) in self.defined_blocks() {
            if rows.end > b.rows || cols.end > b.cols || rows.is_empty() || cols.is_empty() {
                return Err(MgError::InvalidPartition(format!(
                    "{}: sub-block {:?}x{:?} does not fit the {}x{} block ({}, {})",
                    self.name, rows, cols, b.rows, b.cols, rt, ct
                )));
            }
            let mut comps = Vec::with_capacity(rows.len() * cols.len());
            for r in rows.clone() {
                for c in cols.clone() {
                    comps.push(b.offset(r, c));
                }
            }
            blocks[rt.index()][ct.index()] = Some(MatBlock::new(rows.len(), cols.len(), comps));
        }
        Ok(MatDesc::new(name, blocks))
    }
}

fn scalar_offset<'a>(lists: impl Iterator<Item = &'a [usize]>) -> Option<usize> {
    let mut offset = None;
    for list in lists {
        match (list, offset) {
            ([], _) => {}
            ([c], None) => offset = Some(*c),
            ([c], Some(o)) if *c == o => {}
            _ => return None,
        }
    }
    offset
}

/// Check that `y` matches `x` on every type `x` defines.
///
/// Types only `y` defines are ignored; a type `x` defines and `y` does not is
/// a mismatch with `found == 0`.
pub fn check_vec_vec(x: &VecDesc, y: &VecDesc) -> Result<()> {
    for t in x.defined_types() {
        if y.ncomp(t) != x.ncomp(t) {
            return Err(MgError::DescriptorMismatch {
                dest: y.name.clone(),
                src: x.name.clone(),
                gtype: t,
                expected: x.ncomp(t),
                found: y.ncomp(t),
            });
        }
    }
    Ok(())
}

/// Check that `a` maps `y`-shaped vectors to `x`-shaped vectors.
///
/// The block size bound is checked first and rejects the triple before any
/// shape comparison.
pub fn check_vec_mat_vec(x: &VecDesc, a: &MatDesc, y: &VecDesc) -> Result<()> {
    let size = a.max_block_dim();
    if size > MAX_BLOCK_SIZE {
        log::error!(
            "matrix descriptor {} declares a block of dimension {} (maximum {})",
            a.name,
            size,
            MAX_BLOCK_SIZE
        );
        return Err(MgError::BlockTooLarge {
            matrix: a.name.clone(),
            size,
            max: MAX_BLOCK_SIZE,
        });
    }
    for (rt, ct, b) in a.defined_blocks() {
        if b.rows != x.ncomp(rt) || b.cols != y.ncomp(ct) {
            return Err(MgError::MatrixShapeMismatch {
                matrix: a.name.clone(),
                row_type: rt,
                col_type: ct,
                rows: b.rows,
                cols: b.cols,
                expected_rows: x.ncomp(rt),
                expected_cols: y.ncomp(ct),
            });
        }
    }
    Ok(())
}
