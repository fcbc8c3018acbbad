//! The multigrid container: levels, component pool and communicator

use super::grid::GridLevel;
use super::pool::{ComponentPool, SharedPool, TempVector};
use super::vector::Vector;
use crate::descriptor::{GeomType, MAX_BLOCK_SIZE, MatBlock, MatDesc, NUM_GEOM_TYPES, VecDesc};
use crate::error::{MgError, Result};
use crate::parallel::{Communicator, SerialCommunicator};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default number of vector components per geometric type.
pub const DEFAULT_COMPONENT_CAPACITY: usize = 64;

/// Grid hierarchy on one processor.
///
/// Levels run from 0 (coarsest) to [`top_level`](Multigrid::top_level).
pub struct Multigrid {
    levels: Vec<GridLevel>,
    pool: SharedPool,
    comm: Arc<dyn Communicator>,
    next_gid: u64,
}

impl std::fmt::Debug for Multigrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multigrid")
            .field("levels", &self.levels.len())
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .finish()
    }
}

impl Multigrid {
    /// Serial hierarchy with `num_levels` empty levels
    pub fn new(num_levels: usize) -> Self {
        Self::with_communicator(num_levels, Arc::new(SerialCommunicator))
    }

    /// Hierarchy attached to a communicator
    pub fn with_communicator(num_levels: usize, comm: Arc<dyn Communicator>) -> Self {
        Self {
            levels: (0..num_levels).map(GridLevel::new).collect(),
            pool: Arc::new(Mutex::new(ComponentPool::new(DEFAULT_COMPONENT_CAPACITY))),
            comm,
            next_gid: 0,
        }
    }

    /// Change the per-type component capacity; only valid before allocation
    pub fn with_component_capacity(mut self, capacity: usize) -> Self {
        self.pool = Arc::new(Mutex::new(ComponentPool::new(capacity)));
        self
    }

    /// Number of levels
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Finest level
    #[inline]
    pub fn top_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level >= self.levels.len() {
            return Err(MgError::NoSuchLevel {
                level,
                top: self.top_level(),
            });
        }
        Ok(())
    }

    /// Level `level`
    pub fn level(&self, level: usize) -> Result<&GridLevel> {
        self.check_level(level)?;
        Ok(&self.levels[level])
    }

    /// Mutable level `level`
    pub fn level_mut(&mut self, level: usize) -> Result<&mut GridLevel> {
        self.check_level(level)?;
        Ok(&mut self.levels[level])
    }

    /// Level `fine - 1` and level `fine`, both mutable
    pub fn levels_pair_mut(&mut self, fine: usize) -> Result<(&mut GridLevel, &mut GridLevel)> {
        self.check_level(fine)?;
        if fine == 0 {
            return Err(MgError::NoSuchLevel {
                level: 0,
                top: self.top_level(),
            });
        }
        let (lo, hi) = self.levels.split_at_mut(fine);
        Ok((&mut lo[fine - 1], &mut hi[0]))
    }

    /// Communicator of this processor
    #[inline]
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Whether more than one processor takes part
    #[inline]
    pub fn is_distributed(&self) -> bool {
        self.comm.size() > 1
    }

    /// Component pool
    #[inline]
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Allocate a vector descriptor with `counts[t]` components per type
    pub fn create_vec_desc(
        &mut self,
        name: &str,
        counts: [usize; NUM_GEOM_TYPES],
    ) -> Result<VecDesc> {
        if let Some(&n) = counts.iter().find(|&&n| n > MAX_BLOCK_SIZE) {
            log::error!("{}: {} components exceed the block bound {}", name, n, MAX_BLOCK_SIZE);
            return Err(MgError::BlockTooLarge {
                matrix: name.to_string(),
                size: n,
                max: MAX_BLOCK_SIZE,
            });
        }
        let comps = self.pool.lock().alloc_vec(counts)?;
        self.grow_storage();
        Ok(VecDesc::new(name, comps))
    }

    /// Allocate a matrix descriptor mapping `cols`-shaped vectors to
    /// `rows`-shaped vectors
    pub fn create_mat_desc(
        &mut self,
        name: &str,
        rows: &VecDesc,
        cols: &VecDesc,
    ) -> Result<MatDesc> {
        let mut blocks: [[Option<MatBlock>; NUM_GEOM_TYPES]; NUM_GEOM_TYPES] = Default::default();
        let mut taken: Vec<(GeomType, GeomType, Vec<usize>)> = Vec::new();
        let mut pool = self.pool.lock();
        for rt in rows.defined_types() {
            for ct in cols.defined_types() {
                let (r, c) = (rows.ncomp(rt), cols.ncomp(ct));
                match pool.alloc_mat(rt, ct, r * c) {
                    Ok(comps) => {
                        taken.push((rt, ct, comps.clone()));
                        blocks[rt.index()][ct.index()] = Some(MatBlock::new(r, c, comps));
                    }
                    Err(e) => {
                        for (rt, ct, comps) in &taken {
                            pool.free_mat(*rt, *ct, comps);
                        }
                        return Err(e);
                    }
                }
            }
        }
        drop(pool);
        self.grow_storage();
        Ok(MatDesc::new(name, blocks))
    }

    /// Return the components of a descriptor to the pool
    pub fn free_vec_desc(&mut self, x: VecDesc) {
        self.pool.lock().free_vec(x.all_components());
    }

    /// Return the components of a matrix descriptor to the pool
    pub fn free_mat_desc(&mut self, a: MatDesc) {
        let mut pool = self.pool.lock();
        for (rt, ct, b) in a.defined_blocks() {
            pool.free_mat(rt, ct, b.components());
        }
    }

    /// Temporary vector shaped like `template`, released when dropped
    pub fn alloc_temp_vector(&mut self, template: &VecDesc) -> Result<TempVector> {
        let mut counts = [0; NUM_GEOM_TYPES];
        for t in GeomType::ALL {
            counts[t.index()] = template.ncomp(t);
        }
        let comps = self.pool.lock().alloc_vec(counts)?;
        self.grow_storage();
        let name = format!("{}~tmp", template.name());
        Ok(TempVector::new(VecDesc::new(name, comps), Arc::clone(&self.pool)))
    }

    /// Append a vector of type `gtype` to `level` with a fresh global id
    pub fn add_vector(&mut self, level: usize, gtype: GeomType) -> Result<usize> {
        let gid = self.next_gid;
        self.add_vector_with_gid(level, gtype, gid)
    }

    /// Append a vector with an explicit global id shared with its replicas
    pub fn add_vector_with_gid(
        &mut self,
        level: usize,
        gtype: GeomType,
        gid: u64,
    ) -> Result<usize> {
        self.check_level(level)?;
        self.next_gid = self.next_gid.max(gid + 1);
        let (vw, mw) = {
            let pool = self.pool.lock();
            (pool.vec_width(gtype), pool.mat_width(gtype, gtype))
        };
        let grid = &mut self.levels[level];
        let index = grid.vectors.len();
        grid.vectors.push(Vector::new(gtype, index, gid, vw));
        grid.matrix.push_row(mw);
        Ok(index)
    }

    /// Create the connection `(i, j)` / `(j, i)` on `level`
    pub fn connect(&mut self, level: usize, i: usize, j: usize) -> Result<()> {
        self.check_level(level)?;
        let grid = &mut self.levels[level];
        let len = grid.vectors.len();
        for k in [i, j] {
            if k >= len {
                return Err(MgError::NoSuchVector { level, index: k, len });
            }
        }
        if i == j {
            return Ok(());
        }
        let (ti, tj) = (grid.vectors[i].gtype(), grid.vectors[j].gtype());
        let pool = self.pool.lock();
        grid.matrix.ensure_entry(i, j, pool.mat_width(ti, tj));
        grid.matrix.ensure_entry(j, i, pool.mat_width(tj, ti));
        Ok(())
    }

    fn grow_storage(&mut self) {
        let pool = self.pool.lock();
        for grid in &mut self.levels {
            let types: Vec<GeomType> = grid.vectors.iter().map(Vector::gtype).collect();
            for v in &mut grid.vectors {
                v.grow(pool.vec_width(v.gtype()));
            }
            grid.matrix
                .grow_entries(|i, j| pool.mat_width(types[i], types[j]));
        }
    }
}
