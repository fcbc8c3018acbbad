//! Component storage pool and scoped temporary vectors
//!
//! Every vector of a multigrid stores its components in a flat buffer whose
//! slots are handed out per geometric type. Descriptors are carved from the
//! pool; temporaries return their slots when dropped, so a temporary taken
//! during PreProcess or inside a cycle is released on every exit path.

use crate::descriptor::{GeomType, NUM_GEOM_TYPES, VecDesc};
use crate::error::{MgError, Result};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// Slot bookkeeping for vector and matrix component storage.
#[derive(Debug, Clone)]
pub struct ComponentPool {
    capacity: usize,
    vec_used: [Vec<bool>; NUM_GEOM_TYPES],
    mat_used: [[Vec<bool>; NUM_GEOM_TYPES]; NUM_GEOM_TYPES],
}

impl ComponentPool {
    /// Pool with at most `capacity` vector components per type
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            vec_used: Default::default(),
            mat_used: Default::default(),
        }
    }

    /// Vector component capacity per type
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Storage width vectors of type `t` need
    pub fn vec_width(&self, t: GeomType) -> usize {
        self.vec_used[t.index()].len()
    }

    /// Storage width entries of type pair `(rt, ct)` need
    pub fn mat_width(&self, rt: GeomType, ct: GeomType) -> usize {
        self.mat_used[rt.index()][ct.index()].len()
    }

    /// Number of vector slots of type `t` currently in use
    pub fn vec_in_use(&self, t: GeomType) -> usize {
        self.vec_used[t.index()].iter().filter(|u| **u).count()
    }

    /// Reserve `counts[t]` vector slots per type.
    ///
    /// Either every type is served or nothing is reserved.
    pub fn alloc_vec(
        &mut self,
        counts: [usize; NUM_GEOM_TYPES],
    ) -> Result<[Vec<usize>; NUM_GEOM_TYPES]> {
        let capacity = self.capacity;
        for t in GeomType::ALL {
            let free = capacity - self.vec_in_use(t);
            if counts[t.index()] > free {
                return Err(MgError::Allocation {
                    what: format!("{} vector components", t),
                    requested: counts[t.index()],
                    capacity: free,
                });
            }
        }
        let mut comps: [Vec<usize>; NUM_GEOM_TYPES] = Default::default();
        for t in GeomType::ALL {
            comps[t.index()] = take_slots(&mut self.vec_used[t.index()], counts[t.index()]);
        }
        Ok(comps)
    }

    /// Return vector slots
    pub fn free_vec(&mut self, comps: &[Vec<usize>; NUM_GEOM_TYPES]) {
        for t in GeomType::ALL {
            for &c in &comps[t.index()] {
                if let Some(slot) = self.vec_used[t.index()].get_mut(c) {
                    *slot = false;
                }
            }
        }
    }

    /// Reserve `n` matrix slots for the type pair `(rt, ct)`
    pub fn alloc_mat(&mut self, rt: GeomType, ct: GeomType, n: usize) -> Result<Vec<usize>> {
        let used = &mut self.mat_used[rt.index()][ct.index()];
        let capacity = self.capacity * self.capacity;
        let free = capacity - used.iter().filter(|u| **u).count();
        if n > free {
            return Err(MgError::Allocation {
                what: format!("({}, {}) matrix components", rt, ct),
                requested: n,
                capacity: free,
            });
        }
        Ok(take_slots(used, n))
    }

    /// Return matrix slots
    pub fn free_mat(&mut self, rt: GeomType, ct: GeomType, comps: &[usize]) {
        let used = &mut self.mat_used[rt.index()][ct.index()];
        for &c in comps {
            if let Some(slot) = used.get_mut(c) {
                *slot = false;
            }
        }
    }
}

fn take_slots(used: &mut Vec<bool>, n: usize) -> Vec<usize> {
    let mut taken = Vec::with_capacity(n);
    for (c, slot) in used.iter_mut().enumerate() {
        if taken.len() == n {
            break;
        }
        if !*slot {
            *slot = true;
            taken.push(c);
        }
    }
    while taken.len() < n {
        taken.push(used.len());
        used.push(true);
    }
    taken
}

/// Shared handle to the pool of one multigrid.
pub type SharedPool = Arc<Mutex<ComponentPool>>;

/// Temporary vector descriptor, released back to the pool on drop.
#[derive(Debug)]
pub struct TempVector {
    desc: VecDesc,
    pool: SharedPool,
}

impl TempVector {
    pub(crate) fn new(desc: VecDesc, pool: SharedPool) -> Self {
        Self { desc, pool }
    }

    /// Descriptor of the temporary
    pub fn desc(&self) -> &VecDesc {
        &self.desc
    }
}

impl Deref for TempVector {
    type Target = VecDesc;

    fn deref(&self) -> &VecDesc {
        &self.desc
    }
}

impl Drop for TempVector {
    fn drop(&mut self) {
        self.pool.lock().free_vec(self.desc.all_components());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reuses_freed_slots() {
        let mut pool = ComponentPool::new(4);
        let a = pool.alloc_vec([2, 0, 0, 0]).unwrap();
        let b = pool.alloc_vec([1, 1, 0, 0]).unwrap();
        assert_eq!(a[0], vec![0, 1]);
        assert_eq!(b[0], vec![2]);
        assert_eq!(b[1], vec![0]);
        pool.free_vec(&a);
        let c = pool.alloc_vec([3, 0, 0, 0]).unwrap();
        assert_eq!(c[0], vec![0, 1, 3]);
        assert_eq!(pool.vec_width(GeomType::Node), 4);
    }

    #[test]
    fn test_alloc_failure_reserves_nothing() {
        let mut pool = ComponentPool::new(2);
        let err = pool.alloc_vec([1, 3, 0, 0]).unwrap_err();
        assert!(matches!(err, MgError::Allocation { requested: 3, .. }));
        assert_eq!(pool.vec_in_use(GeomType::Node), 0);
    }

    #[test]
    fn test_temp_vector_released_on_drop() {
        let pool: SharedPool = Arc::new(Mutex::new(ComponentPool::new(4)));
        let comps = pool.lock().alloc_vec([2, 0, 0, 0]).unwrap();
        {
            let t = TempVector::new(VecDesc::new("t", comps), Arc::clone(&pool));
            assert_eq!(t.ncomp(GeomType::Node), 2);
            assert_eq!(pool.lock().vec_in_use(GeomType::Node), 2);
        }
        assert_eq!(pool.lock().vec_in_use(GeomType::Node), 0);
    }
}
