//! Degree-of-freedom vectors and their flags

use crate::descriptor::{GeomType, VecDesc};

/// Per-component lock mask of a vector (Dirichlet / skip components).
///
/// Bit `k` refers to the `k`-th component of whatever descriptor is applied
/// to the vector, not to a storage offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SkipMask(u64);

impl SkipMask {
    /// No component locked
    pub const EMPTY: SkipMask = SkipMask(0);

    /// Mask from raw bits
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask with the components in `comps` locked
    pub fn from_components(comps: &[usize]) -> Self {
        let mut mask = Self::EMPTY;
        for &c in comps {
            mask.lock(c);
        }
        mask
    }

    /// Raw bits
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Whether component `k` is locked
    #[inline]
    pub fn is_locked(self, k: usize) -> bool {
        k < 64 && self.0 & (1 << k) != 0
    }

    /// Lock component `k`
    #[inline]
    pub fn lock(&mut self, k: usize) {
        debug_assert!(k < 64);
        self.0 |= 1 << k;
    }

    /// Unlock component `k`
    #[inline]
    pub fn unlock(&mut self, k: usize) {
        if k < 64 {
            self.0 &= !(1 << k);
        }
    }

    /// Components locked in either mask
    #[inline]
    pub fn union(self, other: SkipMask) -> SkipMask {
        SkipMask(self.0 | other.0)
    }

    /// Whether no component is locked
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Replication role of a vector on a partition boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Owned copy; interior vectors are masters too
    #[default]
    Master,
    /// Non-owning copy that still carries matrix rows
    Border,
    /// Read-only overlap copy
    Ghost,
}

/// A degree-of-freedom node of one grid level.
#[derive(Debug, Clone)]
pub struct Vector {
    gtype: GeomType,
    index: usize,
    gid: u64,
    skip: SkipMask,
    priority: Priority,
    fine: bool,
    block: Option<usize>,
    pub(crate) values: Vec<f64>,
}

impl Vector {
    pub(crate) fn new(gtype: GeomType, index: usize, gid: u64, width: usize) -> Self {
        Self {
            gtype,
            index,
            gid,
            skip: SkipMask::EMPTY,
            priority: Priority::Master,
            fine: true,
            block: None,
            values: vec![0.0; width],
        }
    }

    /// Geometric type
    #[inline]
    pub fn gtype(&self) -> GeomType {
        self.gtype
    }

    /// Position on the level
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier shared by all replicas across processors
    #[inline]
    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Lock mask
    #[inline]
    pub fn skip(&self) -> SkipMask {
        self.skip
    }

    /// Replace the lock mask
    pub fn set_skip(&mut self, skip: SkipMask) {
        self.skip = skip;
    }

    /// Replication role
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Change the replication role
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Whether this copy is the owner
    #[inline]
    pub fn is_master(&self) -> bool {
        self.priority == Priority::Master
    }

    /// Whether the vector was created on its own level (no coarse father)
    #[inline]
    pub fn is_fine(&self) -> bool {
        self.fine
    }

    /// Mark the vector as created on its own level or inherited
    pub fn set_fine(&mut self, fine: bool) {
        self.fine = fine;
    }

    /// Blockvector the vector belongs to
    #[inline]
    pub fn block(&self) -> Option<usize> {
        self.block
    }

    pub(crate) fn set_block(&mut self, block: Option<usize>) {
        self.block = block;
    }

    /// Raw value at a storage offset
    #[inline]
    pub fn value(&self, offset: usize) -> f64 {
        self.values[offset]
    }

    /// Set the raw value at a storage offset
    #[inline]
    pub fn set_value(&mut self, offset: usize, value: f64) {
        self.values[offset] = value;
    }

    /// Components of descriptor `x` in order
    pub fn get(&self, x: &VecDesc) -> Vec<f64> {
        x.components(self.gtype)
            .iter()
            .map(|&c| self.values[c])
            .collect()
    }

    /// Write the components of descriptor `x`
    pub fn put(&mut self, x: &VecDesc, values: &[f64]) {
        for (&c, &v) in x.components(self.gtype).iter().zip(values) {
            self.values[c] = v;
        }
    }

    pub(crate) fn grow(&mut self, width: usize) {
        if self.values.len() < width {
            self.values.resize(width, 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_mask_accessors() {
        let mut mask = SkipMask::from_components(&[0, 2]);
        assert!(mask.is_locked(0));
        assert!(!mask.is_locked(1));
        assert!(mask.is_locked(2));
        mask.unlock(0);
        assert_eq!(mask.bits(), 0b100);
        let merged = mask.union(SkipMask::from_components(&[1]));
        assert_eq!(merged.bits(), 0b110);
        assert!(SkipMask::EMPTY.is_empty());
        assert!(!SkipMask::EMPTY.is_locked(70));
        // components past the mask width are never locked
        mask.unlock(70);
        assert_eq!(mask.bits(), 0b100);
    }

    #[test]
    fn test_vector_get_put() {
        let x = VecDesc::new("x", [vec![2, 0], vec![], vec![], vec![]]);
        let mut v = Vector::new(GeomType::Node, 0, 7, 3);
        v.put(&x, &[1.5, -2.0]);
        assert_eq!(v.value(2), 1.5);
        assert_eq!(v.value(0), -2.0);
        assert_eq!(v.get(&x), vec![1.5, -2.0]);
        assert_eq!(v.gid(), 7);
        assert!(v.is_master());
    }
}
