//! Processor interfaces of a grid level
//!
//! An interface is a fixed list of links, one per remote partner. A link
//! names the local vectors replicated on that partner, ordered by global id so
//! both sides pack and unpack their buffers in the same order.

use std::fmt;

/// Which replicas an interface connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// Master and border copies of boundary vectors, symmetric
    Border,
    /// Master copies towards ghost copies, one-directional
    Outer,
}

impl InterfaceKind {
    /// Name used in logs and exchange errors
    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::Border => "border",
            InterfaceKind::Outer => "outer",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Vectors shared with one partner processor.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceLink {
    partner: usize,
    vectors: Vec<usize>,
}

impl InterfaceLink {
    /// Rank of the partner
    #[inline]
    pub fn partner(&self) -> usize {
        self.partner
    }

    /// Local vector indices in exchange order
    #[inline]
    pub fn vectors(&self) -> &[usize] {
        &self.vectors
    }
}

/// Links of one interface, sorted by partner rank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interface {
    links: Vec<InterfaceLink>,
}

impl Interface {
    /// All links
    #[inline]
    pub fn links(&self) -> &[InterfaceLink] {
        &self.links
    }

    /// Whether the interface has no partner
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Add vectors already sorted into exchange order for `partner`.
    pub(crate) fn add_link(&mut self, partner: usize, vectors: Vec<usize>) {
        match self.links.binary_search_by_key(&partner, |l| l.partner) {
            Ok(pos) => {
                let link = &mut self.links[pos];
                for v in vectors {
                    if !link.vectors.contains(&v) {
                        link.vectors.push(v);
                    }
                }
            }
            Err(pos) => self.links.insert(pos, InterfaceLink { partner, vectors }),
        }
    }

    pub(crate) fn sort_links(&mut self, key: impl Fn(usize) -> u64) {
        for link in &mut self.links {
            link.vectors.sort_by_key(|&v| key(v));
        }
    }

    /// Number of copies of vector `v`, the local one included
    pub fn replica_count(&self, v: usize) -> usize {
        1 + self
            .links
            .iter()
            .filter(|l| l.vectors.contains(&v))
            .count()
    }

    /// Whether vector `v` appears in any link
    pub fn contains(&self, v: usize) -> bool {
        self.links.iter().any(|l| l.vectors.contains(&v))
    }
}

/// Interfaces declared for one level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelInterfaces {
    /// Symmetric master/border interface
    pub border: Interface,
    /// Master to ghost interface
    pub outer: Interface,
}

impl LevelInterfaces {
    /// Interface of the given kind
    pub fn get(&self, kind: InterfaceKind) -> &Interface {
        match kind {
            InterfaceKind::Border => &self.border,
            InterfaceKind::Outer => &self.outer,
        }
    }

    pub(crate) fn get_mut(&mut self, kind: InterfaceKind) -> &mut Interface {
        match kind {
            InterfaceKind::Border => &mut self.border,
            InterfaceKind::Outer => &mut self.outer,
        }
    }
}
