//! # Data Module
//!
//! In-memory representations of the inputs to a likelihood evaluation:
//! the tree topology and the observed character matrix.
//!
//! ## Design Philosophy
//! - **Zero-cost newtypes:** `NodeIdx` keeps node ids apart from site,
//!   state and mixture indices at compile time.
//! - **Immutable after construction:** both `Tree` and `CharacterMatrix`
//!   validate once when built; the engine trusts them afterwards.
//! - **Enum-based observations:** `Observation` replaces bit-packed state
//!   codes with a small stack-allocated enum.

pub mod characters;
pub mod tree;

pub use characters::{CharacterMatrix, Observation, StateSet};
pub use tree::Tree;

/// Node identifier (0-based index into the tree's node table)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub u32);

impl NodeIdx {
    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeIdx {
    fn from(idx: u32) -> Self {
        Self(idx)
    }
}

impl From<usize> for NodeIdx {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

impl From<NodeIdx> for usize {
    fn from(idx: NodeIdx) -> usize {
        idx.0 as usize
    }
}
