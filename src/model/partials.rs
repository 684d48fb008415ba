//! # Partial Likelihood Buffer Manager
//!
//! ## Role
//! Owns the conditional likelihood tensor `L[buffer][node][mixture][site][state]`
//! and the scaling tensor `S[buffer][node][mixture][site]`.
//!
//! ## Layout
//! An arena of [`NodeSlot`]s addressed by `buffer * n_nodes + node`. Each slot
//! stores its state vectors as `[f64; N]` in 32-byte aligned memory, laid out
//! mixture-major so one mixture's sites are contiguous.
//!
//! ## Double Buffering
//! Every node has an active buffer. `touch` moves a node to its spare
//! buffer (once per propose cycle) and marks it stale; `keep` accepts the
//! new values; `restore` moves every touched node back to the buffer that
//! still holds the accepted values. A slot remembers whether it holds
//! computed values, so restoring to a never-computed slot leaves the node
//! stale.

use aligned_vec::{AVec, ConstAlign};

use crate::data::NodeIdx;

/// Storage for one node in one buffer
#[derive(Debug, Clone)]
pub struct NodeSlot<const N: usize> {
    /// [mixture][site] state vectors
    pub(crate) partials: AVec<[f64; N], ConstAlign<32>>,
    /// [mixture][site] natural-log scaling values
    pub(crate) scaling: Vec<f64>,
}

impl<const N: usize> NodeSlot<N> {
    fn new(len: usize) -> Self {
        Self {
            partials: AVec::from_iter(32, std::iter::repeat([0.0; N]).take(len)),
            scaling: vec![0.0; len],
        }
    }

    fn empty() -> Self {
        Self {
            partials: AVec::new(32),
            scaling: Vec::new(),
        }
    }

    pub fn partials(&self) -> &[[f64; N]] {
        &self.partials
    }

    pub fn scaling(&self) -> &[f64] {
        &self.scaling
    }

    /// Sites of one mixture category.
    pub fn mixture_partials(&self, mixture: usize, n_sites: usize) -> &[[f64; N]] {
        &self.partials[mixture * n_sites..(mixture + 1) * n_sites]
    }

    pub fn mixture_scaling(&self, mixture: usize, n_sites: usize) -> &[f64] {
        &self.scaling[mixture * n_sites..(mixture + 1) * n_sites]
    }
}

#[derive(Debug, Clone)]
pub struct PartialBuffers<const N: usize> {
    n_nodes: usize,
    n_mixtures: usize,
    n_sites: usize,
    slots: Vec<NodeSlot<N>>,
    active: Vec<u8>,
    touched: Vec<bool>,
    /// [buffer][node]
    computed: Vec<bool>,
}

impl<const N: usize> PartialBuffers<N> {
    /// Allocate both buffers for every node. Nothing is computed yet.
    pub fn new(n_nodes: usize, n_mixtures: usize, n_sites: usize) -> Self {
        let len = n_mixtures * n_sites;
        Self {
            n_nodes,
            n_mixtures,
            n_sites,
            slots: (0..2 * n_nodes).map(|_| NodeSlot::new(len)).collect(),
            active: vec![0; n_nodes],
            touched: vec![false; n_nodes],
            computed: vec![false; 2 * n_nodes],
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_mixtures(&self) -> usize {
        self.n_mixtures
    }

    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    /// Bytes held by partial and scaling storage across both buffers.
    pub fn memory_bytes(&self) -> usize {
        let per_slot = self.n_mixtures * self.n_sites * (N + 1) * std::mem::size_of::<f64>();
        per_slot * self.slots.len()
    }

    #[inline]
    fn slot_index(&self, buffer: usize, node: usize) -> usize {
        buffer * self.n_nodes + node
    }

    #[inline]
    fn active_index(&self, node: NodeIdx) -> usize {
        let n = node.as_usize();
        self.slot_index(self.active[n] as usize, n)
    }

    pub fn active_buffer(&self, node: NodeIdx) -> usize {
        self.active[node.as_usize()] as usize
    }

    /// Mark a node stale, flipping to its spare buffer the first time in a cycle.
    pub fn touch(&mut self, node: NodeIdx) {
        let n = node.as_usize();
        if !self.touched[n] {
            self.active[n] ^= 1;
            self.touched[n] = true;
        }
        let idx = self.active_index(node);
        self.computed[idx] = false;
    }

    pub fn touch_all(&mut self) {
        for n in 0..self.n_nodes {
            self.touch(NodeIdx::from(n));
        }
    }

    /// Accept the current values of every node.
    pub fn keep(&mut self) {
        self.touched.fill(false);
    }

    /// Return touched nodes to the buffers holding the accepted values.
    pub fn restore(&mut self) {
        for n in 0..self.n_nodes {
            if std::mem::replace(&mut self.touched[n], false) {
                self.active[n] ^= 1;
            }
        }
    }

    #[inline]
    pub fn is_dirty(&self, node: NodeIdx) -> bool {
        !self.computed[self.active_index(node)]
    }

    pub fn n_dirty(&self) -> usize {
        (0..self.n_nodes)
            .filter(|&n| self.is_dirty(NodeIdx::from(n)))
            .count()
    }

    #[inline]
    pub fn active_slot(&self, node: NodeIdx) -> &NodeSlot<N> {
        &self.slots[self.active_index(node)]
    }

    /// Move the active slot out so it can be written while children are read.
    pub(crate) fn take_active(&mut self, node: NodeIdx) -> NodeSlot<N> {
        let idx = self.active_index(node);
        self.computed[idx] = false;
        std::mem::replace(&mut self.slots[idx], NodeSlot::empty())
    }

    /// Put a slot back and record whether it now holds valid values.
    pub(crate) fn put_active(&mut self, node: NodeIdx, slot: NodeSlot<N>, computed: bool) {
        let idx = self.active_index(node);
        self.slots[idx] = slot;
        self.computed[idx] = computed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_alignment() {
        let buffers = PartialBuffers::<4>::new(3, 2, 5);
        let slot = buffers.active_slot(NodeIdx(1));
        assert_eq!(slot.partials().len(), 10);
        assert_eq!(slot.scaling().len(), 10);
        assert_eq!(slot.partials().as_ptr() as usize % 32, 0);
        assert_eq!(slot.mixture_partials(1, 5).len(), 5);
        assert_eq!(buffers.memory_bytes(), 6 * 10 * 5 * 8);
    }

    #[test]
    fn test_everything_starts_dirty() {
        let buffers = PartialBuffers::<4>::new(3, 1, 2);
        assert_eq!(buffers.n_dirty(), 3);
    }

    #[test]
    fn test_touch_flips_once_per_cycle() {
        let mut b = PartialBuffers::<4>::new(2, 1, 1);
        let node = NodeIdx(0);
        b.touch(node);
        assert_eq!(b.active_buffer(node), 1);
        b.touch(node);
        assert_eq!(b.active_buffer(node), 1);
        b.keep();
        b.touch(node);
        assert_eq!(b.active_buffer(node), 0);
    }

    #[test]
    fn test_restore_returns_to_computed_slot() {
        let mut b = PartialBuffers::<2>::new(1, 1, 1);
        let node = NodeIdx(0);

        let mut slot = b.take_active(node);
        slot.partials[0] = [0.25, 0.75];
        b.put_active(node, slot, true);
        b.keep();
        assert!(!b.is_dirty(node));

        b.touch(node);
        assert!(b.is_dirty(node));
        let mut slot = b.take_active(node);
        slot.partials[0] = [0.5, 0.5];
        b.put_active(node, slot, true);

        b.restore();
        assert!(!b.is_dirty(node));
        assert_eq!(b.active_slot(node).partials()[0], [0.25, 0.75]);
    }

    #[test]
    fn test_restore_before_first_keep_stays_dirty() {
        let mut b = PartialBuffers::<4>::new(2, 1, 1);
        b.touch_all();
        b.restore();
        assert_eq!(b.n_dirty(), 2);
    }
}
