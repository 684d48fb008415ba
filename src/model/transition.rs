//! # Transition Probabilities
//!
//! ## Role
//! Supplies the row-stochastic matrix `P(t)` for every (node, mixture) pair.
//! The engine only sees the [`TransitionProbabilities`] trait; the concrete
//! [`TransitionCache`] keeps two buffers per node so a rejected proposal can
//! fall back to the previous matrices without recomputing them.
//!
//! `None` from the provider means the branch has no valid matrix in the
//! current parameter state (negative length, broken rate matrix). The
//! engine turns that into a rejection, not an error.

use crate::data::{NodeIdx, Tree};
use crate::model::rate_matrix::RateMatrix;
use crate::model::site_mixture::SiteMixture;

/// Row-stochastic `N x N` matrix, kept in both row and column order.
///
/// The column copy feeds the column-broadcast SIMD kernel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransitionMatrix<const N: usize> {
    rows: [[f64; N]; N],
    columns: [[f64; N]; N],
}

impl<const N: usize> TransitionMatrix<N> {
    pub fn from_rows(rows: [[f64; N]; N]) -> Self {
        let mut columns = [[0.0; N]; N];
        for (r, row) in rows.iter().enumerate() {
            for (t, &p) in row.iter().enumerate() {
                columns[t][r] = p;
            }
        }
        Self { rows, columns }
    }

    pub fn identity() -> Self {
        let mut rows = [[0.0; N]; N];
        for (i, row) in rows.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self::from_rows(rows)
    }

    #[inline(always)]
    pub fn get(&self, from: usize, to: usize) -> f64 {
        self.rows[from][to]
    }

    #[inline(always)]
    pub fn row(&self, from: usize) -> &[f64; N] {
        &self.rows[from]
    }

    /// Probabilities of ending in `to` from every starting state.
    #[inline(always)]
    pub fn column(&self, to: usize) -> &[f64; N] {
        &self.columns[to]
    }

    pub fn rows(&self) -> &[[f64; N]; N] {
        &self.rows
    }

    /// Every entry in `[0, 1]` and every row summing to one within `tol`.
    pub fn is_row_stochastic(&self, tol: f64) -> bool {
        self.rows.iter().all(|row| {
            row.iter().all(|&p| (0.0..=1.0 + tol).contains(&p))
                && (row.iter().sum::<f64>() - 1.0).abs() <= tol
        })
    }
}

/// Source of branch transition matrices for the active parameter state.
pub trait TransitionProbabilities<const N: usize> {
    fn matrix(&self, node: NodeIdx, mixture: usize) -> Option<&TransitionMatrix<N>>;
}

/// Double-buffered per-node, per-mixture transition matrices.
#[derive(Debug, Clone)]
pub struct TransitionCache<const N: usize> {
    n_nodes: usize,
    n_mixtures: usize,
    /// [buffer][node][mixture]
    matrices: Vec<Option<TransitionMatrix<N>>>,
    active: Vec<u8>,
    /// Whether the active buffer of a node was flipped since the last keep/restore.
    touched: Vec<bool>,
    /// [buffer][node]: slot holds matrices for the parameters it was computed with.
    computed: Vec<bool>,
}

impl<const N: usize> TransitionCache<N> {
    pub fn new(n_nodes: usize, n_mixtures: usize) -> Self {
        Self {
            n_nodes,
            n_mixtures,
            matrices: vec![None; 2 * n_nodes * n_mixtures],
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

    #[inline]
    fn slot(&self, buffer: usize, node: usize) -> usize {
        buffer * self.n_nodes + node
    }

    /// Mark a node's matrices stale, switching to its spare buffer once per cycle.
    pub fn touch(&mut self, node: NodeIdx) {
        let n = node.as_usize();
        if !self.touched[n] {
            self.active[n] ^= 1;
            self.touched[n] = true;
        }
        let slot = self.slot(self.active[n] as usize, n);
        self.computed[slot] = false;
    }

    pub fn touch_all(&mut self) {
        for n in 0..self.n_nodes {
            self.touch(NodeIdx::from(n));
        }
    }

    /// Accept the current matrices.
    pub fn keep(&mut self) {
        self.touched.fill(false);
    }

    /// Return every touched node to the buffer it used before the proposal.
    pub fn restore(&mut self) {
        for n in 0..self.n_nodes {
            if std::mem::replace(&mut self.touched[n], false) {
                self.active[n] ^= 1;
            }
        }
    }

    pub fn is_dirty(&self, node: NodeIdx) -> bool {
        let n = node.as_usize();
        !self.computed[self.slot(self.active[n] as usize, n)]
    }

    /// Recompute the matrices of every stale branch from the rate matrix.
    ///
    /// Returns the number of branches recomputed.
    pub fn refresh(&mut self, tree: &Tree, rate_matrix: &RateMatrix<N>, mixture: &SiteMixture) -> usize {
        let mut refreshed = 0;
        for n in 0..self.n_nodes {
            let node = NodeIdx::from(n);
            if !self.is_dirty(node) {
                continue;
            }
            let buffer = self.active[n] as usize;
            let base = self.slot(buffer, n) * self.n_mixtures;
            if tree.is_root(node) {
                self.matrices[base..base + self.n_mixtures].fill(None);
            } else {
                let length = tree.branch_length(node);
                for m in 0..self.n_mixtures {
                    self.matrices[base + m] =
                        rate_matrix.transition_probabilities(length * mixture.rate(m));
                }
                refreshed += 1;
            }
            let slot = self.slot(buffer, n);
            self.computed[slot] = true;
        }
        refreshed
    }
}

impl<const N: usize> TransitionProbabilities<N> for TransitionCache<N> {
    #[inline]
    fn matrix(&self, node: NodeIdx, mixture: usize) -> Option<&TransitionMatrix<N>> {
        let n = node.as_usize();
        let base = self.slot(self.active[n] as usize, n) * self.n_mixtures;
        self.matrices.get(base + mixture)?.as_ref()
    }
}

/// Fixed matrices supplied directly by the caller, one per (node, mixture).
///
/// Useful when the matrices come from outside the crate's rate models.
#[derive(Debug, Clone)]
pub struct FixedTransitions<const N: usize> {
    n_mixtures: usize,
    matrices: Vec<Option<TransitionMatrix<N>>>,
}

impl<const N: usize> FixedTransitions<N> {
    pub fn new(n_nodes: usize, n_mixtures: usize) -> Self {
        Self {
            n_mixtures,
            matrices: vec![None; n_nodes * n_mixtures],
        }
    }

    pub fn set(&mut self, node: NodeIdx, mixture: usize, matrix: Option<TransitionMatrix<N>>) {
        self.matrices[node.as_usize() * self.n_mixtures + mixture] = matrix;
    }

    /// Matrices for every branch of `tree` under a single rate matrix.
    pub fn from_rate_matrix(tree: &Tree, rate_matrix: &RateMatrix<N>, mixture: &SiteMixture) -> Self {
        let mut fixed = Self::new(tree.n_nodes(), mixture.n_categories());
        for &node in tree.post_order() {
            if tree.is_root(node) {
                continue;
            }
            for m in 0..mixture.n_categories() {
                let t = tree.branch_length(node) * mixture.rate(m);
                fixed.set(node, m, rate_matrix.transition_probabilities(t));
            }
        }
        fixed
    }
}

impl<const N: usize> TransitionProbabilities<N> for FixedTransitions<N> {
    fn matrix(&self, node: NodeIdx, mixture: usize) -> Option<&TransitionMatrix<N>> {
        self.matrices
            .get(node.as_usize() * self.n_mixtures + mixture)?
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Tree {
        Tree::from_parents(&[Some(2), Some(2), None], &[0.1, 0.3, 0.0]).unwrap()
    }

    #[test]
    fn test_columns_are_transpose() {
        let p = TransitionMatrix::from_rows([[0.9, 0.1], [0.2, 0.8]]);
        assert_eq!(p.column(0), &[0.9, 0.2]);
        assert_eq!(p.column(1), &[0.1, 0.8]);
        assert!(p.is_row_stochastic(1e-12));
        assert!(!TransitionMatrix::from_rows([[0.5, 0.4], [0.0, 1.0]]).is_row_stochastic(1e-12));
    }

    #[test]
    fn test_cache_refresh_and_restore() {
        let mut tree = tree();
        let q = RateMatrix::jc69();
        let mix = SiteMixture::single();
        let mut cache = TransitionCache::<4>::new(3, 1);

        assert_eq!(cache.refresh(&tree, &q, &mix), 2);
        let before = *cache.matrix(NodeIdx(0), 0).unwrap();
        assert!(cache.matrix(NodeIdx(2), 0).is_none());
        cache.keep();

        tree.set_branch_length(NodeIdx(0), 0.5).unwrap();
        cache.touch(NodeIdx(0));
        assert!(cache.is_dirty(NodeIdx(0)));
        assert_eq!(cache.refresh(&tree, &q, &mix), 1);
        let after = *cache.matrix(NodeIdx(0), 0).unwrap();
        assert_ne!(before, after);

        cache.restore();
        assert!(!cache.is_dirty(NodeIdx(0)));
        assert_eq!(*cache.matrix(NodeIdx(0), 0).unwrap(), before);
    }

    #[test]
    fn test_negative_length_yields_none() {
        let mut tree = tree();
        tree.set_branch_length(NodeIdx(1), -0.1).unwrap();
        let mut cache = TransitionCache::<4>::new(3, 1);
        cache.refresh(&tree, &RateMatrix::jc69(), &SiteMixture::single());
        assert!(cache.matrix(NodeIdx(1), 0).is_none());
        assert!(cache.matrix(NodeIdx(0), 0).is_some());
    }

    #[test]
    fn test_restore_before_first_compute_stays_dirty() {
        let mut cache = TransitionCache::<4>::new(3, 1);
        cache.touch(NodeIdx(1));
        cache.restore();
        assert!(cache.is_dirty(NodeIdx(1)));
    }
}
