//! # Likelihood Engine
//!
//! ## Role
//! Felsenstein pruning over a fixed tree: tips are initialized from the
//! character data, internal nodes are combined in post-order, and the
//! root is finalized into a single log-likelihood.
//!
//! ## Incremental Evaluation
//! Only nodes whose active buffer is stale are recomputed. Callers mark
//! what changed with [`LikelihoodEngine::touch_branch`],
//! [`LikelihoodEngine::touch_node`] or [`LikelihoodEngine::touch_all`], then
//! accept with [`LikelihoodEngine::keep`] or roll back with
//! [`LikelihoodEngine::restore`].
//!
//! ## Rejections vs Errors
//! A parameter state the model cannot describe (missing transition matrix,
//! invalid root frequencies or mixture, zero or NaN likelihood) evaluates to
//! `f64::NEG_INFINITY`. Inputs that do not fit the engine (wrong tree size,
//! wrong mixture count) are errors.

use std::marker::PhantomData;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::instrument;

use crate::config::{CachingStrategy, LikelihoodSettings};
use crate::data::{CharacterMatrix, NodeIdx, Tree};
use crate::error::{FelsenError, Result};
use crate::model::combine::{combine_node, rescale_across_mixtures, BlockStats, CombineInputs};
use crate::model::kernel::{LikelihoodKernel, ScalarKernel};
use crate::model::partials::{NodeSlot, PartialBuffers};
use crate::model::scaling::ScalingPolicy;
use crate::model::site_mixture::{RootFrequencies, SiteMixture};
use crate::model::tips::{gap_mask, initialize_tip};
use crate::model::transition::{TransitionMatrix, TransitionProbabilities};
use crate::utils::telemetry::EvalCounters;
use crate::utils::workspace::EvalWorkspace;

pub struct LikelihoodEngine<const N: usize, K: LikelihoodKernel<N> = ScalarKernel> {
    data: Arc<CharacterMatrix>,
    /// Character-matrix row for each tip node.
    tip_rows: Vec<Option<usize>>,
    /// Gap flags per tip row, for per-node scaling.
    tip_gaps: Vec<Vec<bool>>,
    n_mixtures: usize,
    buffers: PartialBuffers<N>,
    settings: LikelihoodSettings,
    policy: ScalingPolicy,
    workspace: EvalWorkspace,
    counters: Arc<EvalCounters>,
    _kernel: PhantomData<K>,
}

impl<const N: usize, K: LikelihoodKernel<N>> LikelihoodEngine<N, K> {
    /// Allocate an engine for `tree` and `data` with `n_mixtures` rate categories.
    ///
    /// Tips are matched to alignment rows by name when the tree names its
    /// tips, otherwise the k-th tip (in node order) reads row k.
    pub fn new(
        tree: &Tree,
        data: Arc<CharacterMatrix>,
        n_mixtures: usize,
        settings: LikelihoodSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if data.n_states() != N {
            return Err(FelsenError::invalid_data(format!(
                "alignment has {} states, engine expects {}",
                data.n_states(),
                N
            )));
        }
        if n_mixtures == 0 {
            return Err(FelsenError::invalid_data("at least one mixture category is required"));
        }

        let tip_rows = map_tips(tree, &data)?;
        let tip_gaps = (0..data.n_taxa()).map(|t| gap_mask(data.row(t))).collect();
        let n_sites = data.n_sites();

        tracing::debug!(
            nodes = tree.n_nodes(),
            sites = n_sites,
            mixtures = n_mixtures,
            kernel = K::NAME,
            "allocating likelihood engine"
        );

        Ok(Self {
            tip_rows,
            tip_gaps,
            n_mixtures,
            buffers: PartialBuffers::new(tree.n_nodes(), n_mixtures, n_sites),
            policy: ScalingPolicy::new(&settings),
            settings,
            workspace: EvalWorkspace::new(n_sites),
            counters: EvalCounters::new(),
            data,
            _kernel: PhantomData,
        })
    }

    /// Report into a shared set of counters instead of this engine's own.
    pub fn with_counters(mut self, counters: Arc<EvalCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn settings(&self) -> &LikelihoodSettings {
        &self.settings
    }

    pub fn counters(&self) -> &Arc<EvalCounters> {
        &self.counters
    }

    pub fn data(&self) -> &Arc<CharacterMatrix> {
        &self.data
    }

    pub fn n_mixtures(&self) -> usize {
        self.n_mixtures
    }

    pub fn buffers(&self) -> &PartialBuffers<N> {
        &self.buffers
    }

    /// Per-site log-likelihoods of the latest evaluation, before site weights.
    pub fn site_log_likelihoods(&self) -> &[f64] {
        &self.workspace.site_ln_likelihoods
    }

    /// A node's own data or children changed: it and its ancestors are stale.
    pub fn touch_node(&mut self, tree: &Tree, node: NodeIdx) {
        for n in tree.path_to_root(node) {
            self.buffers.touch(n);
        }
    }

    /// The branch above `node` changed.
    ///
    /// Edge-conditioned buffers include the branch, so the node itself is
    /// stale. Node-conditioned buffers do not, so only the parent path is.
    pub fn touch_branch(&mut self, tree: &Tree, node: NodeIdx) {
        match self.settings.caching {
            CachingStrategy::EdgeConditioned => self.touch_node(tree, node),
            CachingStrategy::NodeConditioned => {
                if let Some(parent) = tree.parent(node) {
                    self.touch_node(tree, parent);
                }
            }
        }
    }

    /// Every branch changed (new rate matrix or new category rates).
    ///
    /// Under node-conditioned caching the tips hold raw observations and
    /// stay valid.
    pub fn touch_branches(&mut self, tree: &Tree) {
        match self.settings.caching {
            CachingStrategy::EdgeConditioned => self.buffers.touch_all(),
            CachingStrategy::NodeConditioned => {
                for &node in tree.post_order() {
                    if !tree.is_tip(node) {
                        self.buffers.touch(node);
                    }
                }
            }
        }
    }

    /// Root frequencies changed.
    pub fn touch_root(&mut self, tree: &Tree) {
        self.buffers.touch(tree.root());
    }

    pub fn touch_all(&mut self) {
        self.buffers.touch_all();
    }

    /// Accept the current state.
    pub fn keep(&mut self) {
        self.buffers.keep();
        self.workspace.keep();
    }

    /// Roll back to the last accepted state.
    pub fn restore(&mut self) {
        self.buffers.restore();
        self.workspace.restore();
    }

    /// Total log-likelihood for the current parameters.
    #[instrument(skip_all, fields(kernel = K::NAME, dirty = tracing::field::Empty))]
    pub fn evaluate<P>(
        &mut self,
        tree: &Tree,
        transitions: &P,
        root_frequencies: &RootFrequencies<N>,
        mixture: &SiteMixture,
    ) -> Result<f64>
    where
        P: TransitionProbabilities<N> + ?Sized,
    {
        if tree.n_nodes() != self.buffers.n_nodes() {
            return Err(FelsenError::algorithm(format!(
                "tree has {} nodes, engine was built for {}",
                tree.n_nodes(),
                self.buffers.n_nodes()
            )));
        }
        if mixture.n_categories() != self.n_mixtures {
            return Err(FelsenError::algorithm(format!(
                "mixture has {} categories, engine was built for {}",
                mixture.n_categories(),
                self.n_mixtures
            )));
        }
        self.counters.record_evaluation();
        if !mixture.is_valid() || !root_frequencies.is_valid() {
            return Ok(self.reject());
        }

        tracing::Span::current().record("dirty", self.buffers.n_dirty());

        let mut recomputed = 0u64;
        let mut rescaled = 0u64;
        for &node in tree.post_order() {
            if !self.buffers.is_dirty(node) {
                continue;
            }
            let stats = if tree.is_tip(node) {
                self.compute_tip(node, transitions)
            } else {
                self.compute_internal(tree, node, transitions, root_frequencies)
            };
            recomputed += 1;
            match stats {
                Some(stats) if !stats.degenerate => rescaled += stats.rescaled,
                _ => {
                    self.counters.add_nodes_recomputed(recomputed);
                    self.counters.add_rescaled(rescaled);
                    return Ok(self.reject());
                }
            }
        }
        self.counters.add_nodes_recomputed(recomputed);
        self.counters.add_rescaled(rescaled);

        let ln_l = self.finalize_root(tree.root(), mixture);
        if ln_l.is_nan() || ln_l == f64::NEG_INFINITY {
            return Ok(self.reject());
        }
        Ok(ln_l)
    }

    fn reject(&self) -> f64 {
        self.counters.record_rejection();
        f64::NEG_INFINITY
    }

    /// `None` when a branch matrix is missing.
    fn compute_tip<P>(&mut self, node: NodeIdx, transitions: &P) -> Option<BlockStats>
    where
        P: TransitionProbabilities<N> + ?Sized,
    {
        let row_idx = self.tip_rows[node.as_usize()]?;
        let matrices: Vec<&TransitionMatrix<N>> = match self.settings.caching {
            CachingStrategy::EdgeConditioned => (0..self.n_mixtures)
                .map(|m| transitions.matrix(node, m))
                .collect::<Option<_>>()?,
            CachingStrategy::NodeConditioned => Vec::new(),
        };

        let tested = self.policy.tests_node(node);
        let rescale = (tested && self.policy.per_mixture()).then_some(self.policy);
        let row = self.data.row(row_idx);

        let mut slot = self.buffers.take_active(node);
        let mut stats =
            initialize_tip::<N, K>(&mut slot, row, &matrices, rescale, self.settings.parallel);
        if tested && !self.policy.per_mixture() {
            stats = stats
                + rescale_across_mixtures(
                    &mut slot,
                    self.n_mixtures,
                    row.len(),
                    &self.policy,
                    Some(&self.tip_gaps[row_idx]),
                );
        }
        self.buffers.put_active(node, slot, !stats.degenerate);
        Some(stats)
    }

    fn compute_internal<P>(
        &mut self,
        tree: &Tree,
        node: NodeIdx,
        transitions: &P,
        root_frequencies: &RootFrequencies<N>,
    ) -> Option<BlockStats>
    where
        P: TransitionProbabilities<N> + ?Sized,
    {
        let children = tree.children(node);
        let is_root = tree.is_root(node);

        // [mixture][k] matrices, see CombineInputs
        let mut matrices: Vec<&TransitionMatrix<N>> = Vec::new();
        match self.settings.caching {
            CachingStrategy::EdgeConditioned if is_root => {}
            CachingStrategy::EdgeConditioned => {
                for m in 0..self.n_mixtures {
                    matrices.push(transitions.matrix(node, m)?);
                }
            }
            CachingStrategy::NodeConditioned => {
                for m in 0..self.n_mixtures {
                    for &child in children {
                        matrices.push(transitions.matrix(child, m)?);
                    }
                }
            }
        }

        let tested = self.policy.tests_node(node);
        let n_sites = self.buffers.n_sites();
        let mut slot = self.buffers.take_active(node);
        let mut stats = {
            let child_slots: Vec<&NodeSlot<N>> =
                children.iter().map(|&c| self.buffers.active_slot(c)).collect();
            let inputs = CombineInputs {
                children: &child_slots,
                matrices: &matrices,
                root_frequencies: is_root.then_some(root_frequencies),
                caching: self.settings.caching,
                rescale: (tested && self.policy.per_mixture()).then_some(self.policy),
                n_sites,
            };
            combine_node::<N, K>(&mut slot, &inputs, self.settings.parallel)
        };
        if tested && !self.policy.per_mixture() {
            stats = stats
                + rescale_across_mixtures(&mut slot, self.n_mixtures, n_sites, &self.policy, None);
        }
        self.buffers.put_active(node, slot, !stats.degenerate);
        Some(stats)
    }

    /// Sum the root vectors, mix categories in log space and add up sites.
    fn finalize_root(&mut self, root: NodeIdx, mixture: &SiteMixture) -> f64 {
        let n_sites = self.buffers.n_sites();
        let n_mixtures = self.n_mixtures;
        let slot = self.buffers.active_slot(root);
        let ln_weights: Vec<f64> = mixture.weights().iter().map(|w| w.ln()).collect();
        let site_weights = self.data.site_weights();

        let site_ln = |s: usize| -> f64 {
            if site_weights[s] == 0.0 {
                return 0.0;
            }
            let term = |m: usize| -> f64 {
                let i = m * n_sites + s;
                let sum: f64 = slot.partials[i].iter().sum();
                if sum > 0.0 && sum.is_finite() {
                    sum.ln() + slot.scaling[i] + ln_weights[m]
                } else {
                    f64::NEG_INFINITY
                }
            };
            log_sum_exp((0..n_mixtures).map(term))
        };

        let out = &mut self.workspace.site_ln_likelihoods;
        if self.settings.parallel {
            out.par_iter_mut()
                .enumerate()
                .for_each(|(s, x)| *x = site_ln(s));
        } else {
            for (s, x) in out.iter_mut().enumerate() {
                *x = site_ln(s);
            }
        }

        let mut total = 0.0;
        for (&ln, &w) in out.iter().zip(site_weights) {
            if w != 0.0 {
                total += w * ln;
            }
        }
        total
    }
}

/// `ln Σ exp(x_i)`, negative infinity when every term is.
pub fn log_sum_exp(terms: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = terms.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || !max.is_finite() {
        return max;
    }
    let sum: f64 = terms.map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

fn map_tips(tree: &Tree, data: &CharacterMatrix) -> Result<Vec<Option<usize>>> {
    let mut rows = vec![None; tree.n_nodes()];
    let named = tree.tips().iter().filter(|&&t| tree.name(t).is_some()).count();

    if named == tree.n_tips() {
        for &tip in tree.tips() {
            let name = tree.name(tip).unwrap_or_default();
            let row = data.taxon_index(name).ok_or_else(|| {
                FelsenError::invalid_data(format!("taxon {} is not in the alignment", name))
            })?;
            rows[tip.as_usize()] = Some(row);
        }
        if data.n_taxa() > tree.n_tips() {
            tracing::warn!(
                unused = data.n_taxa() - tree.n_tips(),
                "alignment has taxa that are not in the tree"
            );
        }
    } else if named == 0 {
        if data.n_taxa() != tree.n_tips() {
            return Err(FelsenError::invalid_data(format!(
                "tree has {} unnamed tips but the alignment has {} taxa",
                tree.n_tips(),
                data.n_taxa()
            )));
        }
        for (k, &tip) in tree.tips().iter().enumerate() {
            rows[tip.as_usize()] = Some(k);
        }
    } else {
        return Err(FelsenError::invalid_data("some tips are named and some are not"));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observation;
    use crate::model::rate_matrix::RateMatrix;
    use crate::model::transition::FixedTransitions;

    fn two_taxon(length: f64) -> Tree {
        Tree::from_parents(&[Some(2), Some(2), None], &[length, length, 0.0]).unwrap()
    }

    fn evaluate(tree: &Tree, data: CharacterMatrix, settings: LikelihoodSettings) -> f64 {
        let mix = SiteMixture::single();
        let q = RateMatrix::jc69();
        let p = FixedTransitions::from_rate_matrix(tree, &q, &mix);
        let mut engine = LikelihoodEngine::<4>::new(tree, Arc::new(data), 1, settings).unwrap();
        engine
            .evaluate(tree, &p, &RootFrequencies::uniform(), &mix)
            .unwrap()
    }

    #[test]
    fn test_identical_tips_short_branches() {
        let data = CharacterMatrix::from_dna(&[("a", "ACGT"), ("b", "ACGT")]).unwrap();
        let ln_l = evaluate(&two_taxon(1e-10), data, LikelihoodSettings::default());
        assert!((ln_l - 4.0 * 0.25f64.ln()).abs() < 1e-8);
    }

    #[test]
    fn test_all_gap_site_contributes_zero() {
        let data = CharacterMatrix::from_dna(&[("a", "-"), ("b", "-")]).unwrap();
        let ln_l = evaluate(&two_taxon(0.3), data, LikelihoodSettings::default());
        assert!(ln_l.abs() < 1e-12);
    }

    #[test]
    fn test_masked_site_skipped() {
        let data = CharacterMatrix::from_dna(&[("a", "AC"), ("b", "AG")]).unwrap();
        let full = evaluate(&two_taxon(0.1), data.clone(), LikelihoodSettings::default());
        let only_first = evaluate(
            &two_taxon(0.1),
            CharacterMatrix::from_dna(&[("a", "A"), ("b", "A")]).unwrap(),
            LikelihoodSettings::default(),
        );
        let mut masked = data;
        masked.mask_site(1).unwrap();
        let ln_masked = evaluate(&two_taxon(0.1), masked, LikelihoodSettings::default());
        assert!((ln_masked - only_first).abs() < 1e-12);
        assert!(full < ln_masked);
    }

    #[test]
    fn test_missing_matrix_rejects() {
        let tree = two_taxon(0.1);
        let data = CharacterMatrix::from_dna(&[("a", "A"), ("b", "C")]).unwrap();
        let mut engine =
            LikelihoodEngine::<4>::new(&tree, Arc::new(data), 1, LikelihoodSettings::default())
                .unwrap();
        let p = FixedTransitions::<4>::new(3, 1);
        let ln_l = engine
            .evaluate(&tree, &p, &RootFrequencies::uniform(), &SiteMixture::single())
            .unwrap();
        assert_eq!(ln_l, f64::NEG_INFINITY);
        assert_eq!(engine.counters().snapshot().rejections, 1);
    }

    #[test]
    fn test_invalid_root_frequencies_reject() {
        let tree = two_taxon(0.1);
        let data = CharacterMatrix::from_dna(&[("a", "A"), ("b", "C")]).unwrap();
        let mix = SiteMixture::single();
        let p = FixedTransitions::from_rate_matrix(&tree, &RateMatrix::jc69(), &mix);
        let mut engine =
            LikelihoodEngine::<4>::new(&tree, Arc::new(data), 1, LikelihoodSettings::default())
                .unwrap();
        let bad = RootFrequencies::shared([0.5, 0.5, 0.5, -0.5]);
        assert_eq!(
            engine.evaluate(&tree, &p, &bad, &mix).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_wrong_mixture_count_is_error() {
        let tree = two_taxon(0.1);
        let data = CharacterMatrix::from_dna(&[("a", "A"), ("b", "C")]).unwrap();
        let mix = SiteMixture::equal_weights(vec![0.5, 1.5]).unwrap();
        let p = FixedTransitions::from_rate_matrix(&tree, &RateMatrix::jc69(), &mix);
        let mut engine =
            LikelihoodEngine::<4>::new(&tree, Arc::new(data), 1, LikelihoodSettings::default())
                .unwrap();
        assert!(engine
            .evaluate(&tree, &p, &RootFrequencies::uniform(), &mix)
            .is_err());
    }

    #[test]
    fn test_state_space_mismatch_is_error() {
        let tree = two_taxon(0.1);
        let rows = vec![vec![Observation::State(0)], vec![Observation::State(1)]];
        let data = CharacterMatrix::new(2, vec!["a".into(), "b".into()], rows).unwrap();
        assert!(
            LikelihoodEngine::<4>::new(&tree, Arc::new(data), 1, LikelihoodSettings::default())
                .is_err()
        );
    }

    #[test]
    fn test_tip_mapping_by_name() {
        let tree = two_taxon(0.1)
            .with_names(vec![Some("b".into()), Some("a".into()), None])
            .unwrap();
        let data = CharacterMatrix::from_dna(&[("a", "A"), ("b", "C")]).unwrap();
        let rows = map_tips(&tree, &data).unwrap();
        assert_eq!(rows, vec![Some(1), Some(0), None]);

        let missing = two_taxon(0.1)
            .with_names(vec![Some("b".into()), Some("z".into()), None])
            .unwrap();
        assert!(map_tips(&missing, &data).is_err());
    }

    #[test]
    fn test_log_sum_exp() {
        let v = [0.5f64.ln(), 0.25f64.ln()];
        assert!((log_sum_exp(v.iter().copied()) - 0.75f64.ln()).abs() < 1e-15);
        let none = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(log_sum_exp(none.iter().copied()), f64::NEG_INFINITY);
        let big = [-1000.0, -1000.0];
        assert!((log_sum_exp(big.iter().copied()) - (-1000.0 + 2f64.ln())).abs() < 1e-12);
    }
}
