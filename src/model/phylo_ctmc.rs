//! # Phylogenetic CTMC
//!
//! ## Role
//! The sampler-facing model: owns the tree, the rate matrix, the site
//! mixture, the transition-matrix cache and the likelihood engine, and
//! exposes the propose / evaluate / accept / reject cycle of an MCMC move.
//!
//! Every setter records what it replaced. `accept` forgets the record,
//! `reject` puts the old values back and restores both double-buffered
//! caches, so the previous log-likelihood returns without recomputation.

use std::sync::Arc;

use crate::config::{KernelBackend, LikelihoodSettings};
use crate::data::{CharacterMatrix, NodeIdx, Tree};
use crate::error::{FelsenError, Result};
use crate::model::kernel::{LikelihoodKernel, ScalarKernel, WideKernel};
use crate::model::likelihood::LikelihoodEngine;
use crate::model::rate_matrix::RateMatrix;
use crate::model::site_mixture::{RootFrequencies, SiteMixture};
use crate::model::transition::TransitionCache;
use crate::utils::telemetry::EvalCounters;

/// Values replaced since the last accept.
#[derive(Debug, Clone)]
struct UndoLog<const N: usize> {
    branch_lengths: Vec<(NodeIdx, f64)>,
    rate_matrix: Option<RateMatrix<N>>,
    mixture: Option<SiteMixture>,
    root_frequencies: Option<Option<RootFrequencies<N>>>,
}

impl<const N: usize> Default for UndoLog<N> {
    fn default() -> Self {
        Self {
            branch_lengths: Vec::new(),
            rate_matrix: None,
            mixture: None,
            root_frequencies: None,
        }
    }
}

pub struct PhyloCtmc<const N: usize, K: LikelihoodKernel<N> = ScalarKernel> {
    tree: Tree,
    rate_matrix: RateMatrix<N>,
    mixture: SiteMixture,
    /// `None` uses the rate matrix's stationary frequencies.
    root_frequencies: Option<RootFrequencies<N>>,
    transitions: TransitionCache<N>,
    engine: LikelihoodEngine<N, K>,
    ln_probability: Option<f64>,
    stored_ln_probability: Option<f64>,
    undo: UndoLog<N>,
}

impl<const N: usize, K: LikelihoodKernel<N>> PhyloCtmc<N, K> {
    pub fn new(
        tree: Tree,
        data: Arc<CharacterMatrix>,
        rate_matrix: RateMatrix<N>,
        mixture: SiteMixture,
        settings: LikelihoodSettings,
    ) -> Result<Self> {
        let engine = LikelihoodEngine::new(&tree, data, mixture.n_categories(), settings)?;
        Ok(Self {
            transitions: TransitionCache::new(tree.n_nodes(), mixture.n_categories()),
            tree,
            rate_matrix,
            mixture,
            root_frequencies: None,
            engine,
            ln_probability: None,
            stored_ln_probability: None,
            undo: UndoLog::default(),
        })
    }

    pub fn with_counters(mut self, counters: Arc<EvalCounters>) -> Self {
        self.engine = self.engine.with_counters(counters);
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn rate_matrix(&self) -> &RateMatrix<N> {
        &self.rate_matrix
    }

    pub fn mixture(&self) -> &SiteMixture {
        &self.mixture
    }

    pub fn engine(&self) -> &LikelihoodEngine<N, K> {
        &self.engine
    }

    pub fn counters(&self) -> &Arc<EvalCounters> {
        self.engine.counters()
    }

    pub fn site_log_likelihoods(&self) -> &[f64] {
        self.engine.site_log_likelihoods()
    }

    pub fn set_branch_length(&mut self, node: NodeIdx, length: f64) -> Result<()> {
        if self.tree.is_root(node) {
            return Err(FelsenError::invalid_data("the root has no branch"));
        }
        let old = self.tree.set_branch_length(node, length)?;
        if !self.undo.branch_lengths.iter().any(|&(n, _)| n == node) {
            self.undo.branch_lengths.push((node, old));
        }
        self.transitions.touch(node);
        self.engine.touch_branch(&self.tree, node);
        self.ln_probability = None;
        Ok(())
    }

    pub fn set_rate_matrix(&mut self, rate_matrix: RateMatrix<N>) {
        let old = std::mem::replace(&mut self.rate_matrix, rate_matrix);
        self.undo.rate_matrix.get_or_insert(old);
        self.transitions.touch_all();
        self.engine.touch_branches(&self.tree);
        if self.root_frequencies.is_none() {
            self.engine.touch_root(&self.tree);
        }
        self.ln_probability = None;
    }

    /// Replace the site mixture. The category count is fixed.
    pub fn set_site_mixture(&mut self, mixture: SiteMixture) -> Result<()> {
        if mixture.n_categories() != self.mixture.n_categories() {
            return Err(FelsenError::invalid_data(format!(
                "model has {} categories, got {}",
                self.mixture.n_categories(),
                mixture.n_categories()
            )));
        }
        let rates_changed = mixture.rates() != self.mixture.rates();
        let old = std::mem::replace(&mut self.mixture, mixture);
        self.undo.mixture.get_or_insert(old);
        if rates_changed {
            self.transitions.touch_all();
            self.engine.touch_branches(&self.tree);
        }
        self.ln_probability = None;
        Ok(())
    }

    /// Fixed root frequencies, or `None` for the rate matrix's stationary ones.
    pub fn set_root_frequencies(&mut self, root_frequencies: Option<RootFrequencies<N>>) {
        let old = std::mem::replace(&mut self.root_frequencies, root_frequencies);
        self.undo.root_frequencies.get_or_insert(old);
        self.engine.touch_root(&self.tree);
        self.ln_probability = None;
    }

    /// Log-likelihood of the data under the current parameters.
    pub fn ln_probability(&mut self) -> Result<f64> {
        if let Some(ln_p) = self.ln_probability {
            return Ok(ln_p);
        }
        self.transitions
            .refresh(&self.tree, &self.rate_matrix, &self.mixture);
        let stationary;
        let root_frequencies = match &self.root_frequencies {
            Some(f) => f,
            None => {
                stationary = RootFrequencies::shared(*self.rate_matrix.stationary_frequencies());
                &stationary
            }
        };
        let ln_p = self
            .engine
            .evaluate(&self.tree, &self.transitions, root_frequencies, &self.mixture)?;
        self.ln_probability = Some(ln_p);
        Ok(ln_p)
    }

    /// Accept every change since the last accept or reject.
    pub fn accept(&mut self) {
        self.transitions.keep();
        self.engine.keep();
        self.undo = UndoLog::default();
        self.stored_ln_probability = self.ln_probability;
    }

    /// Undo every change since the last accept.
    pub fn reject(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        for &(node, length) in undo.branch_lengths.iter().rev() {
            self.tree.restore_branch_length(node, length);
        }
        if let Some(q) = undo.rate_matrix {
            self.rate_matrix = q;
        }
        if let Some(m) = undo.mixture {
            self.mixture = m;
        }
        if let Some(f) = undo.root_frequencies {
            self.root_frequencies = f;
        }
        self.transitions.restore();
        self.engine.restore();
        self.ln_probability = self.stored_ln_probability;
    }
}

/// A nucleotide model with the kernel backend chosen at construction.
pub enum NucleotideCtmc {
    Scalar(PhyloCtmc<4, ScalarKernel>),
    Simd(PhyloCtmc<4, WideKernel>),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            NucleotideCtmc::Scalar($m) => $body,
            NucleotideCtmc::Simd($m) => $body,
        }
    };
}

impl NucleotideCtmc {
    pub fn new(
        tree: Tree,
        data: Arc<CharacterMatrix>,
        rate_matrix: RateMatrix<4>,
        mixture: SiteMixture,
        settings: LikelihoodSettings,
    ) -> Result<Self> {
        Ok(match settings.backend {
            KernelBackend::Scalar => {
                Self::Scalar(PhyloCtmc::new(tree, data, rate_matrix, mixture, settings)?)
            }
            KernelBackend::Simd | KernelBackend::Auto => {
                Self::Simd(PhyloCtmc::new(tree, data, rate_matrix, mixture, settings)?)
            }
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => <ScalarKernel as LikelihoodKernel<4>>::NAME,
            Self::Simd(_) => <WideKernel as LikelihoodKernel<4>>::NAME,
        }
    }

    pub fn with_counters(self, counters: Arc<EvalCounters>) -> Self {
        match self {
            Self::Scalar(m) => Self::Scalar(m.with_counters(counters)),
            Self::Simd(m) => Self::Simd(m.with_counters(counters)),
        }
    }

    pub fn tree(&self) -> &Tree {
        dispatch!(self, m => m.tree())
    }

    pub fn site_log_likelihoods(&self) -> &[f64] {
        dispatch!(self, m => m.site_log_likelihoods())
    }

    pub fn counters(&self) -> &Arc<EvalCounters> {
        dispatch!(self, m => m.counters())
    }

    pub fn set_branch_length(&mut self, node: NodeIdx, length: f64) -> Result<()> {
        dispatch!(self, m => m.set_branch_length(node, length))
    }

    pub fn set_rate_matrix(&mut self, rate_matrix: RateMatrix<4>) {
        dispatch!(self, m => m.set_rate_matrix(rate_matrix))
    }

    pub fn set_site_mixture(&mut self, mixture: SiteMixture) -> Result<()> {
        dispatch!(self, m => m.set_site_mixture(mixture))
    }

    pub fn set_root_frequencies(&mut self, root_frequencies: Option<RootFrequencies<4>>) {
        dispatch!(self, m => m.set_root_frequencies(root_frequencies))
    }

    pub fn ln_probability(&mut self) -> Result<f64> {
        dispatch!(self, m => m.ln_probability())
    }

    pub fn accept(&mut self) {
        dispatch!(self, m => m.accept())
    }

    pub fn reject(&mut self) {
        dispatch!(self, m => m.reject())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(backend: KernelBackend) -> NucleotideCtmc {
        let tree = Tree::from_parents(
            &[Some(4), Some(4), Some(5), Some(5), Some(6), Some(6), None],
            &[0.1, 0.2, 0.15, 0.05, 0.3, 0.25, 0.0],
        )
        .unwrap();
        let data = CharacterMatrix::from_dna(&[
            ("a", "ACGTTGCA"),
            ("b", "ACGTTGCC"),
            ("c", "ACTTAGCA"),
            ("d", "GCTTAGNA"),
        ])
        .unwrap();
        let settings = LikelihoodSettings {
            backend,
            ..LikelihoodSettings::default()
        };
        NucleotideCtmc::new(
            tree,
            Arc::new(data),
            RateMatrix::hky(2.5, [0.3, 0.2, 0.2, 0.3]),
            SiteMixture::equal_weights(vec![0.4, 1.6]).unwrap(),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn test_backend_selection() {
        assert_eq!(model(KernelBackend::Auto).backend_name(), "simd");
        assert_eq!(model(KernelBackend::Scalar).backend_name(), "scalar");
    }

    #[test]
    fn test_reject_restores_exactly() {
        let mut m = model(KernelBackend::Auto);
        let before = m.ln_probability().unwrap();
        m.accept();

        m.set_branch_length(NodeIdx(2), 1.5).unwrap();
        let proposed = m.ln_probability().unwrap();
        assert_ne!(before, proposed);
        m.reject();

        assert_eq!(m.ln_probability().unwrap(), before);
        assert_eq!(m.tree().branch_length(NodeIdx(2)), 0.15);
    }

    #[test]
    fn test_accept_then_restore_is_stable() {
        let mut m = model(KernelBackend::Scalar);
        m.ln_probability().unwrap();
        m.accept();
        m.set_rate_matrix(RateMatrix::hky(5.0, [0.3, 0.2, 0.2, 0.3]));
        let accepted = m.ln_probability().unwrap();
        m.accept();
        m.set_branch_length(NodeIdx(0), 0.9).unwrap();
        m.ln_probability().unwrap();
        m.reject();
        assert_eq!(m.ln_probability().unwrap(), accepted);
    }

    #[test]
    fn test_root_branch_cannot_be_set() {
        let mut m = model(KernelBackend::Auto);
        assert!(m.set_branch_length(NodeIdx(6), 0.1).is_err());
    }

    #[test]
    fn test_wrong_category_count_rejected() {
        let mut m = model(KernelBackend::Auto);
        assert!(m.set_site_mixture(SiteMixture::single()).is_err());
    }
}
