//! # Internal-Node Combiner
//!
//! Computes a node's conditional likelihoods from its two or three
//! children, optionally multiplying by root frequencies at the root.
//!
//! ## Formulations
//! - **Edge-conditioned**: a child's buffer already includes its branch,
//!   so the node multiplies its children and then applies its own branch
//!   matrix: `L = P_node · (L_a ⊙ L_b [⊙ L_c])`. At the root the branch
//!   is replaced by the root frequencies.
//! - **Node-conditioned**: a child's buffer is the raw product at the
//!   child, and the parent applies each child's branch:
//!   `L = (P_a · L_a) ⊙ (P_b · L_b) [⊙ (P_c · L_c)]`.
//!
//! Work is split into (mixture, site block) jobs. Jobs write disjoint
//! ranges and never depend on each other, so running them on the rayon pool
//! gives the same bits as running them in order.

use std::ops::Add;

use rayon::prelude::*;

use crate::config::CachingStrategy;
use crate::model::kernel::LikelihoodKernel;
use crate::model::partials::NodeSlot;
use crate::model::scaling::{apply, max_entry, ScaleOutcome, ScalingPolicy};
use crate::model::site_mixture::RootFrequencies;
use crate::model::transition::TransitionMatrix;

/// Sites handled by one job.
pub(crate) const SITE_BLOCK: usize = 256;

/// Outcome counts merged across jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockStats {
    pub rescaled: u64,
    pub degenerate: bool,
}

impl BlockStats {
    #[inline]
    pub fn record(&mut self, outcome: ScaleOutcome) {
        match outcome {
            ScaleOutcome::Rescaled | ScaleOutcome::ThresholdExceeded => self.rescaled += 1,
            ScaleOutcome::Degenerate => self.degenerate = true,
            ScaleOutcome::InheritedOnly | ScaleOutcome::NoScalingNeeded => {}
        }
    }
}

impl Add for BlockStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            rescaled: self.rescaled + other.rescaled,
            degenerate: self.degenerate || other.degenerate,
        }
    }
}

/// Run `job(mixture, first_site, partials, scaling)` over every
/// (mixture, site block) of a slot.
pub(crate) fn for_each_block<const N: usize, F>(
    slot: &mut NodeSlot<N>,
    n_sites: usize,
    parallel: bool,
    job: F,
) -> BlockStats
where
    F: Fn(usize, usize, &mut [[f64; N]], &mut [f64]) -> BlockStats + Sync + Send,
{
    if n_sites == 0 {
        return BlockStats::default();
    }
    let partials: &mut [[f64; N]] = &mut slot.partials;
    let scaling: &mut [f64] = &mut slot.scaling;

    if parallel {
        partials
            .par_chunks_mut(n_sites)
            .zip(scaling.par_chunks_mut(n_sites))
            .enumerate()
            .flat_map(|(m, (p, s))| {
                p.par_chunks_mut(SITE_BLOCK)
                    .zip(s.par_chunks_mut(SITE_BLOCK))
                    .enumerate()
                    .map(move |(b, (p, s))| (m, b * SITE_BLOCK, p, s))
            })
            .map(|(m, start, p, s)| job(m, start, p, s))
            .reduce(BlockStats::default, |a, b| a + b)
    } else {
        let mut stats = BlockStats::default();
        for (m, (p, s)) in partials
            .chunks_mut(n_sites)
            .zip(scaling.chunks_mut(n_sites))
            .enumerate()
        {
            for (b, (p, s)) in p.chunks_mut(SITE_BLOCK).zip(s.chunks_mut(SITE_BLOCK)).enumerate() {
                stats = stats + job(m, b * SITE_BLOCK, p, s);
            }
        }
        stats
    }
}

/// Read-only inputs for one internal node.
pub(crate) struct CombineInputs<'a, const N: usize> {
    pub children: &'a [&'a NodeSlot<N>],
    /// [mixture][k]: the node's own matrix (edge-conditioned, k = 0) or one
    /// per child (node-conditioned). Empty at the edge-conditioned root.
    pub matrices: &'a [&'a TransitionMatrix<N>],
    pub root_frequencies: Option<&'a RootFrequencies<N>>,
    pub caching: CachingStrategy,
    /// Set when this node is rescaled per (mixture, site).
    pub rescale: Option<ScalingPolicy>,
    pub n_sites: usize,
}

impl<const N: usize> CombineInputs<'_, N> {
    fn matrices_per_mixture(&self) -> usize {
        match self.caching {
            CachingStrategy::EdgeConditioned => usize::from(self.root_frequencies.is_none()),
            CachingStrategy::NodeConditioned => self.children.len(),
        }
    }
}

/// Compute every (mixture, site) of a two- or three-child node into `out`.
pub(crate) fn combine_node<const N: usize, K: LikelihoodKernel<N>>(
    out: &mut NodeSlot<N>,
    inputs: &CombineInputs<'_, N>,
    parallel: bool,
) -> BlockStats {
    debug_assert!(matches!(inputs.children.len(), 2 | 3));
    match inputs.children.len() {
        2 => for_each_block(out, inputs.n_sites, parallel, |m, start, p, s| {
            combine_block::<N, 2, K>(inputs, m, start, p, s)
        }),
        _ => for_each_block(out, inputs.n_sites, parallel, |m, start, p, s| {
            combine_block::<N, 3, K>(inputs, m, start, p, s)
        }),
    }
}

/// One (mixture, site block) job for a node with exactly `C` children.
#[inline]
fn combine_block<const N: usize, const C: usize, K: LikelihoodKernel<N>>(
    inputs: &CombineInputs<'_, N>,
    mixture: usize,
    start: usize,
    out_partials: &mut [[f64; N]],
    out_scaling: &mut [f64],
) -> BlockStats {
    let len = out_partials.len();
    let offset = mixture * inputs.n_sites + start;

    let child_partials: [&[[f64; N]]; C] =
        std::array::from_fn(|c| &inputs.children[c].partials[offset..offset + len]);
    let child_scaling: [&[f64]; C] =
        std::array::from_fn(|c| &inputs.children[c].scaling[offset..offset + len]);

    let k = inputs.matrices_per_mixture();
    let mats = &inputs.matrices[mixture * k..(mixture + 1) * k];
    let pi = inputs.root_frequencies.map(|f| f.for_mixture(mixture));

    let mut stats = BlockStats::default();
    for s in 0..len {
        let mut v = match inputs.caching {
            CachingStrategy::EdgeConditioned => {
                let mut prod = child_partials[0][s];
                for c in 1..C {
                    prod = K::product(&prod, &child_partials[c][s]);
                }
                match pi {
                    Some(pi) => K::product(&prod, pi),
                    None => K::propagate(mats[0], &prod),
                }
            }
            CachingStrategy::NodeConditioned => {
                let mut prod = K::propagate(mats[0], &child_partials[0][s]);
                for c in 1..C {
                    prod = K::product(&prod, &K::propagate(mats[c], &child_partials[c][s]));
                }
                match pi {
                    Some(pi) => K::product(&prod, pi),
                    None => prod,
                }
            }
        };

        let mut ln_scale = child_scaling[0][s];
        for c in 1..C {
            ln_scale += child_scaling[c][s];
        }
        if let Some(policy) = &inputs.rescale {
            let step = policy.rescale(&mut v);
            stats.record(step.outcome);
            ln_scale += step.ln_factor;
        }

        out_partials[s] = v;
        out_scaling[s] = ln_scale;
    }
    stats
}

/// Per-node scaling: one factor per site, chosen from the largest entry
/// over every mixture, applied to all mixtures of that site.
///
/// Sites flagged in `skip` (tip gaps) are left untouched.
pub(crate) fn rescale_across_mixtures<const N: usize>(
    slot: &mut NodeSlot<N>,
    n_mixtures: usize,
    n_sites: usize,
    policy: &ScalingPolicy,
    skip: Option<&[bool]>,
) -> BlockStats {
    let mut stats = BlockStats::default();
    for s in 0..n_sites {
        if skip.is_some_and(|skip| skip[s]) {
            continue;
        }
        let mut max = 0.0f64;
        for m in 0..n_mixtures {
            let x = max_entry(&slot.partials[m * n_sites + s]);
            if x > max || x.is_nan() {
                max = x;
            }
            if max.is_nan() {
                break;
            }
        }
        let step = policy.step(max);
        stats.record(step.outcome);
        if step.changes_values() {
            for m in 0..n_mixtures {
                let i = m * n_sites + s;
                apply(&mut slot.partials[i], step.divisor);
                slot.scaling[i] += step.ln_factor;
            }
        }
    }
    stats
}
