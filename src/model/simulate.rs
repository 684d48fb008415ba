//! # Sequence Simulation
//!
//! Draws alignments from the model: a category per site, a root state from
//! the stationary frequencies, then one draw per branch from the row of
//! `P(t · rate)` selected by the parent's state.

use rand::Rng;

use crate::data::{CharacterMatrix, Observation, Tree};
use crate::error::{FelsenError, Result};
use crate::model::rate_matrix::RateMatrix;
use crate::model::site_mixture::SiteMixture;
use crate::model::transition::TransitionMatrix;

/// Simulate `n_sites` columns. Tips are named after the tree, or `t0, t1, ...`.
pub fn simulate_alignment<const N: usize, R: Rng>(
    tree: &Tree,
    rate_matrix: &RateMatrix<N>,
    mixture: &SiteMixture,
    n_sites: usize,
    rng: &mut R,
) -> Result<CharacterMatrix> {
    if !rate_matrix.is_valid() || !mixture.is_valid() {
        return Err(FelsenError::invalid_data("cannot simulate under invalid parameters"));
    }

    let n_categories = mixture.n_categories();
    // [node][category]; the root row is unused
    let mut matrices: Vec<Vec<TransitionMatrix<N>>> = Vec::with_capacity(tree.n_nodes());
    for n in 0..tree.n_nodes() {
        let node = n.into();
        if tree.is_root(node) {
            matrices.push(Vec::new());
            continue;
        }
        let per_category = (0..n_categories)
            .map(|c| {
                rate_matrix
                    .transition_probabilities(tree.branch_length(node) * mixture.rate(c))
                    .ok_or_else(|| {
                        FelsenError::invalid_data(format!("node {} has an invalid branch length", n))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        matrices.push(per_category);
    }

    let pre_order: Vec<_> = tree.post_order().iter().rev().copied().collect();
    let mut states = vec![0usize; tree.n_nodes()];
    let mut rows: Vec<Vec<Observation>> = vec![Vec::with_capacity(n_sites); tree.n_tips()];

    for _ in 0..n_sites {
        let category = draw(mixture.weights(), rng);
        for &node in &pre_order {
            let state = match tree.parent(node) {
                None => draw(rate_matrix.stationary_frequencies(), rng),
                Some(parent) => {
                    let p = &matrices[node.as_usize()][category];
                    draw(p.row(states[parent.as_usize()]), rng)
                }
            };
            states[node.as_usize()] = state;
        }
        for (row, &tip) in rows.iter_mut().zip(tree.tips()) {
            row.push(Observation::State(states[tip.as_usize()] as u8));
        }
    }

    let taxa = tree
        .tips()
        .iter()
        .enumerate()
        .map(|(k, &tip)| tree.name(tip).map_or_else(|| format!("t{}", k), str::to_string))
        .collect();
    CharacterMatrix::new(N, taxa, rows)
}

/// Index drawn from unnormalized non-negative weights.
fn draw<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let mut threshold = rng.random::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if threshold < w {
            return i;
        }
        threshold -= w;
    }
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}
