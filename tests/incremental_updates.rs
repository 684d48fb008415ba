//! Incremental evaluation: after any sequence of proposals, accepts and
//! rejects, the cached likelihood must equal a from-scratch evaluation,
//! and only the nodes a change can reach are recomputed.

use std::sync::Arc;

use felsen::config::{CachingStrategy, LikelihoodSettings};
use felsen::data::{CharacterMatrix, NodeIdx, Tree};
use felsen::io::newick::parse_newick;
use felsen::model::simulate::simulate_alignment;
use felsen::model::{PhyloCtmc, RateMatrix, RootFrequencies, ScalarKernel, SiteMixture};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Model = PhyloCtmc<4, ScalarKernel>;

const NEWICK: &str = "(((t0:0.1,t1:0.2):0.05,(t2:0.15,t3:0.1):0.1):0.08,((t4:0.3,t5:0.05):0.1,t6:0.2):0.02,t7:0.25);";

fn settings(caching: CachingStrategy) -> LikelihoodSettings {
    LikelihoodSettings {
        caching,
        ..LikelihoodSettings::default()
    }
}

fn setup(seed: u64) -> (Tree, Arc<CharacterMatrix>) {
    let tree = parse_newick(NEWICK).unwrap().remove(0);
    let q = RateMatrix::hky(3.0, [0.2, 0.3, 0.3, 0.2]);
    let mix = SiteMixture::equal_weights(vec![0.4, 1.6]).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let data = simulate_alignment(&tree, &q, &mix, 500, &mut rng).unwrap();
    (tree, Arc::new(data))
}

fn fresh_ln(model: &Model, data: &Arc<CharacterMatrix>) -> f64 {
    let mut fresh = Model::new(
        model.tree().clone(),
        Arc::clone(data),
        model.rate_matrix().clone(),
        model.mixture().clone(),
        *model.engine().settings(),
    )
    .unwrap();
    fresh.ln_probability().unwrap()
}

fn assert_close(a: f64, b: f64) {
    assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0), "{} != {}", a, b);
}

fn random_walk(caching: CachingStrategy, seed: u64) {
    let (tree, data) = setup(seed);
    let mut rng = StdRng::seed_from_u64(seed + 1000);
    let mut model = Model::new(
        tree,
        Arc::clone(&data),
        RateMatrix::hky(3.0, [0.2, 0.3, 0.3, 0.2]),
        SiteMixture::equal_weights(vec![0.4, 1.6]).unwrap(),
        settings(caching),
    )
    .unwrap();
    let mut current = model.ln_probability().unwrap();
    model.accept();

    for _ in 0..60 {
        match rng.random_range(0..10) {
            0 => {
                let kappa = rng.random_range(1.0..6.0);
                model.set_rate_matrix(RateMatrix::hky(kappa, [0.2, 0.3, 0.3, 0.2]));
            }
            1 => {
                let low = rng.random_range(0.1..0.9);
                model
                    .set_site_mixture(SiteMixture::equal_weights(vec![low, 2.0 - low]).unwrap())
                    .unwrap();
            }
            _ => {
                let n_moves = rng.random_range(1..4);
                for _ in 0..n_moves {
                    let node = NodeIdx::from(rng.random_range(0..model.tree().n_nodes() - 1));
                    let old = model.tree().branch_length(node);
                    let scale = (rng.random::<f64>() - 0.5).exp();
                    model.set_branch_length(node, old * scale).unwrap();
                }
            }
        }

        let proposed = model.ln_probability().unwrap();
        assert_close(proposed, fresh_ln(&model, &data));

        if rng.random::<f64>() < 0.5 {
            model.accept();
            current = proposed;
        } else {
            model.reject();
            assert_eq!(model.ln_probability().unwrap().to_bits(), current.to_bits());
            assert_close(current, fresh_ln(&model, &data));
        }
    }
}

#[test]
fn edge_conditioned_walk_matches_fresh_evaluation() {
    random_walk(CachingStrategy::EdgeConditioned, 1);
}

#[test]
fn node_conditioned_walk_matches_fresh_evaluation() {
    random_walk(CachingStrategy::NodeConditioned, 2);
}

/// Nodes recomputed by the evaluation following `change`.
fn recomputed_by(caching: CachingStrategy, change: impl FnOnce(&mut Model)) -> u64 {
    // ((t0, t1), (t2, t3)) with nodes 4 and 5 under the root 6.
    let tree = Tree::from_parents(
        &[Some(4), Some(4), Some(5), Some(5), Some(6), Some(6), None],
        &[0.1, 0.2, 0.3, 0.1, 0.05, 0.15, 0.0],
    )
    .unwrap();
    let data = Arc::new(
        CharacterMatrix::from_dna(&[("a", "ACGTAC"), ("b", "ACGTTC"), ("c", "AGGTAC"), ("d", "TCGTAC")])
            .unwrap(),
    );
    let mut model = Model::new(
        tree,
        data,
        RateMatrix::hky(2.0, [0.25; 4]),
        SiteMixture::equal_weights(vec![0.5, 1.5]).unwrap(),
        settings(caching),
    )
    .unwrap();
    model.ln_probability().unwrap();
    model.accept();

    let before = model.counters().snapshot().nodes_recomputed;
    change(&mut model);
    model.ln_probability().unwrap();
    model.counters().snapshot().nodes_recomputed - before
}

#[test]
fn tip_branch_change_recomputes_path() {
    let change = |m: &mut Model| m.set_branch_length(NodeIdx(0), 0.4).unwrap();
    // Tip 0, node 4 and the root.
    assert_eq!(recomputed_by(CachingStrategy::EdgeConditioned, change), 3);
    // The tip vector holds raw observations and stays valid.
    assert_eq!(recomputed_by(CachingStrategy::NodeConditioned, change), 2);
}

#[test]
fn internal_branch_change_recomputes_path() {
    let change = |m: &mut Model| m.set_branch_length(NodeIdx(5), 0.4).unwrap();
    assert_eq!(recomputed_by(CachingStrategy::EdgeConditioned, change), 2);
    assert_eq!(recomputed_by(CachingStrategy::NodeConditioned, change), 1);
}

#[test]
fn rate_matrix_change_recomputes_every_branch() {
    let change = |m: &mut Model| m.set_rate_matrix(RateMatrix::hky(4.0, [0.25; 4]));
    assert_eq!(recomputed_by(CachingStrategy::EdgeConditioned, change), 7);
    assert_eq!(recomputed_by(CachingStrategy::NodeConditioned, change), 3);
}

#[test]
fn root_frequency_change_recomputes_root_only() {
    let change =
        |m: &mut Model| m.set_root_frequencies(Some(RootFrequencies::shared([0.4, 0.1, 0.1, 0.4])));
    assert_eq!(recomputed_by(CachingStrategy::EdgeConditioned, change), 1);
    assert_eq!(recomputed_by(CachingStrategy::NodeConditioned, change), 1);
}

#[test]
fn weight_change_recomputes_nothing() {
    let change = |m: &mut Model| {
        m.set_site_mixture(SiteMixture::new(vec![0.5, 1.5], vec![0.8, 0.2]).unwrap())
            .unwrap()
    };
    assert_eq!(recomputed_by(CachingStrategy::EdgeConditioned, change), 0);
    assert_eq!(recomputed_by(CachingStrategy::NodeConditioned, change), 0);
}

#[test]
fn repeated_touch_in_one_cycle_is_harmless() {
    let (tree, data) = setup(7);
    let mut model = Model::new(
        tree,
        Arc::clone(&data),
        RateMatrix::hky(3.0, [0.2, 0.3, 0.3, 0.2]),
        SiteMixture::equal_weights(vec![0.4, 1.6]).unwrap(),
        settings(CachingStrategy::EdgeConditioned),
    )
    .unwrap();
    let start = model.ln_probability().unwrap();
    model.accept();

    // Two changes sharing the path to the root, then the first undone by hand.
    model.set_branch_length(NodeIdx(0), 0.5).unwrap();
    model.set_branch_length(NodeIdx(1), 0.6).unwrap();
    model.set_branch_length(NodeIdx(0), 0.1).unwrap();
    let proposed = model.ln_probability().unwrap();
    assert_close(proposed, fresh_ln(&model, &data));

    model.reject();
    assert_eq!(model.ln_probability().unwrap(), start);
    assert_eq!(model.tree().branch_length(NodeIdx(1)), 0.2);
}
