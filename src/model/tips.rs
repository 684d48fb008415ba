//! # Tip Likelihood Initializer
//!
//! Turns a taxon's observations into conditional likelihood vectors.
//!
//! | observation          | edge-conditioned          | node-conditioned |
//! |----------------------|---------------------------|------------------|
//! | gap                  | all ones, never rescaled  | all ones         |
//! | state `s`            | column `s` of `P`         | indicator of `s` |
//! | ambiguous set        | `Σ_{t ∈ set} P[r][t]`     | indicator of set |
//!
//! Gap sites keep a scaling value of exactly zero.

use crate::data::Observation;
use crate::model::combine::{for_each_block, BlockStats};
use crate::model::kernel::LikelihoodKernel;
use crate::model::partials::NodeSlot;
use crate::model::scaling::ScalingPolicy;
use crate::model::transition::TransitionMatrix;

/// 1.0 on every state the observation allows.
#[inline]
pub fn indicator<const N: usize>(obs: Observation) -> [f64; N] {
    let mut v = [0.0; N];
    match obs {
        Observation::Gap => v = [1.0; N],
        Observation::State(s) => v[s as usize] = 1.0,
        Observation::Ambiguous(set) => {
            for s in set.iter().take_while(|&s| s < N) {
                v[s] = 1.0;
            }
        }
    }
    v
}

/// Fill a tip's slot for every (mixture, site).
///
/// `matrices` holds the tip's branch matrix per mixture (edge-conditioned)
/// or is empty (node-conditioned). `rescale` is set when the tip is tested
/// per (mixture, site).
pub(crate) fn initialize_tip<const N: usize, K: LikelihoodKernel<N>>(
    out: &mut NodeSlot<N>,
    row: &[Observation],
    matrices: &[&TransitionMatrix<N>],
    rescale: Option<ScalingPolicy>,
    parallel: bool,
) -> BlockStats {
    let n_sites = row.len();
    for_each_block(out, n_sites, parallel, |m, start, partials, scaling| {
        let mut stats = BlockStats::default();
        let p = matrices.get(m);
        for (i, (v_out, s_out)) in partials.iter_mut().zip(scaling.iter_mut()).enumerate() {
            let obs = row[start + i];
            *s_out = 0.0;
            let mut v = match (obs, p) {
                (Observation::Gap, _) => {
                    *v_out = [1.0; N];
                    continue;
                }
                (Observation::State(s), Some(p)) => *p.column(s as usize),
                (_, Some(p)) => K::propagate(p, &indicator(obs)),
                (_, None) => indicator(obs),
            };
            if let Some(policy) = &rescale {
                let step = policy.rescale(&mut v);
                stats.record(step.outcome);
                *s_out = step.ln_factor;
            }
            *v_out = v;
        }
        stats
    })
}

/// Sites of a row that are gaps, for per-node scaling to skip.
pub(crate) fn gap_mask(row: &[Observation]) -> Vec<bool> {
    row.iter().map(|o| o.is_gap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{NodeIdx, StateSet};
    use crate::model::kernel::ScalarKernel;
    use crate::model::partials::PartialBuffers;
    use crate::model::rate_matrix::RateMatrix;

    fn run(row: &[Observation], p: Option<&TransitionMatrix<4>>) -> NodeSlot<4> {
        let mut slot = PartialBuffers::<4>::new(1, 1, row.len()).take_active(NodeIdx(0));
        let mats: Vec<&TransitionMatrix<4>> = p.into_iter().collect();
        initialize_tip::<4, ScalarKernel>(&mut slot, row, &mats, None, false);
        slot
    }

    #[test]
    fn test_indicator() {
        assert_eq!(indicator::<4>(Observation::State(2)), [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(indicator::<4>(Observation::Gap), [1.0; 4]);
        let set = StateSet::from_states(&[0, 3]);
        assert_eq!(indicator::<4>(Observation::Ambiguous(set)), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_edge_conditioned_tip() {
        let p = RateMatrix::hky(2.0, [0.1, 0.2, 0.3, 0.4])
            .transition_probabilities(0.3)
            .unwrap();
        let row = [
            Observation::State(1),
            Observation::Gap,
            Observation::Ambiguous(StateSet::from_states(&[0, 2])),
        ];
        let slot = run(&row, Some(&p));
        assert_eq!(&slot.partials()[0], p.column(1));
        assert_eq!(slot.partials()[1], [1.0; 4]);
        for r in 0..4 {
            let expected = p.get(r, 0) + p.get(r, 2);
            assert!((slot.partials()[2][r] - expected).abs() < 1e-15);
        }
        assert!(slot.scaling().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_node_conditioned_tip_is_indicator() {
        let row = [Observation::State(3), Observation::Gap];
        let slot = run(&row, None);
        assert_eq!(slot.partials()[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(slot.partials()[1], [1.0; 4]);
    }

    #[test]
    fn test_single_state_ambiguity_equals_state() {
        let p = RateMatrix::jc69().transition_probabilities(0.2).unwrap();
        let row = [
            Observation::State(2),
            Observation::Ambiguous(StateSet::from_states(&[2])),
        ];
        let slot = run(&row, Some(&p));
        assert_eq!(slot.partials()[0], slot.partials()[1]);
    }
}
