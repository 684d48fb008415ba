//! # Numerical Scaling Policy
//!
//! Conditional likelihoods shrink geometrically towards the root and
//! underflow `f64` on large trees. Each tested vector is divided by a
//! factor and the natural log of that factor is added to the site's
//! scaling value, keeping `true likelihood = L · exp(S)`.
//!
//! Two modes:
//! - **Threshold**: divide by `SCALING_THRESHOLD` only when the largest
//!   entry has dropped below it. The log correction is precomputed.
//! - **Direct**: always divide by the largest entry.
//!
//! Only every `density`-th node is tested, by `(index + 1) % density == 0`.
//! Untested nodes just carry the sum of their children's corrections.

use crate::config::{LikelihoodSettings, ScalingMethod};
use crate::data::NodeIdx;

/// Rescale a vector once its largest entry falls below this value.
pub const SCALING_THRESHOLD: f64 = 1e-100;

/// What the policy did at one (node, mixture, site).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Node not tested; only the children's corrections apply.
    InheritedOnly,
    NoScalingNeeded,
    /// Divided by the vector maximum.
    Rescaled,
    /// Fell below the threshold and was divided by it.
    ThresholdExceeded,
    /// Largest entry infinite or NaN. The evaluation is rejected.
    Degenerate,
}

/// Divisor and log correction chosen for one vector (or one site across
/// mixtures).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleStep {
    pub outcome: ScaleOutcome,
    pub divisor: f64,
    pub ln_factor: f64,
}

impl ScaleStep {
    const UNCHANGED: Self = Self {
        outcome: ScaleOutcome::NoScalingNeeded,
        divisor: 1.0,
        ln_factor: 0.0,
    };

    #[inline]
    pub fn changes_values(&self) -> bool {
        matches!(self.outcome, ScaleOutcome::Rescaled | ScaleOutcome::ThresholdExceeded)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalingPolicy {
    enabled: bool,
    density: usize,
    method: ScalingMethod,
    per_mixture: bool,
    ln_threshold: f64,
}

impl ScalingPolicy {
    pub fn new(settings: &LikelihoodSettings) -> Self {
        Self {
            enabled: settings.use_scaling,
            density: settings.scaling_density.max(1),
            method: settings.scaling_method,
            per_mixture: settings.scaling_per_mixture,
            ln_threshold: SCALING_THRESHOLD.ln(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// One factor per (node, mixture, site) rather than per (node, site).
    pub fn per_mixture(&self) -> bool {
        self.per_mixture
    }

    pub fn method(&self) -> ScalingMethod {
        self.method
    }

    /// Whether this node is selected for rescaling.
    #[inline]
    pub fn tests_node(&self, node: NodeIdx) -> bool {
        self.enabled && (node.as_usize() + 1) % self.density == 0
    }

    /// Choose the factor for a vector whose largest entry is `max`.
    ///
    /// An all-zero vector is a probability-zero outcome for its mixture and
    /// passes through unscaled; the root turns it into a `-inf` term.
    #[inline]
    pub fn step(&self, max: f64) -> ScaleStep {
        if !max.is_finite() {
            return ScaleStep {
                outcome: ScaleOutcome::Degenerate,
                divisor: 1.0,
                ln_factor: 0.0,
            };
        }
        if max == 0.0 {
            return ScaleStep::UNCHANGED;
        }
        match self.method {
            ScalingMethod::Threshold if max < SCALING_THRESHOLD => ScaleStep {
                outcome: ScaleOutcome::ThresholdExceeded,
                divisor: SCALING_THRESHOLD,
                ln_factor: self.ln_threshold,
            },
            ScalingMethod::Threshold => ScaleStep::UNCHANGED,
            ScalingMethod::Direct => ScaleStep {
                outcome: ScaleOutcome::Rescaled,
                divisor: max,
                ln_factor: max.ln(),
            },
        }
    }

    /// Rescale one vector in place, returning the step taken.
    #[inline]
    pub fn rescale<const N: usize>(&self, v: &mut [f64; N]) -> ScaleStep {
        let step = self.step(max_entry(v));
        if step.changes_values() {
            apply(v, step.divisor);
        }
        step
    }
}

/// Largest entry, or NaN if any entry is NaN.
#[inline]
pub fn max_entry(v: &[f64]) -> f64 {
    v.iter()
        .fold(0.0, |m, &x| if x > m || x.is_nan() { x } else { m })
}

#[inline]
pub fn apply<const N: usize>(v: &mut [f64; N], divisor: f64) {
    for x in v.iter_mut() {
        *x /= divisor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(method: ScalingMethod, density: usize) -> ScalingPolicy {
        ScalingPolicy::new(&LikelihoodSettings {
            scaling_method: method,
            scaling_density: density,
            ..LikelihoodSettings::default()
        })
    }

    #[test]
    fn test_density_gate() {
        let p = policy(ScalingMethod::Threshold, 3);
        let tested: Vec<u32> = (0..9).filter(|&i| p.tests_node(NodeIdx(i))).collect();
        assert_eq!(tested, vec![2, 5, 8]);

        let off = ScalingPolicy::new(&LikelihoodSettings::unscaled());
        assert!(!off.tests_node(NodeIdx(0)));
    }

    #[test]
    fn test_threshold_mode() {
        let p = policy(ScalingMethod::Threshold, 1);
        let mut v = [1e-120, 3e-121, 0.0, 5e-130];
        let step = p.rescale(&mut v);
        assert_eq!(step.outcome, ScaleOutcome::ThresholdExceeded);
        assert!((v[0] - 1e-20).abs() < 1e-33);
        assert!((step.ln_factor - (1e-100f64).ln()).abs() < 1e-12);

        let mut w = [0.3, 0.1, 0.0, 0.0];
        assert_eq!(p.rescale(&mut w).outcome, ScaleOutcome::NoScalingNeeded);
        assert_eq!(w, [0.3, 0.1, 0.0, 0.0]);
    }

    #[test]
    fn test_direct_mode() {
        let p = policy(ScalingMethod::Direct, 1);
        let mut v = [0.02, 0.04, 0.01, 0.0];
        let step = p.rescale(&mut v);
        assert_eq!(step.outcome, ScaleOutcome::Rescaled);
        assert_eq!(v[1], 1.0);
        assert!((step.ln_factor - 0.04f64.ln()).abs() < 1e-15);
    }

    #[test]
    fn test_zero_vector_passes_through() {
        for method in [ScalingMethod::Threshold, ScalingMethod::Direct] {
            let p = policy(method, 1);
            let mut v = [0.0; 4];
            let step = p.rescale(&mut v);
            assert_eq!(step.outcome, ScaleOutcome::NoScalingNeeded);
            assert_eq!(step.ln_factor, 0.0);
            assert_eq!(v, [0.0; 4]);
        }
    }

    #[test]
    fn test_degenerate_vectors() {
        let p = policy(ScalingMethod::Direct, 1);
        assert_eq!(
            p.rescale(&mut [0.1, f64::NAN, 0.2, 0.0]).outcome,
            ScaleOutcome::Degenerate
        );
        assert_eq!(
            p.rescale(&mut [f64::INFINITY, 0.1, 0.2, 0.0]).outcome,
            ScaleOutcome::Degenerate
        );
    }

    #[test]
    fn test_max_entry_propagates_nan() {
        assert!(max_entry(&[0.5, f64::NAN, 0.9]).is_nan());
        assert_eq!(max_entry(&[0.5, 0.2, 0.9]), 0.9);
    }
}
