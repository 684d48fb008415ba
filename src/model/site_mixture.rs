//! # Site Mixtures and Root Frequencies
//!
//! A site mixture is a set of rate categories: each site evolves under one
//! of `M` rate multipliers with prior weight `w_m`. The likelihood keeps one
//! partial-likelihood layer per category and mixes them at the root.
//!
//! Both types validate lazily: constructing them never fails, and an
//! invalid parameter set makes the evaluation return negative infinity.

use crate::config::GammaDiscretization;
use crate::error::{FelsenError, Result};
use crate::utils::special::{gamma_quantile, regularized_gamma_p};

#[derive(Debug, Clone, PartialEq)]
pub struct SiteMixture {
    rates: Vec<f64>,
    weights: Vec<f64>,
}

impl SiteMixture {
    /// One category with rate one.
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            weights: vec![1.0],
        }
    }

    /// Categories with the given rates and equal weights.
    pub fn equal_weights(rates: Vec<f64>) -> Result<Self> {
        let n = rates.len();
        Self::new(rates, vec![1.0 / n.max(1) as f64; n])
    }

    /// `n_categories` equal-weight rates from a mean-one Gamma(`alpha`, `alpha`)
    /// distribution.
    ///
    /// Mean discretization gives each category the conditional mean of its
    /// quantile interval, so the rates average to exactly one.
    pub fn gamma(alpha: f64, n_categories: usize, discretization: GammaDiscretization) -> Result<Self> {
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(FelsenError::invalid_data(format!("gamma shape {} is not positive", alpha)));
        }
        if n_categories == 0 {
            return Err(FelsenError::invalid_data("site mixture needs at least one category"));
        }
        let k = n_categories as f64;
        let rates: Vec<f64> = match discretization {
            GammaDiscretization::Mean => {
                // Rate mass below a cut b is P(alpha + 1, alpha * b).
                let mut below = 0.0;
                (1..=n_categories)
                    .map(|i| {
                        let upper = if i == n_categories {
                            1.0
                        } else {
                            let cut = gamma_quantile(i as f64 / k, alpha, alpha);
                            regularized_gamma_p(alpha + 1.0, alpha * cut)
                        };
                        let rate = k * (upper - below);
                        below = upper;
                        rate
                    })
                    .collect()
            }
            GammaDiscretization::Median => {
                let medians: Vec<f64> = (0..n_categories)
                    .map(|i| gamma_quantile((2 * i + 1) as f64 / (2.0 * k), alpha, alpha))
                    .collect();
                let mean = medians.iter().sum::<f64>() / k;
                medians.iter().map(|m| m / mean).collect()
            }
        };
        Self::equal_weights(rates)
    }

    /// Fails only on structural problems: no categories or mismatched lengths.
    pub fn new(rates: Vec<f64>, weights: Vec<f64>) -> Result<Self> {
        if rates.is_empty() {
            return Err(FelsenError::invalid_data("site mixture needs at least one category"));
        }
        if rates.len() != weights.len() {
            return Err(FelsenError::invalid_data(format!(
                "{} rates but {} weights",
                rates.len(),
                weights.len()
            )));
        }
        Ok(Self { rates, weights })
    }

    pub fn n_categories(&self) -> usize {
        self.rates.len()
    }

    pub fn rate(&self, category: usize) -> f64 {
        self.rates[category]
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Rates non-negative and finite, weights a probability vector.
    pub fn is_valid(&self) -> bool {
        self.rates.iter().all(|r| r.is_finite() && *r >= 0.0)
            && self.weights.iter().all(|w| w.is_finite() && *w >= 0.0)
            && (self.weights.iter().sum::<f64>() - 1.0).abs() <= 1e-6
    }
}

/// Root state frequencies, one vector per mixture category.
///
/// Fewer vectors than categories are reused cyclically: category `m`
/// uses vector `m % len`.
#[derive(Debug, Clone, PartialEq)]
pub struct RootFrequencies<const N: usize> {
    frequencies: Vec<[f64; N]>,
}

impl<const N: usize> RootFrequencies<N> {
    pub fn uniform() -> Self {
        Self {
            frequencies: vec![[1.0 / N as f64; N]],
        }
    }

    pub fn shared(frequencies: [f64; N]) -> Self {
        Self {
            frequencies: vec![frequencies],
        }
    }

    pub fn per_mixture(frequencies: Vec<[f64; N]>) -> Result<Self> {
        if frequencies.is_empty() {
            return Err(FelsenError::invalid_data("no root frequency vectors"));
        }
        Ok(Self { frequencies })
    }

    #[inline]
    pub fn for_mixture(&self, mixture: usize) -> &[f64; N] {
        &self.frequencies[mixture % self.frequencies.len()]
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Every vector non-negative, finite and summing to one.
    pub fn is_valid(&self) -> bool {
        !self.frequencies.is_empty()
            && self.frequencies.iter().all(|f| {
                f.iter().all(|x| x.is_finite() && *x >= 0.0)
                    && (f.iter().sum::<f64>() - 1.0).abs() <= 1e-6
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixture_validation() {
        assert!(SiteMixture::single().is_valid());
        assert!(SiteMixture::equal_weights(vec![0.5, 1.5]).unwrap().is_valid());
        assert!(!SiteMixture::new(vec![1.0, -1.0], vec![0.5, 0.5]).unwrap().is_valid());
        assert!(!SiteMixture::new(vec![1.0, 1.0], vec![0.5, 0.6]).unwrap().is_valid());
        assert!(SiteMixture::new(vec![], vec![]).is_err());
        assert!(SiteMixture::new(vec![1.0], vec![0.5, 0.5]).is_err());
    }

    #[test]
    fn test_gamma_rates_average_to_one() {
        for alpha in [0.1, 0.5, 1.0, 3.0] {
            for k in [1, 2, 4, 8] {
                let m = SiteMixture::gamma(alpha, k, GammaDiscretization::Mean).unwrap();
                assert_eq!(m.n_categories(), k);
                assert!(m.is_valid());
                let mean = m.rates().iter().sum::<f64>() / k as f64;
                assert!((mean - 1.0).abs() < 1e-9, "alpha {} k {}: {}", alpha, k, mean);
                assert!(m.rates().windows(2).all(|w| w[0] < w[1]));
            }
            let median = SiteMixture::gamma(alpha, 4, GammaDiscretization::Median).unwrap();
            let mean = median.rates().iter().sum::<f64>() / 4.0;
            assert!((mean - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gamma_known_rates() {
        // Mean-discretized rates for alpha = 0.5, four categories.
        let m = SiteMixture::gamma(0.5, 4, GammaDiscretization::Mean).unwrap();
        let expected = [0.033_388, 0.251_916, 0.820_268, 2.894_428];
        for (r, e) in m.rates().iter().zip(expected) {
            assert!((r - e).abs() < 1e-5, "{} != {}", r, e);
        }
    }

    #[test]
    fn test_large_gamma_shape_approaches_single_rate() {
        for discretization in [GammaDiscretization::Mean, GammaDiscretization::Median] {
            let m = SiteMixture::gamma(1e4, 4, discretization).unwrap();
            for r in m.rates() {
                assert!((r - 1.0).abs() < 0.03, "{:?}: {}", discretization, r);
            }
        }
        assert!(SiteMixture::gamma(0.0, 4, GammaDiscretization::Mean).is_err());
        assert!(SiteMixture::gamma(1.0, 0, GammaDiscretization::Mean).is_err());
    }

    #[test]
    fn test_root_frequencies_cycle() {
        let f = RootFrequencies::per_mixture(vec![[1.0, 0.0], [0.0, 1.0]]).unwrap();
        assert_eq!(f.for_mixture(0), &[1.0, 0.0]);
        assert_eq!(f.for_mixture(3), &[0.0, 1.0]);
        assert!(f.is_valid());
        assert!(!RootFrequencies::shared([0.7, 0.7]).is_valid());
        assert!(!RootFrequencies::shared([1.5, -0.5]).is_valid());
        assert!(RootFrequencies::<4>::uniform().is_valid());
    }
}
