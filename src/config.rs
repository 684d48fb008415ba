//! # Configuration Logic
//!
//! ## Role
//! CLI argument parsing and validation, plus the [`LikelihoodSettings`]
//! value that is injected into every likelihood engine. The engine never
//! reads global state; everything it needs to know about scaling, caching
//! and kernel selection travels in that value.
//!
//! ## Example CLI
//! ```bash
//! felsen --tree trees.nwk --alignment aln.fa.gz --model hky --kappa 4.0 \
//!        --rates 0.2,1.0,1.8 --scaling-method direct --nthreads 8
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{FelsenError, Result};

/// How underflow is corrected at a tested node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScalingMethod {
    /// Rescale only when the largest entry drops below `SCALING_THRESHOLD`.
    #[default]
    Threshold,
    /// Always divide by the largest entry.
    Direct,
}

/// Where a branch's transition matrix is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CachingStrategy {
    /// A node's buffer already includes its own branch.
    #[default]
    #[value(name = "edge")]
    EdgeConditioned,
    /// A node's buffer is the raw product at the node; the parent applies
    /// the child's branch.
    #[value(name = "node")]
    NodeConditioned,
}

/// Kernel backend used for the per-site state arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum KernelBackend {
    /// SIMD where the state space allows it, scalar otherwise.
    #[default]
    Auto,
    Scalar,
    Simd,
}

/// How a Gamma distribution is cut into equal-weight rate categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GammaDiscretization {
    /// Each category takes the mean rate of its quantile interval.
    #[default]
    Mean,
    /// Each category takes the median of its interval, rescaled to mean one.
    Median,
}

/// Substitution model family for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModelChoice {
    #[default]
    Jc69,
    F81,
    Hky,
    Tim,
    Gtr,
}

/// Numerical and caching settings for one likelihood engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikelihoodSettings {
    /// Master switch for underflow protection.
    pub use_scaling: bool,
    /// Test every `scaling_density`-th node, by `(index + 1) % density == 0`.
    pub scaling_density: usize,
    pub scaling_method: ScalingMethod,
    /// One factor per (node, mixture, site) when true, per (node, site) otherwise.
    pub scaling_per_mixture: bool,
    pub caching: CachingStrategy,
    pub backend: KernelBackend,
    /// Evaluate site blocks on the rayon pool.
    pub parallel: bool,
}

impl Default for LikelihoodSettings {
    fn default() -> Self {
        Self {
            use_scaling: true,
            scaling_density: 1,
            scaling_method: ScalingMethod::Threshold,
            scaling_per_mixture: true,
            caching: CachingStrategy::EdgeConditioned,
            backend: KernelBackend::Auto,
            parallel: true,
        }
    }
}

impl LikelihoodSettings {
    /// Settings with scaling switched off entirely.
    pub fn unscaled() -> Self {
        Self {
            use_scaling: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scaling_density == 0 {
            return Err(FelsenError::config("scaling density must be at least 1"));
        }
        Ok(())
    }
}

/// Command line configuration for the `felsen` binary
#[derive(Parser, Debug, Clone)]
#[command(name = "felsen", version, about = "Phylogenetic CTMC log-likelihood evaluation")]
pub struct Config {
    /// Newick file with one or more trees (one per line)
    #[arg(long, short = 't')]
    pub tree: PathBuf,

    /// FASTA alignment (optionally gzip compressed)
    #[arg(long, short = 'a')]
    pub alignment: PathBuf,

    /// Substitution model
    #[arg(long, value_enum, default_value_t = ModelChoice::Jc69)]
    pub model: ModelChoice,

    /// Transition/transversion ratio for HKY
    #[arg(long, default_value_t = 2.0)]
    pub kappa: f64,

    /// Exchangeabilities: 4 values for TIM, 6 for GTR (AC,AG,AT,CG,CT,GT)
    #[arg(long, value_delimiter = ',')]
    pub exchangeabilities: Option<Vec<f64>>,

    /// Stationary frequencies A,C,G,T (defaults to uniform)
    #[arg(long, value_delimiter = ',', conflicts_with = "empirical_frequencies")]
    pub frequencies: Option<Vec<f64>>,

    /// Use base frequencies observed in the alignment
    #[arg(long)]
    pub empirical_frequencies: bool,

    /// Site-rate categories
    #[arg(long, value_delimiter = ',', default_value = "1.0", allow_negative_numbers = true)]
    pub rates: Vec<f64>,

    /// Gamma shape for discretized rate heterogeneity (replaces --rates)
    #[arg(long, conflicts_with_all = ["rates", "weights"], allow_negative_numbers = true)]
    pub gamma_alpha: Option<f64>,

    /// Number of Gamma rate categories
    #[arg(long, default_value_t = 4, requires = "gamma_alpha")]
    pub gamma_categories: usize,

    #[arg(long, value_enum, default_value_t = GammaDiscretization::Mean)]
    pub gamma_discretization: GammaDiscretization,

    /// Category weights (defaults to equal weights)
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    pub weights: Option<Vec<f64>>,

    /// Disable underflow scaling
    #[arg(long)]
    pub no_scaling: bool,

    /// Test every n-th node for underflow
    #[arg(long, default_value_t = 1)]
    pub scaling_density: usize,

    #[arg(long, value_enum, default_value_t = ScalingMethod::Threshold)]
    pub scaling_method: ScalingMethod,

    /// Share one scaling factor across all mixture categories at a node
    #[arg(long)]
    pub scaling_per_node: bool,

    #[arg(long, value_enum, default_value_t = CachingStrategy::EdgeConditioned)]
    pub caching: CachingStrategy,

    #[arg(long, value_enum, default_value_t = KernelBackend::Auto)]
    pub backend: KernelBackend,

    /// Evaluate sites on the calling thread only
    #[arg(long)]
    pub serial: bool,

    /// Merge identical alignment columns before evaluation
    #[arg(long)]
    pub compress_patterns: bool,

    /// Print per-site log-likelihoods after each tree
    #[arg(long)]
    pub site_likelihoods: bool,

    /// Number of threads (default: all cores)
    #[arg(long)]
    pub nthreads: Option<usize>,

    /// Emit span timings to stderr
    #[arg(long)]
    pub profile: bool,
}

impl Config {
    /// Parse from the process arguments and validate.
    pub fn parse_and_validate() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tree.exists() {
            return Err(FelsenError::config(format!(
                "tree file not found: {}",
                self.tree.display()
            )));
        }
        if !self.alignment.exists() {
            return Err(FelsenError::config(format!(
                "alignment file not found: {}",
                self.alignment.display()
            )));
        }
        if self.rates.is_empty() {
            return Err(FelsenError::config("at least one rate category is required"));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.rates.len() {
                return Err(FelsenError::config(format!(
                    "{} weights given for {} rate categories",
                    weights.len(),
                    self.rates.len()
                )));
            }
        }
        if let Some(alpha) = self.gamma_alpha {
            if !(alpha.is_finite() && alpha > 0.0) {
                return Err(FelsenError::config("gamma shape must be positive"));
            }
            if self.gamma_categories == 0 {
                return Err(FelsenError::config("at least one gamma category is required"));
            }
        }
        if let Some(freqs) = &self.frequencies {
            if freqs.len() != 4 {
                return Err(FelsenError::config("--frequencies needs exactly 4 values"));
            }
        }
        let expected_rates = match self.model {
            ModelChoice::Tim => Some(4),
            ModelChoice::Gtr => Some(6),
            _ => None,
        };
        match (expected_rates, &self.exchangeabilities) {
            (Some(n), Some(r)) if r.len() != n => {
                return Err(FelsenError::config(format!(
                    "{:?} needs {} exchangeabilities, got {}",
                    self.model,
                    n,
                    r.len()
                )));
            }
            (None, Some(_)) => {
                return Err(FelsenError::config(format!(
                    "{:?} does not take exchangeabilities",
                    self.model
                )));
            }
            _ => {}
        }
        if !(self.kappa.is_finite() && self.kappa > 0.0) {
            return Err(FelsenError::config("kappa must be positive"));
        }
        if self.nthreads == Some(0) {
            return Err(FelsenError::config("nthreads must be at least 1"));
        }
        self.likelihood_settings().validate()
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Engine settings derived from the command line.
    pub fn likelihood_settings(&self) -> LikelihoodSettings {
        LikelihoodSettings {
            use_scaling: !self.no_scaling,
            scaling_density: self.scaling_density,
            scaling_method: self.scaling_method,
            scaling_per_mixture: !self.scaling_per_node,
            caching: self.caching,
            backend: self.backend,
            parallel: !self.serial,
        }
    }
}
