//! # Model Module
//!
//! Likelihood of aligned characters under a continuous-time Markov chain
//! on a tree, computed with Felsenstein's pruning algorithm.
//!
//! ## Core Algorithms
//! - `rate_matrix`: Reversible rate matrices and their exponentials
//! - `transition`: Per-branch transition matrices and their double-buffered cache
//! - `tips`: Tip partial likelihoods from observed characters
//! - `combine`: Internal-node combination for 2 or 3 children
//! - `scaling`: Underflow rescaling of partial likelihood vectors
//! - `likelihood`: Post-order evaluation and root finalization
//! - `phylo_ctmc`: The propose / accept / reject model used by samplers
//!
//! ## Layout
//! Partial likelihoods are stored as `[mixture][site][state]` per node, with
//! two buffers per node so a rejected proposal restores the previous values
//! by flipping an index. State vectors are fixed-size arrays (`[f64; N]`) so
//! the 4-state nucleotide case is a single aligned load for the SIMD kernel.

pub mod combine;
pub mod kernel;
pub mod likelihood;
pub mod partials;
pub mod phylo_ctmc;
pub mod rate_matrix;
pub mod scaling;
pub mod simulate;
pub mod site_mixture;
pub mod tips;
pub mod transition;

pub use kernel::{LikelihoodKernel, ScalarKernel, WideKernel};
pub use likelihood::{log_sum_exp, LikelihoodEngine};
pub use partials::PartialBuffers;
pub use phylo_ctmc::{NucleotideCtmc, PhyloCtmc};
pub use rate_matrix::RateMatrix;
pub use scaling::{ScaleOutcome, ScalingPolicy, SCALING_THRESHOLD};
pub use site_mixture::{RootFrequencies, SiteMixture};
pub use transition::{FixedTransitions, TransitionCache, TransitionMatrix, TransitionProbabilities};
