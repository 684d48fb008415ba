//! # Felsen Library
//!
//! Log-likelihood of aligned characters under a continuous-time Markov
//! chain on a phylogenetic tree, computed with Felsenstein's pruning
//! algorithm and cached for MCMC-style incremental updates.
//!
//! ## Modules
//! - `config`: CLI argument parsing and likelihood settings
//! - `data`: Trees and character matrices
//! - `error`: Error types and result aliases
//! - `io`: File reading (Newick, FASTA)
//! - `model`: Rate matrices, partial likelihoods and the pruning engine
//! - `pipelines`: High-level workflow orchestration
//! - `utils`: Shared utilities (counters, thread pools, workspace)
//!
//! ## Module Structure
//! ```text
//! src/
//! ├── config.rs          LikelihoodSettings, clap Config
//! ├── data/
//! │   ├── tree.rs        Rooted tree, post-order, path to root
//! │   └── characters.rs  Observations, CharacterMatrix, pattern compression
//! ├── io/
//! │   ├── newick.rs
//! │   └── fasta.rs
//! ├── model/
//! │   ├── rate_matrix.rs Reversible Q and P(t) by eigendecomposition
//! │   ├── transition.rs  Per-branch P cache
//! │   ├── partials.rs    Double-buffered partial likelihoods
//! │   ├── tips.rs        Tip initialization
//! │   ├── combine.rs     Internal-node combination
//! │   ├── scaling.rs     Underflow rescaling
//! │   ├── kernel.rs      Scalar and SIMD inner loops
//! │   ├── likelihood.rs  Post-order evaluation, root finalization
//! │   ├── site_mixture.rs Rate categories, discretized Gamma, root frequencies
//! │   ├── phylo_ctmc.rs  Propose / accept / reject model
//! │   └── simulate.rs    Alignment simulation
//! ├── pipelines/
//! │   └── evaluate.rs    Score trees against an alignment
//! └── utils/
//!     └── special.rs     ln Γ, incomplete gamma, Gamma quantile
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod model;
pub mod pipelines;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, LikelihoodSettings};
pub use data::{CharacterMatrix, NodeIdx, Observation, StateSet, Tree};
pub use error::{FelsenError, Result};
pub use model::{
    LikelihoodEngine, NucleotideCtmc, PhyloCtmc, RateMatrix, RootFrequencies, SiteMixture,
};
pub use pipelines::EvaluationPipeline;
