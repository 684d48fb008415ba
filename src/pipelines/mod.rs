//! # Pipeline Module
//!
//! High-level orchestration: reads the inputs named on the command line,
//! builds the models and reports the results.

pub mod evaluate;

pub use evaluate::{EvaluationPipeline, TreeResult};
