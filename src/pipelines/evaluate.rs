//! # Tree Evaluation Pipeline
//!
//! Scores every tree of a Newick file against one alignment.
//!
//! ## Flow
//! ```text
//! Newick ──▶ Vec<Tree> ─┐
//!                       ├─▶ one NucleotideCtmc per tree (rayon) ─▶ lnL per tree
//! FASTA ──▶ CharacterMatrix (optionally pattern-compressed) ─┘
//! ```
//! Trees are independent, so they are scored in parallel. The alignment is
//! shared behind an `Arc`; each model owns its own partial buffers.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info_span, instrument};

use crate::config::{Config, ModelChoice};
use crate::data::{CharacterMatrix, Tree};
use crate::error::{FelsenError, Result};
use crate::io::{fasta, newick};
use crate::model::{NucleotideCtmc, RateMatrix, SiteMixture};
use crate::utils::telemetry::{format_duration, EvalCounters};

/// Score for one input tree.
#[derive(Debug, Clone)]
pub struct TreeResult {
    /// Position of the tree in the input file, from zero.
    pub index: usize,
    pub ln_likelihood: f64,
    /// Per-site values, present when requested on the command line.
    pub site_ln_likelihoods: Option<Vec<f64>>,
}

pub struct EvaluationPipeline {
    config: Config,
    counters: Arc<EvalCounters>,
}

impl EvaluationPipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            counters: EvalCounters::new(),
        }
    }

    pub fn counters(&self) -> &Arc<EvalCounters> {
        &self.counters
    }

    /// Read the inputs, score every tree and print the results to stdout.
    pub fn run(&mut self) -> Result<Vec<TreeResult>> {
        let start = Instant::now();

        eprintln!("Loading trees...");
        let trees = newick::read_trees(&self.config.tree)?;
        eprintln!("Loaded {} tree(s)", trees.len());

        eprintln!("Loading alignment...");
        let data = fasta::read_alignment(&self.config.alignment)?;
        eprintln!("Loaded {} taxa x {} sites", data.n_taxa(), data.n_sites());

        let results = self.evaluate(trees, data)?;

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.write_results(&results, &mut out)?;
        out.flush()?;

        eprintln!("{}", self.counters.snapshot());
        eprintln!(
            "Scored {} tree(s) in {}",
            results.len(),
            format_duration(start.elapsed().as_secs_f64())
        );
        Ok(results)
    }

    /// Score already-loaded trees against an alignment.
    #[instrument(skip_all, fields(n_trees = trees.len(), n_sites = tracing::field::Empty))]
    pub fn evaluate(&self, trees: Vec<Tree>, data: CharacterMatrix) -> Result<Vec<TreeResult>> {
        let data = if self.config.compress_patterns {
            let compressed = data.compress_patterns();
            eprintln!(
                "Compressed {} sites into {} patterns",
                data.n_sites(),
                compressed.n_sites()
            );
            compressed
        } else {
            data
        };
        tracing::Span::current().record("n_sites", data.n_sites());

        let rate_matrix = self.rate_matrix(&data)?;
        let mixture = self.site_mixture()?;
        let settings = self.config.likelihood_settings();
        let data = Arc::new(data);
        let keep_sites = self.config.site_likelihoods;

        trees
            .into_par_iter()
            .enumerate()
            .map(|(index, tree)| {
                info_span!("score_tree", index).in_scope(|| -> Result<TreeResult> {
                    let mut model = NucleotideCtmc::new(
                        tree,
                        Arc::clone(&data),
                        rate_matrix.clone(),
                        mixture.clone(),
                        settings,
                    )?
                    .with_counters(Arc::clone(&self.counters));
                    let ln_likelihood = model.ln_probability()?;
                    tracing::debug!(index, ln_likelihood, backend = model.backend_name(), "tree scored");
                    Ok(TreeResult {
                        index,
                        ln_likelihood,
                        site_ln_likelihoods: keep_sites
                            .then(|| model.site_log_likelihoods().to_vec()),
                    })
                })
            })
            .collect()
    }

    /// One `tree<TAB>lnL` line per tree, followed by site lines when present.
    pub fn write_results<W: Write>(&self, results: &[TreeResult], out: &mut W) -> Result<()> {
        writeln!(out, "tree\tlnL")?;
        for r in results {
            writeln!(out, "{}\t{:.6}", r.index + 1, r.ln_likelihood)?;
        }
        for r in results {
            if let Some(sites) = &r.site_ln_likelihoods {
                let line: Vec<String> = sites.iter().map(|s| format!("{:.6}", s)).collect();
                writeln!(out, "sites{}\t{}", r.index + 1, line.join("\t"))?;
            }
        }
        Ok(())
    }

    /// Build the substitution model named on the command line.
    pub fn rate_matrix(&self, data: &CharacterMatrix) -> Result<RateMatrix<4>> {
        let frequencies = self.frequencies(data)?;
        let config = &self.config;
        let q = match config.model {
            ModelChoice::Jc69 => {
                if config.frequencies.is_some() || config.empirical_frequencies {
                    tracing::warn!("JC69 ignores base frequencies; use F81 for unequal frequencies");
                }
                RateMatrix::jc69()
            }
            ModelChoice::F81 => RateMatrix::f81(frequencies),
            ModelChoice::Hky => RateMatrix::hky(config.kappa, frequencies),
            ModelChoice::Tim => RateMatrix::tim(self.exchangeabilities([1.0; 4])?, frequencies),
            ModelChoice::Gtr => RateMatrix::gtr(self.exchangeabilities([1.0; 6])?, frequencies),
        };
        if !q.is_valid() {
            return Err(FelsenError::config(format!(
                "{:?} parameters do not define a valid rate matrix",
                config.model
            )));
        }
        Ok(q)
    }

    fn exchangeabilities<const R: usize>(&self, default: [f64; R]) -> Result<[f64; R]> {
        match &self.config.exchangeabilities {
            None => Ok(default),
            Some(given) => <[f64; R]>::try_from(given.as_slice()).map_err(|_| {
                FelsenError::config(format!("expected {} exchangeabilities, got {}", R, given.len()))
            }),
        }
    }

    fn frequencies(&self, data: &CharacterMatrix) -> Result<[f64; 4]> {
        let as_array = |values: &[f64]| {
            <[f64; 4]>::try_from(values)
                .map_err(|_| FelsenError::config("expected 4 base frequencies"))
        };
        if self.config.empirical_frequencies {
            let frequencies = as_array(&data.empirical_frequencies())?;
            if frequencies.iter().any(|&f| f <= 0.0) {
                return Err(FelsenError::config(format!(
                    "empirical frequencies contain an unobserved state: {:?}",
                    frequencies
                )));
            }
            eprintln!("Empirical frequencies: {:.4?}", frequencies);
            return Ok(frequencies);
        }
        match &self.config.frequencies {
            Some(given) => as_array(given),
            None => Ok([0.25; 4]),
        }
    }

    /// Gamma categories when a shape is given, otherwise the listed rates
    /// with weights normalized to sum to one.
    pub fn site_mixture(&self) -> Result<SiteMixture> {
        if let Some(alpha) = self.config.gamma_alpha {
            let mixture = SiteMixture::gamma(
                alpha,
                self.config.gamma_categories,
                self.config.gamma_discretization,
            )
            .map_err(|e| FelsenError::config(e.to_string()))?;
            tracing::debug!(alpha, rates = ?mixture.rates(), "discretized gamma rates");
            return Ok(mixture);
        }
        let rates = self.config.rates.clone();
        let mixture = match &self.config.weights {
            None => SiteMixture::equal_weights(rates)?,
            Some(weights) => {
                let total: f64 = weights.iter().sum();
                if !(total.is_finite() && total > 0.0) {
                    return Err(FelsenError::config("category weights must have a positive sum"));
                }
                SiteMixture::new(rates, weights.iter().map(|w| w / total).collect())?
            }
        };
        if !mixture.is_valid() {
            return Err(FelsenError::config(format!(
                "invalid rate categories: rates {:?}, weights {:?}",
                mixture.rates(),
                mixture.weights()
            )));
        }
        Ok(mixture)
    }
}
