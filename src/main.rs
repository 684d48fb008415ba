//! # Felsen: Phylogenetic Likelihood Evaluation
//!
//! Scores the trees of a Newick file against a nucleotide alignment.
//!
//! ## Usage
//! ```bash
//! # JC69 on every tree in trees.nwk
//! felsen --tree trees.nwk --alignment aln.fa
//!
//! # HKY with observed base frequencies and four rate categories
//! felsen -t trees.nwk -a aln.fa.gz --model hky --kappa 4 --empirical-frequencies \
//!     --rates 0.14,0.47,1.0,2.39
//!
//! # With profiling output
//! felsen -t trees.nwk -a aln.fa --profile
//! ```

use std::time::Instant;

use felsen::config::Config;
use felsen::pipelines::EvaluationPipeline;
use felsen::utils::threading::configure_global_pool;
use felsen::Result;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber for hierarchical profiling output
fn init_profiling() {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_timer(fmt::time::uptime()),
        )
        .init();
}

fn run() -> Result<()> {
    let start = Instant::now();

    let config = Config::parse_and_validate()?;

    if config.profile {
        init_profiling();
        eprintln!("=== Profiling enabled ===\n");
    }

    let n_threads = config.nthreads();
    configure_global_pool(n_threads);

    eprintln!("Felsen v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Threads: {}", n_threads);
    eprintln!("Model: {:?}", config.model);
    eprintln!("Trees: {:?}", config.tree);
    eprintln!("Alignment: {:?}", config.alignment);

    let mut pipeline = EvaluationPipeline::new(config);
    pipeline.run()?;

    eprintln!("\nCompleted in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use felsen::{config, data, error, io, model, pipelines};

    #[test]
    fn test_module_imports() {
        let _ = config::Config::parse_and_validate;
        let _ = error::FelsenError::config("test");
        let _ = data::Tree::caterpillar;
        let _ = io::newick::parse_newick;
        let _ = model::RateMatrix::jc69;
        let _ = pipelines::EvaluationPipeline::new;
    }
}
