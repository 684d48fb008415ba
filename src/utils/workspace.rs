//! # Workspace Pattern for Evaluation Buffers
//!
//! Pre-allocated per-site buffers for the root finalizer, so repeated
//! evaluations of the same engine do not allocate.
//!
//! ## Design Philosophy
//! The partial-likelihood arena is owned by the buffer manager; everything
//! that is scratch for a single evaluation lives here and is passed as
//! `&mut EvalWorkspace`.

/// Scratch owned by one likelihood engine
#[derive(Debug, Clone, Default)]
pub struct EvalWorkspace {
    /// Per-site log-likelihoods of the latest evaluation (weights not applied)
    pub site_ln_likelihoods: Vec<f64>,

    /// Per-site log-likelihoods at the last accepted state
    pub stored_site_ln_likelihoods: Vec<f64>,
}

impl EvalWorkspace {
    pub fn new(n_sites: usize) -> Self {
        Self {
            site_ln_likelihoods: vec![0.0; n_sites],
            stored_site_ln_likelihoods: vec![0.0; n_sites],
        }
    }

    /// Resize buffers for a new site count
    pub fn resize(&mut self, n_sites: usize) {
        self.site_ln_likelihoods.resize(n_sites, 0.0);
        self.stored_site_ln_likelihoods.resize(n_sites, 0.0);
    }

    pub fn n_sites(&self) -> usize {
        self.site_ln_likelihoods.len()
    }

    /// Remember the current site values as the accepted ones.
    pub fn keep(&mut self) {
        self.stored_site_ln_likelihoods
            .copy_from_slice(&self.site_ln_likelihoods);
    }

    /// Return to the accepted site values.
    pub fn restore(&mut self) {
        self.site_ln_likelihoods
            .copy_from_slice(&self.stored_site_ln_likelihoods);
    }
}
