//! # Threading Configuration
//!
//! Rayon pools for the binary and for callers that want likelihood work
//! kept off the global pool.

use crate::error::{FelsenError, Result};

/// Create a configured thread pool.
pub fn build_thread_pool(n_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("felsen-worker-{}", i))
        .build()
        .map_err(|e| FelsenError::config(format!("Failed to create thread pool: {}", e)))
}

/// Configure the global pool. A pool that is already configured is kept.
pub fn configure_global_pool(n_threads: usize) {
    if rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("felsen-worker-{}", i))
        .build_global()
        .is_err()
    {
        tracing::debug!("global rayon pool already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_has_requested_threads() {
        let pool = build_thread_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        let name = pool.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.unwrap().starts_with("felsen-worker-"));
    }
}
