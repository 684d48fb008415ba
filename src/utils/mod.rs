//! # Utilities Module
//!
//! ## Role
//! Cross-cutting helpers that don't belong in domain-specific modules.
//!
//! ## Sub-modules
//! - `special`: Gamma-function helpers for rate discretization
//! - `telemetry`: Atomic evaluation counters
//! - `threading`: Rayon thread pool configuration
//! - `workspace`: Pre-allocated buffers for zero-allocation hot paths

pub mod special;
pub mod telemetry;
pub mod threading;
pub mod workspace;
