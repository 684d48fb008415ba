//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.
//!
//! Only structural and data faults surface here. A parameter state that
//! merely makes the model impossible (negative branch length, off-simplex
//! frequencies, underflow to zero) is not an error: the engine reports it
//! as a log-likelihood of negative infinity.

use thiserror::Error;

/// Main error type for felsen operations
#[derive(Error, Debug)]
pub enum FelsenError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data errors (bad state codes, malformed trees, missing taxa)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Algorithm errors (dimension mismatches between engine and inputs)
    #[error("Algorithm error: {message}")]
    Algorithm { message: String },

    /// Configuration errors (invalid CLI arguments or settings)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Parse errors
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Errors bubbled up from the input readers
    #[error(transparent)]
    Input(#[from] anyhow::Error),
}

/// Type alias for Results using FelsenError
pub type Result<T> = std::result::Result<T, FelsenError>;

impl FelsenError {
    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create an algorithm error
    pub fn algorithm(message: impl Into<String>) -> Self {
        Self::Algorithm {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
