//! Error types for the uamatch engine
//!
//! A single error enum wraps failures from the format layer and I/O so the
//! public API surfaces one type. Missing properties are represented as
//! `None` returns, never as errors, and a match that runs out of its node
//! budget yields a degraded result rather than failing.

use thiserror::Error;

/// Main error type for uamatch operations
#[derive(Error, Debug)]
pub enum UamatchError {
    /// Data-file format failure (bad magic, truncated region, broken invariant)
    #[error(transparent)]
    Format(#[from] uamatch_format::FormatError),

    /// Source read failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Operation attempted on a dataset after `dispose`
    #[error("dataset has been disposed")]
    Disposed,

    /// The reader pool's hard cap was reached
    #[error("reader pool exhausted (cap {cap})")]
    PoolExhausted {
        /// The configured cap
        cap: usize,
    },
}

/// Result type alias for uamatch operations
pub type Result<T> = std::result::Result<T, UamatchError>;
