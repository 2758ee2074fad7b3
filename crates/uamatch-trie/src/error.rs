//! Error types for trie-file operations

use thiserror::Error;

/// Error raised while parsing, walking or building a trie file
#[derive(Error, Debug)]
pub enum TrieError {
    /// Source read failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A region or record does not fit inside the file
    #[error("trie file truncated: {0}")]
    Truncated(String),

    /// A structural invariant of the format does not hold
    #[error("{0}")]
    Invariant(String),
}

/// Result type alias for trie operations
pub type Result<T> = std::result::Result<T, TrieError>;
