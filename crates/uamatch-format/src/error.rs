//! Error types for data-file format operations

use thiserror::Error;

/// Error raised while parsing, validating or building a data file
#[derive(Error, Debug)]
pub enum FormatError {
    /// File does not start with the expected magic bytes
    #[error("invalid magic bytes (not a uamatch data file)")]
    BadMagic,

    /// Version field is not one of the supported format versions
    #[error("unsupported format version {major}.{minor}")]
    UnsupportedVersion {
        /// Major version read from the header
        major: u16,
        /// Minor version read from the header
        minor: u16,
    },

    /// A region declared by the header does not fit inside the file
    #[error("{region} region out of bounds (offset {offset}, len {len}, file {file_len})")]
    RegionOutOfBounds {
        /// Region name
        region: &'static str,
        /// Declared region offset
        offset: u64,
        /// Declared region byte length
        len: u64,
        /// Total file length
        file_len: u64,
    },

    /// A record could not be read in full from its region
    #[error("truncated record in {region} region at offset {offset}")]
    TruncatedRecord {
        /// Region name
        region: &'static str,
        /// Byte offset of the record within the region
        offset: u64,
    },

    /// An index or offset points outside the entity list it refers to
    #[error("dangling reference: {0}")]
    DanglingReference(String),

    /// A structural invariant of the format does not hold
    #[error("{0}")]
    Invariant(String),
}

/// Result type alias for format operations
pub type Result<T> = std::result::Result<T, FormatError>;
