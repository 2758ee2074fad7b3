//! Binary data-file format for the uamatch device-detection engine
//!
//! This crate owns the **format level** of a uamatch data file: the header,
//! the fixed-size record structs, the layout constants for variable-size
//! records, structural validation of untrusted files, and a builder that
//! serializes complete files.
//!
//! The engine crate (`uamatch`) interprets records as live entities and
//! runs the matching pipeline; this crate knows only about bytes, offsets
//! and counts.
//!
//! # Format Overview
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Data File                              │
//! ├─────────────────────────────────────────┤
//! │  1. Header (magic, version, regions)    │
//! │  2. Strings (length-prefixed)           │
//! │  3. Components / Maps / Properties /    │
//! │     Values (fixed-size records)         │
//! │  4. Profiles (variable + offset index)  │
//! │  5. Signatures (+ index in v3.2)        │
//! │  6. RankedSignatureIndexes              │
//! │  7. Nodes (variable + offset index)     │
//! │  8. Per-property value ranges           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Two versions are read: 3.2 (variable signatures, numeric node children)
//! and 3.1 (fixed-stride signatures, no numeric children). The builder can
//! emit either.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Data-file builder
pub mod builder;
/// Error types
pub mod error;
/// Header, record structs and layout constants
pub mod layout;
/// Structural validation of untrusted files
pub mod validation;

pub use builder::{
    ComponentSpec, DatasetBuilder, Fragment, ProfileSpec, PropertySpec, SignatureSpec,
};
pub use error::{FormatError, Result};
pub use layout::{
    ComponentRecord, Header, MapRecord, NodeChildRecord, NodeNumericChildRecord, PropertyRecord,
    PropertyValueType, ValueRangeRecord, ValueRecord, Version, HEADER_LEN_V31, HEADER_LEN_V32,
    MAGIC, NODE_MID_LEN, NODE_PREFIX_LEN, NONE_OFFSET, PROFILE_HEADER_LEN,
    SIGNATURE_HEADER_LEN_V32, STRING_PREFIX_LEN,
};
pub use validation::{validate, validate_collecting};
