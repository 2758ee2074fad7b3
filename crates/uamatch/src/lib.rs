//! uamatch - device detection for HTTP User-Agents
//!
//! uamatch identifies the device and browser behind a User-Agent string by
//! matching it against a precompiled binary database of device signatures,
//! returning named properties (IsMobile, DeviceType, HardwareModel, ...)
//! for millions of concrete User-Agents.
//!
//! # Quick Start
//!
//! ```rust
//! use uamatch::Provider;
//! use uamatch_format::{
//!     ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, PropertyValueType,
//!     SignatureSpec, Version,
//! };
//!
//! // Datasets are normally published files; tests and examples build one.
//! let data = DatasetBuilder::new(Version::V32)
//!     .component(ComponentSpec::new(1, "Hardware"))
//!     .property(PropertySpec::new("IsMobile", 1, PropertyValueType::Bool))
//!     .profile(ProfileSpec::new(100, 1).value("IsMobile", "True"))
//!     .signature(SignatureSpec::new(0, vec![100]).fragment(0, "Mozilla/5.0 (Linux; Android"))
//!     .build()?;
//!
//! let provider = Provider::from_bytes_builder(data).open()?;
//! let result = provider.match_user_agent("Mozilla/5.0 (Linux; Android 5.0; SM-G900F)")?;
//! assert_eq!(result.value("IsMobile"), Some("True"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Provider (UA cache, headers, properties)    │
//! ├──────────────────────────────────────────────┤
//! │  Matcher: Exact → Numeric → Nearest →        │
//! │           Closest → None                     │
//! ├──────────────────────────────────────────────┤
//! │  Dataset: entity lists + 2-generation caches │
//! │  Pool: exclusive readers over one source     │
//! │  Source: stream / mmap / bytes               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A shared dataset is immutable after initialisation: matcher threads
//! borrow exclusive readers from the pool, entity caches take short locks,
//! and results are self-contained snapshots. [`WatchingProvider`] adds
//! hot reload by atomically swapping the whole provider when the data
//! file changes.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Two-generation record cache
pub mod cache;
/// Dataset lifecycle and record access
pub mod dataset;
/// Typed entity views (components, properties, profiles, nodes, signatures)
pub mod entities;
/// Error types
pub mod error;
/// Fixed- and variable-size record lists
mod lists;
/// The five-strategy signature matcher
pub mod matcher;
/// Reader pool
pub mod pool;
/// Provider API
pub mod provider;
/// Data sources and positioned readers
pub mod source;
/// Auto-reloading provider
pub mod watching;

pub use cache::CacheStats;
pub use dataset::{Dataset, DatasetStats};
pub use entities::{Component, DataMap, Node, Profile, Property, Signature, Value};
pub use error::{Result, UamatchError};
pub use matcher::{Match, MatchMethod};
pub use pool::{PooledReader, ReaderPool};
pub use provider::{
    Provider, ProviderOpener, ProviderOptions, ProviderStats, ProviderStatsSnapshot,
};
pub use source::{Reader, Source, SourceMode};
pub use watching::{ReloadCallback, ReloadEvent, WatchingProvider, WatchingProviderOpener};

/// Library version string
pub const UAMATCH_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses() {
        let mut parts = UAMATCH_VERSION.split('.');
        assert!(parts.next().unwrap().parse::<u32>().is_ok());
        assert!(parts.next().unwrap().parse::<u32>().is_ok());
    }
}
