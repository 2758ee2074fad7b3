//! Provider API
//!
//! [`Provider`] composes a dataset with the matcher and a shared LRU result
//! cache, and is the primary entry point for detection:
//!
//! ```no_run
//! use uamatch::Provider;
//!
//! let provider = Provider::from("devices.uamd").memory_mode().open()?;
//! let result = provider.match_user_agent(
//!     "Mozilla/5.0 (Linux; Android 5.0; SAMSUNG SM-G900F Build/LRX21T)",
//! )?;
//! if result.value("IsMobile") == Some("True") {
//!     println!("mobile device: {:?}", result.value("HardwareModel"));
//! }
//! # Ok::<(), uamatch::UamatchError>(())
//! ```
//!
//! Configuration goes through the fluent opener or a string map
//! ([`ProviderOptions::from_map`]); unrecognised keys warn and are
//! otherwise ignored.

use crate::dataset::{Dataset, DatasetStats};
use crate::entities::{Component, Property};
use crate::error::{Result, UamatchError};
use crate::matcher::{Match, MatchMethod, Matcher};
use crate::source::{Source, SourceMode};
use lru::LruCache;
use rustc_hash::FxHasher;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Default capacity of the per-UA result cache
const DEFAULT_MATCH_CACHE_CAPACITY: usize = 10_000;

type MatchCacheMap = LruCache<String, Arc<Match>, BuildHasherDefault<FxHasher>>;

/// Thread-safe match counters shared across provider clones
#[derive(Debug, Default)]
pub struct ProviderStats {
    /// Total `match_*` calls
    pub total_matches: AtomicU64,
    /// Results served from the UA cache
    pub cache_hits: AtomicU64,
    /// Distinct UAs inserted into the cache
    pub cache_misses: AtomicU64,
    /// Matches resolved per strategy
    pub exact: AtomicU64,
    /// Numeric-strategy matches
    pub numeric: AtomicU64,
    /// Nearest-strategy matches
    pub nearest: AtomicU64,
    /// Closest-strategy matches
    pub closest: AtomicU64,
    /// Default-profile results
    pub none: AtomicU64,
}

/// Point-in-time snapshot of [`ProviderStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStatsSnapshot {
    /// Total `match_*` calls
    pub total_matches: u64,
    /// Results served from the UA cache
    pub cache_hits: u64,
    /// Distinct UAs inserted into the cache
    pub cache_misses: u64,
    /// Exact-strategy matches
    pub exact: u64,
    /// Numeric-strategy matches
    pub numeric: u64,
    /// Nearest-strategy matches
    pub nearest: u64,
    /// Closest-strategy matches
    pub closest: u64,
    /// Default-profile results
    pub none: u64,
}

impl ProviderStats {
    fn snapshot(&self) -> ProviderStatsSnapshot {
        ProviderStatsSnapshot {
            total_matches: self.total_matches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            exact: self.exact.load(Ordering::Relaxed),
            numeric: self.numeric.load(Ordering::Relaxed),
            nearest: self.nearest.load(Ordering::Relaxed),
            closest: self.closest.load(Ordering::Relaxed),
            none: self.none.load(Ordering::Relaxed),
        }
    }
}

impl ProviderStatsSnapshot {
    /// Cache hit rate in [0, 1]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Options for opening a provider
///
/// Field names mirror the configuration keys recognised by
/// [`ProviderOptions::from_map`].
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Path to the data file
    pub path: Option<PathBuf>,
    /// In-memory data bytes; takes precedence over `path`
    pub bytes: Option<Vec<u8>>,
    /// Memory-map the file instead of streaming reads
    pub memory_mode: bool,
    /// UA result cache capacity; `Some(0)` disables, `None` uses default
    pub cache_capacity: Option<usize>,
    /// Headers consulted, in order, when matching a header map
    pub override_headers: Vec<String>,
    /// Node-evaluation budget per match; `None` is unlimited
    pub node_evaluation_budget: Option<u64>,
    /// Recognised but inert; data updates are delivered out of band
    pub auto_update: bool,
    /// Recognised but inert without `auto_update` machinery
    pub licence_key: Option<String>,
    /// Service interval; reused as the reload debounce by the watcher
    pub cache_service_interval: Duration,
    /// Delete the data file when the dataset is dropped
    pub temporary_file: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            path: None,
            bytes: None,
            memory_mode: false,
            cache_capacity: None,
            override_headers: vec!["User-Agent".to_string()],
            node_evaluation_budget: None,
            auto_update: false,
            licence_key: None,
            cache_service_interval: Duration::from_secs(1),
            temporary_file: false,
        }
    }
}

impl ProviderOptions {
    /// Build options from string configuration
    ///
    /// Recognised keys: `binaryFilePath`, `memoryMode`, `autoUpdate`,
    /// `licenceKey`, `cacheServiceInterval` (seconds),
    /// `overrideUserAgentHeaders` (comma separated),
    /// `nodeEvaluationBudget`. Unknown keys warn and are ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "binaryFilePath" => options.path = Some(PathBuf::from(value)),
                "memoryMode" => options.memory_mode = value.eq_ignore_ascii_case("true"),
                "autoUpdate" => {
                    options.auto_update = value.eq_ignore_ascii_case("true");
                    if options.auto_update {
                        warn!("autoUpdate is recognised but licence-key downloads are not performed");
                    }
                }
                "licenceKey" => options.licence_key = Some(value.clone()),
                "cacheServiceInterval" => match value.parse::<u64>() {
                    Ok(seconds) => {
                        options.cache_service_interval = Duration::from_secs(seconds)
                    }
                    Err(_) => warn!(value, "cacheServiceInterval is not a number of seconds"),
                },
                "overrideUserAgentHeaders" => {
                    options.override_headers = value
                        .split(',')
                        .map(|header| header.trim().to_string())
                        .filter(|header| !header.is_empty())
                        .collect();
                }
                "nodeEvaluationBudget" => match value.parse::<u64>() {
                    Ok(budget) => options.node_evaluation_budget = Some(budget),
                    Err(_) => warn!(value, "nodeEvaluationBudget is not a number"),
                },
                unknown => warn!(key = unknown, "unknown configuration key ignored"),
            }
        }
        options
    }
}

/// Fluent builder for opening providers
///
/// Created via [`Provider::from`] or [`Provider::from_bytes_builder`].
pub struct ProviderOpener {
    options: ProviderOptions,
}

impl ProviderOpener {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            options: ProviderOptions {
                path: Some(path.into()),
                ..Default::default()
            },
        }
    }

    /// Memory-map the data file instead of streaming reads
    pub fn memory_mode(mut self) -> Self {
        self.options.memory_mode = true;
        self
    }

    /// Set the UA result cache capacity
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.options.cache_capacity = Some(capacity);
        self
    }

    /// Disable the UA result cache
    pub fn no_cache(mut self) -> Self {
        self.options.cache_capacity = Some(0);
        self
    }

    /// Headers consulted, in order, by [`Provider::match_headers`]
    pub fn override_headers(mut self, headers: Vec<String>) -> Self {
        self.options.override_headers = headers;
        self
    }

    /// Cap node evaluations per match; exceeding it yields a best-effort
    /// result with `is_complete` cleared
    pub fn node_evaluation_budget(mut self, budget: u64) -> Self {
        self.options.node_evaluation_budget = Some(budget);
        self
    }

    /// Delete the data file when the dataset is dropped
    pub fn temporary(mut self) -> Self {
        self.options.temporary_file = true;
        self
    }

    /// Open the provider
    pub fn open(self) -> Result<Provider> {
        Provider::open_with_options(self.options)
    }
}

/// Device-detection provider over one immutable dataset
///
/// `Send + Sync`; wrap in `Arc` to share across matcher threads.
pub struct Provider {
    dataset: Arc<Dataset>,
    cache: Option<Mutex<MatchCacheMap>>,
    override_headers: Vec<String>,
    node_evaluation_budget: Option<u64>,
    stats: Arc<ProviderStats>,
}

impl Provider {
    /// Open a provider for the data file at `path`
    pub fn from(path: impl Into<PathBuf>) -> ProviderOpener {
        ProviderOpener::new(path)
    }

    /// Open a provider over in-memory data bytes
    pub fn from_bytes_builder(bytes: Vec<u8>) -> ProviderOpener {
        ProviderOpener {
            options: ProviderOptions {
                bytes: Some(bytes),
                ..Default::default()
            },
        }
    }

    /// Open with explicit options (lower-level API)
    pub fn open_with_options(options: ProviderOptions) -> Result<Provider> {
        let dataset = if let Some(bytes) = options.bytes {
            Dataset::from_bytes(bytes)?
        } else if let Some(path) = &options.path {
            let mode = if options.memory_mode {
                SourceMode::Memory
            } else {
                SourceMode::Stream
            };
            let mut source = match mode {
                SourceMode::Stream => Source::stream(path)?,
                SourceMode::Memory => Source::memory_mapped(path)?,
            };
            if options.temporary_file {
                source.mark_temporary();
            }
            Dataset::from_source(source, mode)?
        } else {
            return Err(UamatchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "neither binaryFilePath nor data bytes configured",
            )));
        };

        let capacity = match options.cache_capacity {
            Some(0) => None,
            Some(capacity) => Some(capacity),
            None => Some(DEFAULT_MATCH_CACHE_CAPACITY),
        };
        let cache = capacity.map(|capacity| {
            Mutex::new(LruCache::with_hasher(
                NonZeroUsize::new(capacity).expect("capacity is nonzero"),
                BuildHasherDefault::<FxHasher>::default(),
            ))
        });

        Ok(Provider {
            dataset: Arc::new(dataset),
            cache,
            override_headers: options.override_headers,
            node_evaluation_budget: options.node_evaluation_budget,
            stats: Arc::new(ProviderStats::default()),
        })
    }

    /// Match a User-Agent string
    ///
    /// Results are cached by UA; a cache hit returns a clone of the
    /// earlier result. The matcher never comes back empty-handed: when
    /// nothing applies the default-profile result carries `Method=None`.
    pub fn match_user_agent(&self, user_agent: &str) -> Result<Match> {
        self.dataset.check_open()?;
        self.stats.total_matches.fetch_add(1, Ordering::Relaxed);

        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = guard.get(user_agent) {
                let result = Match::clone(hit);
                drop(guard);
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(result);
            }
        }

        let result =
            Matcher::new(&self.dataset, self.node_evaluation_budget).match_user_agent(user_agent)?;
        self.count_method(result.method);

        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            // A key's first insert is the miss; racing computations of the
            // same UA count once.
            if guard
                .put(user_agent.to_string(), Arc::new(result.clone()))
                .is_none()
            {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(result)
    }

    /// Match from HTTP headers
    ///
    /// The first configured override header present wins (header names
    /// compare case-insensitively); with none present an empty UA yields
    /// the default-profile result.
    pub fn match_headers<'a>(
        &self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Match> {
        let headers: Vec<(&str, &str)> = headers.into_iter().collect();
        for name in &self.override_headers {
            if let Some((_, value)) = headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
            {
                return self.match_user_agent(value);
            }
        }
        self.match_user_agent("")
    }

    /// Match from HTTP headers, then apply explicit property overrides
    ///
    /// Override logic only runs for a caller-supplied map; plain
    /// [`Provider::match_headers`] never alters matched values.
    pub fn match_headers_with_overrides<'a>(
        &self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        overrides: &HashMap<String, String>,
    ) -> Result<Match> {
        let mut result = self.match_headers(headers)?;
        for (name, value) in overrides {
            result.override_value(name, value.clone());
        }
        Ok(result)
    }

    /// Re-resolve a stored DeviceId to its profiles
    pub fn match_device_id(&self, device_id: &str) -> Result<Match> {
        let mut profiles = Vec::new();
        for part in device_id.split('-') {
            let profile_id: u32 = part.parse().map_err(|_| {
                uamatch_format::FormatError::DanglingReference(format!(
                    "device id segment {part:?} is not a profile id"
                ))
            })?;
            let profile = self.dataset.profile_by_id(profile_id)?.ok_or_else(|| {
                uamatch_format::FormatError::DanglingReference(format!(
                    "unknown profile id {profile_id}"
                ))
            })?;
            profiles.push(profile);
        }
        Matcher::new(&self.dataset, self.node_evaluation_budget)
            .match_profiles(device_id, profiles)
    }

    /// Property by name; absent names return `None`, never an error
    pub fn property(&self, name: &str) -> Option<Arc<Property>> {
        self.dataset.property_by_name(name)
    }

    /// Every property, grouped by component
    pub fn properties(&self) -> &[Arc<Property>] {
        self.dataset.properties()
    }

    /// Every component, ascending by id
    pub fn components(&self) -> &[Arc<Component>] {
        self.dataset.components()
    }

    /// The underlying dataset
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Match counter snapshot
    pub fn stats(&self) -> ProviderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Record-cache and pool counter snapshot
    pub fn dataset_stats(&self) -> DatasetStats {
        self.dataset.stats()
    }

    /// Dispose the dataset; subsequent matches fail with `Disposed`
    pub fn dispose(&self) {
        self.dataset.dispose();
    }

    fn count_method(&self, method: MatchMethod) {
        let counter = match method {
            MatchMethod::Exact => &self.stats.exact,
            MatchMethod::Numeric => &self.stats.numeric,
            MatchMethod::Nearest => &self.stats.nearest,
            MatchMethod::Closest => &self.stats.closest,
            MatchMethod::None => &self.stats.none,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn from_map_recognises_documented_keys() {
        let options = ProviderOptions::from_map(&map(&[
            ("binaryFilePath", "/data/devices.uamd"),
            ("memoryMode", "true"),
            ("cacheServiceInterval", "5"),
            ("overrideUserAgentHeaders", "X-Device-UA, User-Agent"),
            ("nodeEvaluationBudget", "2500"),
        ]));
        assert_eq!(options.path.as_deref(), Some(std::path::Path::new("/data/devices.uamd")));
        assert!(options.memory_mode);
        assert_eq!(options.cache_service_interval, Duration::from_secs(5));
        assert_eq!(
            options.override_headers,
            vec!["X-Device-UA".to_string(), "User-Agent".to_string()]
        );
        assert_eq!(options.node_evaluation_budget, Some(2500));
    }

    #[test]
    fn from_map_ignores_unknown_keys() {
        let options = ProviderOptions::from_map(&map(&[("shinyNewOption", "yes")]));
        assert_eq!(options.override_headers, vec!["User-Agent".to_string()]);
        assert!(!options.memory_mode);
    }

    #[test]
    fn from_map_defaults_survive_bad_numbers() {
        let options = ProviderOptions::from_map(&map(&[
            ("cacheServiceInterval", "soon"),
            ("nodeEvaluationBudget", "lots"),
        ]));
        assert_eq!(options.cache_service_interval, Duration::from_secs(1));
        assert_eq!(options.node_evaluation_budget, None);
    }

    #[test]
    fn opening_without_a_source_fails() {
        assert!(Provider::open_with_options(ProviderOptions::default()).is_err());
    }
}
