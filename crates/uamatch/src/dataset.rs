//! Dataset lifecycle and record access
//!
//! A [`Dataset`] owns the source, the reader pool, and one list per
//! entity region. Small regions (components, maps, properties, value
//! ranges, the profile-id index) are loaded eagerly at init; the heavy
//! regions (strings, values, profiles, signatures, nodes) are read on
//! demand through two-generation caches.
//!
//! The lifecycle is one-way: `Created -> Initialised -> Disposed`. Using a
//! disposed dataset fails with [`UamatchError::Disposed`]. Disposal drains
//! the pool and clears the caches; a source marked temporary deletes its
//! file when the dataset drops.

use crate::cache::{CacheStats, TwoGenerationCache};
use crate::entities::{Component, DataMap, Node, Profile, Property, Signature, Value};
use crate::error::{Result, UamatchError};
use crate::lists::{CachedFixedList, CachedVariableList, FixedList, VariableList};
use crate::pool::ReaderPool;
use crate::source::{Source, SourceMode};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use uamatch_format::{FormatError, Header, Version, NONE_OFFSET, STRING_PREFIX_LEN};

const STRING_CACHE_CAPACITY: usize = 4096;
const VALUE_CACHE_CAPACITY: usize = 1024;
const PROFILE_CACHE_CAPACITY: usize = 512;
const SIGNATURE_CACHE_CAPACITY: usize = 2048;
const NODE_CACHE_CAPACITY: usize = 8192;

/// Length-prefixed strings region with its own cache
struct Strings {
    region_offset: u64,
    byte_len: u32,
    pool: Arc<ReaderPool>,
    cache: TwoGenerationCache<u32, String>,
}

impl Strings {
    fn get(&self, offset: u32) -> Result<Arc<String>> {
        self.cache.get_or_try_insert_with(offset, || {
            if offset as usize + STRING_PREFIX_LEN > self.byte_len as usize {
                return Err(UamatchError::Format(FormatError::DanglingReference(
                    format!("string offset {offset} outside {}-byte region", self.byte_len),
                )));
            }
            let mut reader = self.pool.acquire()?;
            reader.seek(self.region_offset + offset as u64);
            let len = reader.read_u16()? as usize;
            if offset as usize + STRING_PREFIX_LEN + len > self.byte_len as usize {
                return Err(UamatchError::Format(FormatError::TruncatedRecord {
                    region: "strings",
                    offset: offset as u64,
                }));
            }
            let bytes = reader.read_bytes(len)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
    }
}

/// Counter snapshot across the dataset's record caches and pool
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetStats {
    /// Strings cache counters
    pub strings: CacheStats,
    /// Values cache counters
    pub values: CacheStats,
    /// Profiles cache counters
    pub profiles: CacheStats,
    /// Signatures cache counters
    pub signatures: CacheStats,
    /// Nodes cache counters
    pub nodes: CacheStats,
    /// Readers created over the pool's lifetime
    pub readers_created: u64,
    /// Readers currently queued
    pub readers_queued: usize,
}

/// An initialised, immutable device-detection dataset
pub struct Dataset {
    header: Header,
    mode: SourceMode,
    source: Arc<Source>,
    pool: Arc<ReaderPool>,

    strings: Strings,
    components: Vec<Arc<Component>>,
    maps: Vec<DataMap>,
    properties: Vec<Arc<Property>>,
    /// (name, property index), sorted by name for binary search
    property_names: Vec<(String, u32)>,
    value_ranges: Vec<(u32, u32)>,
    /// (profile id, profile offset), sorted by id
    profile_ids: Vec<(u32, u32)>,

    values: CachedFixedList<Value>,
    profiles: CachedVariableList<Profile>,
    nodes: CachedVariableList<Node>,
    signatures: TwoGenerationCache<u32, Signature>,

    disposed: AtomicBool,
}

impl Dataset {
    /// Open a dataset from a file in the given mode
    pub fn open_path(path: impl AsRef<Path>, mode: SourceMode) -> Result<Self> {
        let source = match mode {
            SourceMode::Stream => Source::stream(path)?,
            SourceMode::Memory => Source::memory_mapped(path)?,
        };
        Self::from_source(source, mode)
    }

    /// Open a dataset over an owned byte buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_source(Source::from_bytes(bytes), SourceMode::Memory)
    }

    /// Open a dataset over a prepared source
    pub fn from_source(source: Source, mode: SourceMode) -> Result<Self> {
        let source = Arc::new(source);
        let pool = Arc::new(ReaderPool::new(Arc::clone(&source), None));

        let header = {
            let mut reader = pool.acquire()?;
            let len = (source.len() as usize).min(uamatch_format::HEADER_LEN_V32);
            let bytes = reader.read_bytes(len)?;
            Header::parse(&bytes)?
        };
        check_regions(&header, source.len())?;

        let strings = Strings {
            region_offset: header.strings_offset as u64,
            byte_len: header.strings_byte_len,
            pool: Arc::clone(&pool),
            cache: TwoGenerationCache::new(STRING_CACHE_CAPACITY),
        };

        // Init phase: small regions and cross-reference indexes.
        let mut components = Vec::with_capacity(header.component_count as usize);
        {
            let mut reader = pool.acquire()?;
            for index in 0..header.component_count {
                reader.seek(header.components_offset as u64 + index as u64 * 16);
                let component = Component::read(&mut reader, |offset| strings.get(offset))?;
                components.push(Arc::new(component));
            }
        }

        let mut maps = Vec::with_capacity(header.map_count as usize);
        {
            let mut reader = pool.acquire()?;
            for index in 0..header.map_count {
                reader.seek(header.maps_offset as u64 + index as u64 * 8);
                let name_offset = reader.read_u32()?;
                maps.push(DataMap {
                    name: strings.get(name_offset)?.as_ref().clone(),
                });
            }
        }

        let mut properties = Vec::with_capacity(header.property_count as usize);
        {
            let mut reader = pool.acquire()?;
            for index in 0..header.property_count {
                reader.seek(header.properties_offset as u64 + index as u64 * 48);
                let property = Property::read(&mut reader, index, |offset| strings.get(offset))?;
                properties.push(Arc::new(property));
            }
        }
        let mut property_names: Vec<(String, u32)> = properties
            .iter()
            .map(|property| (property.name.clone(), property.index))
            .collect();
        property_names.sort();

        let mut value_ranges = Vec::with_capacity(header.property_count as usize);
        {
            let mut reader = pool.acquire()?;
            reader.seek(header.value_ranges_offset as u64);
            for _ in 0..header.property_count {
                let first = reader.read_u32()?;
                let last = reader.read_u32()?;
                value_ranges.push((first, last));
            }
        }

        let values = CachedFixedList::new(
            FixedList::new(
                header.values_offset as u64,
                header.value_count,
                Arc::clone(&pool),
            ),
            VALUE_CACHE_CAPACITY,
        );
        let profiles = CachedVariableList::new(
            VariableList::new(
                header.profiles_offset as u64,
                header.profiles_byte_len,
                header.profile_count,
                Some(header.profile_index_offset as u64),
                Arc::clone(&pool),
            ),
            PROFILE_CACHE_CAPACITY,
        );
        let nodes = CachedVariableList::new(
            VariableList::new(
                header.nodes_offset as u64,
                header.nodes_byte_len,
                header.node_count,
                Some(header.node_index_offset as u64),
                Arc::clone(&pool),
            ),
            NODE_CACHE_CAPACITY,
        );

        // Init phase: one sequential pass over profiles builds the
        // profile-id -> offset index used by DeviceId resolution.
        let mut profile_ids = Vec::with_capacity(header.profile_count as usize);
        profiles.for_each(|offset, profile: Profile| {
            profile_ids.push((profile.profile_id, offset));
            Ok(())
        })?;
        profile_ids.sort_unstable();

        debug!(
            version = ?header.version,
            signatures = header.signature_count,
            nodes = header.node_count,
            profiles = header.profile_count,
            properties = header.property_count,
            "dataset initialised"
        );

        Ok(Dataset {
            header,
            mode,
            source,
            pool,
            strings,
            components,
            maps,
            properties,
            property_names,
            value_ranges,
            profile_ids,
            values,
            profiles,
            nodes,
            signatures: TwoGenerationCache::new(SIGNATURE_CACHE_CAPACITY),
            disposed: AtomicBool::new(false),
        })
    }

    /// Fail when the dataset has been disposed
    pub fn check_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(UamatchError::Disposed);
        }
        Ok(())
    }

    /// Release pooled readers and cached records
    ///
    /// One-way transition; every subsequent record access fails with
    /// [`UamatchError::Disposed`]. A temporary source's file is deleted
    /// when the dataset itself drops.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.pool.drain();
        self.strings.cache.clear();
        self.values.clear_cache();
        self.profiles.clear_cache();
        self.nodes.clear_cache();
        self.signatures.clear();
    }

    /// Data format version
    pub fn version(&self) -> Version {
        self.header.version
    }

    /// Source access mode
    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    /// The byte supply behind this dataset
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Publish date (unix seconds)
    pub fn published_unix(&self) -> i64 {
        self.header.published
    }

    /// Next scheduled data update
    pub fn next_update(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.header.next_update.max(0) as u64)
    }

    /// Shortest User-Agent the dataset can usefully match
    pub fn min_user_agent_length(&self) -> u16 {
        self.header.min_user_agent_length
    }

    /// Copyright notice
    pub fn copyright(&self) -> Result<Arc<String>> {
        self.check_open()?;
        self.strings.get(self.header.copyright_offset)
    }

    /// Resolve a strings-region offset
    pub fn string(&self, offset: u32) -> Result<Arc<String>> {
        self.check_open()?;
        self.strings.get(offset)
    }

    /// All components, ascending by id
    pub fn components(&self) -> &[Arc<Component>] {
        &self.components
    }

    /// Component by id
    pub fn component_by_id(&self, component_id: u8) -> Option<&Arc<Component>> {
        self.components
            .iter()
            .find(|component| component.component_id == component_id)
    }

    /// Data-file tier maps
    pub fn maps(&self) -> &[DataMap] {
        &self.maps
    }

    /// All properties, grouped by component
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    /// Property by name; absent names are not an error
    pub fn property_by_name(&self, name: &str) -> Option<Arc<Property>> {
        self.property_names
            .binary_search_by(|(candidate, _)| candidate.as_str().cmp(name))
            .ok()
            .map(|slot| Arc::clone(&self.properties[self.property_names[slot].1 as usize]))
    }

    /// Value index range of a property; [`NONE_OFFSET`] pair when empty
    pub fn value_range(&self, property_index: u32) -> (u32, u32) {
        self.value_ranges
            .get(property_index as usize)
            .copied()
            .unwrap_or((NONE_OFFSET, NONE_OFFSET))
    }

    /// Value by global index
    pub fn value(&self, index: u32) -> Result<Arc<Value>> {
        self.check_open()?;
        self.values.get(index)
    }

    /// Profile by profiles-region offset
    pub fn profile_at(&self, offset: u32) -> Result<Arc<Profile>> {
        self.check_open()?;
        self.profiles.get_at(offset)
    }

    /// Profile by stable profile id
    pub fn profile_by_id(&self, profile_id: u32) -> Result<Option<Arc<Profile>>> {
        self.check_open()?;
        match self
            .profile_ids
            .binary_search_by_key(&profile_id, |&(id, _)| id)
        {
            Ok(slot) => self.profile_at(self.profile_ids[slot].1).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Node by nodes-region offset
    pub fn node_at(&self, offset: u32) -> Result<Arc<Node>> {
        self.check_open()?;
        self.nodes.get_at(offset)
    }

    /// The root of the node DAG; first node in the region
    pub fn root_node(&self) -> Result<Arc<Node>> {
        self.node_at(0)
    }

    /// Number of signatures
    pub fn signature_count(&self) -> u32 {
        self.header.signature_count
    }

    /// Signature by logical index
    ///
    /// Signatures are stored ordered by their node-offset vectors, so the
    /// logical order supports binary search by node vector.
    pub fn signature(&self, index: u32) -> Result<Arc<Signature>> {
        self.check_open()?;
        self.signatures
            .get_or_try_insert_with(index, || self.read_signature(index))
    }

    fn read_signature(&self, index: u32) -> Result<Signature> {
        if index >= self.header.signature_count {
            return Err(FormatError::DanglingReference(format!(
                "signature index {index} out of {}",
                self.header.signature_count
            ))
            .into());
        }
        let mut reader = self.pool.acquire()?;
        match self.header.version {
            Version::V32 => {
                reader.seek(self.header.signature_index_offset as u64 + index as u64 * 4);
                let record_offset = reader.read_u32()?;
                reader.seek(self.header.signatures_offset as u64 + record_offset as u64);
                let node_count = reader.read_u16()?;
                let profile_count = reader.read_u16()?;
                let rank = reader.read_u32()?;
                let mut profile_offsets = Vec::with_capacity(profile_count as usize);
                for _ in 0..profile_count {
                    profile_offsets.push(reader.read_u32()?);
                }
                let mut node_offsets = Vec::with_capacity(node_count as usize);
                for _ in 0..node_count {
                    node_offsets.push(reader.read_u32()?);
                }
                Ok(Signature::new(index, node_offsets, profile_offsets, rank))
            }
            Version::V31 => {
                let stride = self.header.signature_stride_v31() as u64;
                reader.seek(self.header.signatures_offset as u64 + index as u64 * stride);
                let mut profile_offsets = Vec::new();
                for _ in 0..self.header.signature_profiles_count {
                    let offset = reader.read_u32()?;
                    if offset != NONE_OFFSET {
                        profile_offsets.push(offset);
                    }
                }
                let mut node_offsets = Vec::new();
                for _ in 0..self.header.signature_nodes_count {
                    let offset = reader.read_u32()?;
                    if offset != NONE_OFFSET {
                        node_offsets.push(offset);
                    }
                }
                let rank = reader.read_u32()?;
                Ok(Signature::new(index, node_offsets, profile_offsets, rank))
            }
        }
    }

    /// Signature index at a rank position (0 = most popular)
    pub fn ranked_signature_index(&self, rank_position: u32) -> Result<u32> {
        self.check_open()?;
        if rank_position >= self.header.signature_count {
            return Err(FormatError::DanglingReference(format!(
                "rank position {rank_position} out of {}",
                self.header.signature_count
            ))
            .into());
        }
        let mut reader = self.pool.acquire()?;
        reader.seek(self.header.ranked_signatures_offset as u64 + rank_position as u64 * 4);
        Ok(reader.read_u32()?)
    }

    /// Default profile of every component; the Method=None device
    pub fn default_profiles(&self) -> Result<Vec<Arc<Profile>>> {
        self.components
            .iter()
            .map(|component| component.default_profile(self))
            .collect()
    }

    /// Counter snapshot across caches and pool
    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            strings: self.strings.cache.stats(),
            values: self.values.cache_stats(),
            profiles: self.profiles.cache_stats(),
            signatures: self.signatures.stats(),
            nodes: self.nodes.cache_stats(),
            readers_created: self.pool.readers_created(),
            readers_queued: self.pool.readers_queued(),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use uamatch_format::{
        ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, PropertyValueType, SignatureSpec,
    };

    fn tiny_bytes() -> Vec<u8> {
        DatasetBuilder::new(Version::V32)
            .copyright("dataset tests")
            .component(ComponentSpec::new(1, "Hardware"))
            .property(
                PropertySpec::new("IsMobile", 1, PropertyValueType::Bool).default_value("False"),
            )
            .profile(ProfileSpec::new(7, 1).value("IsMobile", "True"))
            .signature(SignatureSpec::new(0, vec![7]).fragment(0, "Mobile"))
            .build()
            .unwrap()
    }

    #[test]
    fn init_builds_indexes() {
        let dataset = Dataset::from_bytes(tiny_bytes()).unwrap();
        assert_eq!(dataset.version(), Version::V32);
        assert_eq!(dataset.components().len(), 1);
        assert!(dataset.property_by_name("IsMobile").is_some());
        assert!(dataset.property_by_name("Nope").is_none());
        assert_eq!(dataset.profile_by_id(7).unwrap().unwrap().profile_id, 7);
        assert!(dataset.profile_by_id(8).unwrap().is_none());
        assert_eq!(dataset.copyright().unwrap().as_str(), "dataset tests");
    }

    #[test]
    fn root_node_is_first_in_region() {
        let dataset = Dataset::from_bytes(tiny_bytes()).unwrap();
        let root = dataset.root_node().unwrap();
        assert_eq!(root.position, 0);
        assert!(root.characters.is_empty());
        assert_eq!(root.parent_offset, NONE_OFFSET);
        assert!(!root.children.is_empty());
    }

    #[test]
    fn dispose_is_one_way() {
        let dataset = Dataset::from_bytes(tiny_bytes()).unwrap();
        dataset.signature(0).unwrap();
        dataset.dispose();
        assert!(matches!(dataset.signature(0), Err(UamatchError::Disposed)));
        assert!(matches!(dataset.copyright(), Err(UamatchError::Disposed)));
        assert_eq!(dataset.stats().readers_queued, 0);
    }

    #[test]
    fn truncated_file_fails_region_check() {
        let bytes = tiny_bytes();
        let result = Dataset::from_bytes(bytes[..bytes.len() - 8].to_vec());
        assert!(matches!(
            result,
            Err(UamatchError::Format(FormatError::RegionOutOfBounds { .. }))
        ));
    }

    #[test]
    fn signature_cache_counts_hits() {
        let dataset = Dataset::from_bytes(tiny_bytes()).unwrap();
        dataset.signature(0).unwrap();
        dataset.signature(0).unwrap();
        let stats = dataset.stats();
        assert_eq!(stats.signatures.requests, 2);
        assert_eq!(stats.signatures.misses, 1);
    }
}

fn check_regions(header: &Header, file_len: u64) -> Result<()> {
    let regions: [(&'static str, u32, u64); 12] = [
        ("strings", header.strings_offset, header.strings_byte_len as u64),
        ("components", header.components_offset, header.component_count as u64 * 16),
        ("maps", header.maps_offset, header.map_count as u64 * 8),
        ("properties", header.properties_offset, header.property_count as u64 * 48),
        ("values", header.values_offset, header.value_count as u64 * 16),
        ("profiles", header.profiles_offset, header.profiles_byte_len as u64),
        ("profile index", header.profile_index_offset, header.profile_count as u64 * 4),
        ("signatures", header.signatures_offset, header.signatures_byte_len as u64),
        (
            "ranked signatures",
            header.ranked_signatures_offset,
            header.signature_count as u64 * 4,
        ),
        ("nodes", header.nodes_offset, header.nodes_byte_len as u64),
        ("node index", header.node_index_offset, header.node_count as u64 * 4),
        ("value ranges", header.value_ranges_offset, header.property_count as u64 * 8),
    ];
    for (region, offset, len) in regions {
        if offset as u64 + len > file_len {
            return Err(FormatError::RegionOutOfBounds {
                region,
                offset: offset as u64,
                len,
                file_len,
            }
            .into());
        }
    }
    if header.version == Version::V32
        && header.signature_index_offset as u64 + header.signature_count as u64 * 4 > file_len
    {
        return Err(FormatError::RegionOutOfBounds {
            region: "signature index",
            offset: header.signature_index_offset as u64,
            len: header.signature_count as u64 * 4,
            file_len,
        }
        .into());
    }
    Ok(())
}
