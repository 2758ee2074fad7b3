//! Data-file builder
//!
//! [`DatasetBuilder`] assembles a complete data file from device
//! descriptions: components, properties, profiles and signatures given as
//! (position, fragment) lists. It computes the shared node DAG, the
//! signature sort order required for exact matching, the rank table and
//! every region offset, then serializes the whole file into one `Vec<u8>`.
//!
//! The builder is the canonical way to produce test fixtures and small
//! bespoke datasets; production data files are normally published, not
//! built in-process.

use crate::error::{FormatError, Result};
use crate::layout::{
    ComponentRecord, Header, MapRecord, NodeChildRecord, NodeNumericChildRecord, PropertyRecord,
    PropertyValueType, ValueRangeRecord, ValueRecord, Version, FLAG_LIST, FLAG_MANDATORY,
    FLAG_OBSOLETE, FLAG_SHOW_VALUES, NODE_MID_LEN, NODE_PREFIX_LEN, NONE_OFFSET,
    PROFILE_HEADER_LEN,
};
use std::collections::HashMap;
use zerocopy::IntoBytes;

/// A device axis (Hardware, Software, Browser, Crawler)
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Component identifier; unique within the dataset
    pub id: u8,
    /// Component name
    pub name: String,
    /// Profile used for Method=None results; first profile of the
    /// component when unset
    pub default_profile_id: Option<u32>,
}

impl ComponentSpec {
    /// Create a component with the default profile left implicit
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            default_profile_id: None,
        }
    }
}

/// A named, typed property belonging to one component
#[derive(Debug, Clone)]
pub struct PropertySpec {
    /// Property name; unique within the dataset
    pub name: String,
    /// Owning component
    pub component_id: u8,
    /// Value kind
    pub value_type: PropertyValueType,
    /// UI category
    pub category: String,
    /// Human description
    pub description: String,
    /// Documentation URL
    pub url: String,
    /// Display ordering hint
    pub display_order: u32,
    /// Values form a list
    pub is_list: bool,
    /// Property is present in every profile
    pub is_mandatory: bool,
    /// Property is deprecated
    pub is_obsolete: bool,
    /// Values should be listed in UIs
    pub show_values: bool,
    /// Client-side property name
    pub javascript_name: Option<String>,
    /// Default value name
    pub default_value: Option<String>,
    /// Data-file tier this property belongs to (Lite / Premium / ...)
    pub map: Option<String>,
}

impl PropertySpec {
    /// Create a property with empty metadata
    pub fn new(name: impl Into<String>, component_id: u8, value_type: PropertyValueType) -> Self {
        Self {
            name: name.into(),
            component_id,
            value_type,
            category: String::new(),
            description: String::new(),
            url: String::new(),
            display_order: 0,
            is_list: false,
            is_mandatory: false,
            is_obsolete: false,
            show_values: true,
            javascript_name: None,
            default_value: None,
            map: None,
        }
    }

    /// Set the tier map this property belongs to
    pub fn map(mut self, name: impl Into<String>) -> Self {
        self.map = Some(name.into());
        self
    }

    /// Set the default value name
    pub fn default_value(mut self, name: impl Into<String>) -> Self {
        self.default_value = Some(name.into());
        self
    }
}

/// A bundle of property values for one component
#[derive(Debug, Clone)]
pub struct ProfileSpec {
    /// Stable profile identifier (survives dataset rebuilds)
    pub profile_id: u32,
    /// Owning component
    pub component_id: u8,
    /// (property name, value name) pairs
    pub values: Vec<(String, String)>,
}

impl ProfileSpec {
    /// Create an empty profile
    pub fn new(profile_id: u32, component_id: u8) -> Self {
        Self {
            profile_id,
            component_id,
            values: Vec::new(),
        }
    }

    /// Add a property value
    pub fn value(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((property.into(), value.into()));
        self
    }
}

/// One positional piece of a signature's User-Agent pattern
#[derive(Debug, Clone)]
pub enum Fragment {
    /// A literal byte run starting at `position`
    Text {
        /// UA byte index where the run begins
        position: u16,
        /// The run itself
        text: String,
    },
    /// An integer whose decimal digits start at `position`; v3.2 datasets
    /// register these as numeric node children for fuzzy version matching
    Number {
        /// UA byte index where the digits begin
        position: u16,
        /// Canonical integer value
        value: u16,
    },
}

impl Fragment {
    fn position(&self) -> u16 {
        match self {
            Fragment::Text { position, .. } | Fragment::Number { position, .. } => *position,
        }
    }

    fn run(&self) -> Vec<u8> {
        match self {
            Fragment::Text { text, .. } => text.as_bytes().to_vec(),
            Fragment::Number { value, .. } => value.to_string().into_bytes(),
        }
    }
}

/// A signature: the fragments that identify a class of User-Agents plus
/// the profiles the class resolves to
#[derive(Debug, Clone)]
pub struct SignatureSpec {
    /// Popularity rank; lower is more popular
    pub rank: u32,
    /// One profile id per component
    pub profile_ids: Vec<u32>,
    /// Pattern fragments, ascending by position
    pub fragments: Vec<Fragment>,
}

impl SignatureSpec {
    /// Create a signature with no fragments yet
    pub fn new(rank: u32, profile_ids: Vec<u32>) -> Self {
        Self {
            rank,
            profile_ids,
            fragments: Vec::new(),
        }
    }

    /// Append a literal fragment
    pub fn fragment(mut self, position: u16, text: impl Into<String>) -> Self {
        self.fragments.push(Fragment::Text {
            position,
            text: text.into(),
        });
        self
    }

    /// Append a numeric fragment
    pub fn numeric_fragment(mut self, position: u16, value: u16) -> Self {
        self.fragments.push(Fragment::Number { position, value });
        self
    }
}

/// Builds a complete data file from device descriptions
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    version: Version,
    published: i64,
    next_update: i64,
    age_months: u32,
    copyright: String,
    min_user_agent_length: Option<u16>,
    components: Vec<ComponentSpec>,
    properties: Vec<PropertySpec>,
    profiles: Vec<ProfileSpec>,
    signatures: Vec<SignatureSpec>,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self::new(Version::V32)
    }
}

// In-memory node arena entry used while the DAG is being assembled.
struct BuildNode {
    parent: usize,
    position: u16,
    chars: Vec<u8>,
    children: Vec<usize>,
    numeric_children: Vec<(u16, usize)>,
    signatures: Vec<u32>,
}

impl DatasetBuilder {
    /// Create a builder targeting the given format version
    pub fn new(version: Version) -> Self {
        Self {
            version,
            published: 0,
            next_update: 0,
            age_months: 0,
            copyright: String::new(),
            min_user_agent_length: None,
            components: Vec::new(),
            properties: Vec::new(),
            profiles: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Set publish and next-update dates (unix seconds)
    pub fn dates(mut self, published: i64, next_update: i64) -> Self {
        self.published = published;
        self.next_update = next_update;
        self
    }

    /// Set the data age in months
    pub fn age_months(mut self, months: u32) -> Self {
        self.age_months = months;
        self
    }

    /// Set the copyright notice
    pub fn copyright(mut self, text: impl Into<String>) -> Self {
        self.copyright = text.into();
        self
    }

    /// Override the minimum useful User-Agent length
    ///
    /// Defaults to the smallest end position of any signature's first
    /// fragment.
    pub fn min_user_agent_length(mut self, len: u16) -> Self {
        self.min_user_agent_length = Some(len);
        self
    }

    /// Add a component
    pub fn component(mut self, spec: ComponentSpec) -> Self {
        self.components.push(spec);
        self
    }

    /// Add a property
    pub fn property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }

    /// Add a profile
    pub fn profile(mut self, spec: ProfileSpec) -> Self {
        self.profiles.push(spec);
        self
    }

    /// Add a signature
    pub fn signature(mut self, spec: SignatureSpec) -> Self {
        self.signatures.push(spec);
        self
    }

    /// Serialize the data file
    pub fn build(&self) -> Result<Vec<u8>> {
        self.validate()?;

        // Properties grouped by component, values grouped by property.
        let mut prop_order: Vec<usize> = (0..self.properties.len()).collect();
        prop_order.sort_by(|&a, &b| {
            let pa = &self.properties[a];
            let pb = &self.properties[b];
            (pa.component_id, &pa.name).cmp(&(pb.component_id, &pb.name))
        });
        let mut prop_index: HashMap<&str, u32> = HashMap::new();
        for (index, &spec) in prop_order.iter().enumerate() {
            prop_index.insert(self.properties[spec].name.as_str(), index as u32);
        }

        let (value_names, value_ranges, value_index) = self.collect_values(&prop_order)?;

        // Tier maps in property order.
        let mut map_names: Vec<&str> = Vec::new();
        let mut map_index: HashMap<&str, u32> = HashMap::new();
        for &spec in &prop_order {
            if let Some(name) = self.properties[spec].map.as_deref() {
                if !map_index.contains_key(name) {
                    map_index.insert(name, map_names.len() as u32);
                    map_names.push(name);
                }
            }
        }

        // Node DAG shared across signatures.
        let (arena, sig_nodes) = self.build_nodes()?;

        // Node membership determines node sizes; offsets follow, and the
        // signature sort order follows from the offsets.
        let mut arena = arena;
        for (sig, nodes) in sig_nodes.iter().enumerate() {
            for &n in nodes {
                arena[n].signatures.push(sig as u32);
            }
        }
        let node_offsets = Self::layout_nodes(&arena);

        let sig_vectors: Vec<Vec<u32>> = sig_nodes
            .iter()
            .map(|nodes| nodes.iter().map(|&n| node_offsets[n]).collect())
            .collect();
        let mut final_order: Vec<usize> = (0..self.signatures.len()).collect();
        final_order.sort_by(|&a, &b| sig_vectors[a].cmp(&sig_vectors[b]));
        // old spec index -> final signature index
        let mut sig_rename = vec![0u32; final_order.len()];
        for (new, &old) in final_order.iter().enumerate() {
            sig_rename[old] = new as u32;
        }
        for node in arena.iter_mut() {
            for sig in node.signatures.iter_mut() {
                *sig = sig_rename[*sig as usize];
            }
            node.signatures.sort_unstable();
        }

        // Profiles ordered by (component, id); offsets from record sizes.
        let mut profile_order: Vec<usize> = (0..self.profiles.len()).collect();
        profile_order.sort_by_key(|&i| (self.profiles[i].component_id, self.profiles[i].profile_id));
        let mut profile_sigs: Vec<Vec<u32>> = vec![Vec::new(); self.profiles.len()];
        for (new, &old) in final_order.iter().enumerate() {
            for &pid in &self.signatures[old].profile_ids {
                let spec = self
                    .profiles
                    .iter()
                    .position(|p| p.profile_id == pid)
                    .expect("validated");
                profile_sigs[spec].push(new as u32);
            }
        }
        let mut profile_offsets: HashMap<u32, u32> = HashMap::new();
        let mut running = 0u32;
        let mut profile_region_offsets = Vec::with_capacity(profile_order.len());
        for &spec in &profile_order {
            profile_region_offsets.push(running);
            profile_offsets.insert(self.profiles[spec].profile_id, running);
            let values = self.profiles[spec].values.len() as u32;
            let sigs = profile_sigs[spec].len() as u32;
            running += PROFILE_HEADER_LEN as u32 + 4 * (values + sigs);
        }

        // Everything is ordered now; serialize region by region.
        let mut strings = StringRegion::default();
        let copyright_offset = strings.intern(&self.copyright);

        let profiles_bytes = self.write_profiles(&profile_order, &profile_sigs, &value_index)?;
        let profile_index_bytes: Vec<u8> = profile_region_offsets
            .iter()
            .flat_map(|o| o.to_le_bytes())
            .collect();

        let (signatures_bytes, signature_index_bytes, sp_count, sn_count) =
            self.write_signatures(&final_order, &sig_vectors, &profile_offsets)?;

        let mut ranked: Vec<u32> = (0..self.signatures.len() as u32).collect();
        ranked.sort_by_key(|&s| (self.signatures[final_order[s as usize]].rank, s));
        let ranked_bytes: Vec<u8> = ranked.iter().flat_map(|s| s.to_le_bytes()).collect();

        let (nodes_bytes, node_index_bytes) = Self::write_nodes(&arena, &node_offsets);

        let mut components_bytes = Vec::new();
        let mut sorted_components: Vec<&ComponentSpec> = self.components.iter().collect();
        sorted_components.sort_by_key(|c| c.id);
        for component in &sorted_components {
            let default_profile = component.default_profile_id.or_else(|| {
                profile_order
                    .iter()
                    .map(|&i| &self.profiles[i])
                    .find(|p| p.component_id == component.id)
                    .map(|p| p.profile_id)
            });
            let default_profile_offset = default_profile
                .and_then(|id| profile_offsets.get(&id).copied())
                .ok_or_else(|| {
                    FormatError::Invariant(format!(
                        "component {} has no profiles",
                        component.name
                    ))
                })?;
            let first = prop_order
                .iter()
                .position(|&i| self.properties[i].component_id == component.id);
            let count = prop_order
                .iter()
                .filter(|&&i| self.properties[i].component_id == component.id)
                .count();
            let record = ComponentRecord {
                component_id: component.id,
                reserved: [0; 3],
                name_offset: strings.intern(&component.name),
                default_profile_offset,
                first_property_index: first.unwrap_or(0) as u16,
                property_count: count as u16,
            };
            components_bytes.extend_from_slice(record.as_bytes());
        }

        let mut maps_bytes = Vec::new();
        for name in &map_names {
            let record = MapRecord {
                name_offset: strings.intern(name),
                reserved: 0,
            };
            maps_bytes.extend_from_slice(record.as_bytes());
        }

        let mut properties_bytes = Vec::new();
        for &spec in &prop_order {
            let property = &self.properties[spec];
            let mut flags = 0u8;
            if property.is_list {
                flags |= FLAG_LIST;
            }
            if property.is_mandatory {
                flags |= FLAG_MANDATORY;
            }
            if property.is_obsolete {
                flags |= FLAG_OBSOLETE;
            }
            if property.show_values {
                flags |= FLAG_SHOW_VALUES;
            }
            let default_value_index = match &property.default_value {
                Some(name) => *value_index
                    .get(&(prop_index[property.name.as_str()], name.clone()))
                    .expect("default value collected"),
                None => NONE_OFFSET,
            };
            let (map_count, first_map_index) = match property.map.as_deref() {
                Some(name) => (1, map_index[name]),
                None => (0, 0),
            };
            let record = PropertyRecord {
                component_id: property.component_id,
                value_type: property.value_type.as_u8(),
                flags,
                reserved: 0,
                display_order: property.display_order,
                name_offset: strings.intern(&property.name),
                description_offset: strings.intern(&property.description),
                category_offset: strings.intern(&property.category),
                url_offset: strings.intern(&property.url),
                javascript_name_offset: property
                    .javascript_name
                    .as_deref()
                    .map(|n| strings.intern(n))
                    .unwrap_or(NONE_OFFSET),
                default_value_index,
                map_count,
                first_map_index,
                reserved2: [0; 8],
            };
            properties_bytes.extend_from_slice(record.as_bytes());
        }

        let mut values_bytes = Vec::new();
        for (name, property_index) in &value_names {
            let record = ValueRecord {
                name_offset: strings.intern(name),
                description_offset: NONE_OFFSET,
                url_offset: NONE_OFFSET,
                property_index: *property_index,
            };
            values_bytes.extend_from_slice(record.as_bytes());
        }

        let mut value_ranges_bytes = Vec::new();
        for (first, last) in &value_ranges {
            let record = ValueRangeRecord {
                first_value_index: *first,
                last_value_index: *last,
            };
            value_ranges_bytes.extend_from_slice(record.as_bytes());
        }

        // Region table; offsets are absolute.
        let header_len = self.version.header_len() as u32;
        let mut at = header_len;
        let mut place = |len: usize| {
            let here = at;
            at += len as u32;
            here
        };
        let strings_bytes = strings.bytes;
        let strings_offset = place(strings_bytes.len());
        let components_offset = place(components_bytes.len());
        let maps_offset = place(maps_bytes.len());
        let properties_offset = place(properties_bytes.len());
        let values_offset = place(values_bytes.len());
        let profiles_offset = place(profiles_bytes.len());
        let profile_index_offset = place(profile_index_bytes.len());
        let signatures_offset = place(signatures_bytes.len());
        let signature_index_offset = place(signature_index_bytes.len());
        let ranked_signatures_offset = place(ranked_bytes.len());
        let nodes_offset = place(nodes_bytes.len());
        let node_index_offset = place(node_index_bytes.len());
        let value_ranges_offset = place(value_ranges_bytes.len());

        let header = Header {
            version: self.version,
            published: self.published,
            next_update: self.next_update,
            age_months: self.age_months,
            copyright_offset,
            min_user_agent_length: self.min_user_agent_length.unwrap_or_else(|| {
                self.signatures
                    .iter()
                    .filter_map(|s| s.fragments.first())
                    .map(|f| f.position() + f.run().len() as u16)
                    .min()
                    .unwrap_or(0)
            }),
            signature_profiles_count: sp_count,
            signature_nodes_count: sn_count,
            strings_offset,
            strings_byte_len: strings_bytes.len() as u32,
            string_count: strings.count,
            components_offset,
            component_count: self.components.len() as u32,
            maps_offset,
            map_count: map_names.len() as u32,
            properties_offset,
            property_count: self.properties.len() as u32,
            values_offset,
            value_count: value_names.len() as u32,
            profiles_offset,
            profiles_byte_len: profiles_bytes.len() as u32,
            profile_count: self.profiles.len() as u32,
            profile_index_offset,
            signatures_offset,
            signatures_byte_len: signatures_bytes.len() as u32,
            signature_count: self.signatures.len() as u32,
            ranked_signatures_offset,
            nodes_offset,
            nodes_byte_len: nodes_bytes.len() as u32,
            node_count: arena.len() as u32,
            node_index_offset,
            value_ranges_offset,
            signature_index_offset,
        };

        let mut out = Vec::with_capacity(at as usize);
        header.write_into(&mut out);
        debug_assert_eq!(out.len(), self.version.header_len());
        out.extend_from_slice(&strings_bytes);
        out.extend_from_slice(&components_bytes);
        out.extend_from_slice(&maps_bytes);
        out.extend_from_slice(&properties_bytes);
        out.extend_from_slice(&values_bytes);
        out.extend_from_slice(&profiles_bytes);
        out.extend_from_slice(&profile_index_bytes);
        out.extend_from_slice(&signatures_bytes);
        out.extend_from_slice(&signature_index_bytes);
        out.extend_from_slice(&ranked_bytes);
        out.extend_from_slice(&nodes_bytes);
        out.extend_from_slice(&node_index_bytes);
        out.extend_from_slice(&value_ranges_bytes);
        debug_assert_eq!(out.len(), at as usize);
        Ok(out)
    }

    fn validate(&self) -> Result<()> {
        let mut component_ids = Vec::new();
        for component in &self.components {
            if component_ids.contains(&component.id) {
                return Err(FormatError::Invariant(format!(
                    "duplicate component id {}",
                    component.id
                )));
            }
            component_ids.push(component.id);
        }
        let mut profile_ids = Vec::new();
        for profile in &self.profiles {
            if profile_ids.contains(&profile.profile_id) {
                return Err(FormatError::Invariant(format!(
                    "duplicate profile id {}",
                    profile.profile_id
                )));
            }
            if !component_ids.contains(&profile.component_id) {
                return Err(FormatError::Invariant(format!(
                    "profile {} references unknown component {}",
                    profile.profile_id, profile.component_id
                )));
            }
            profile_ids.push(profile.profile_id);
        }
        let mut property_names: Vec<&str> = Vec::new();
        for property in &self.properties {
            if property_names.contains(&property.name.as_str()) {
                return Err(FormatError::Invariant(format!(
                    "duplicate property name {}",
                    property.name
                )));
            }
            if !component_ids.contains(&property.component_id) {
                return Err(FormatError::Invariant(format!(
                    "property {} references unknown component {}",
                    property.name, property.component_id
                )));
            }
            property_names.push(&property.name);
        }
        for (index, signature) in self.signatures.iter().enumerate() {
            if signature.fragments.is_empty() {
                return Err(FormatError::Invariant(format!(
                    "signature {index} has no fragments"
                )));
            }
            let mut end = 0u32;
            for fragment in &signature.fragments {
                let position = fragment.position() as u32;
                if position < end {
                    return Err(FormatError::Invariant(format!(
                        "signature {index} fragments overlap at position {position}"
                    )));
                }
                if fragment.run().is_empty() {
                    return Err(FormatError::Invariant(format!(
                        "signature {index} has an empty fragment"
                    )));
                }
                if self.version == Version::V31 {
                    if let Fragment::Number { .. } = fragment {
                        return Err(FormatError::Invariant(
                            "numeric fragments require format version 3.2".into(),
                        ));
                    }
                }
                end = position + fragment.run().len() as u32;
            }
            // Exactly one profile per component in the dataset.
            let mut seen: Vec<u8> = Vec::new();
            for pid in &signature.profile_ids {
                let profile = self
                    .profiles
                    .iter()
                    .find(|p| p.profile_id == *pid)
                    .ok_or_else(|| {
                        FormatError::Invariant(format!(
                            "signature {index} references unknown profile {pid}"
                        ))
                    })?;
                if seen.contains(&profile.component_id) {
                    return Err(FormatError::Invariant(format!(
                        "signature {index} has two profiles for component {}",
                        profile.component_id
                    )));
                }
                seen.push(profile.component_id);
            }
            if seen.len() != self.components.len() {
                return Err(FormatError::Invariant(format!(
                    "signature {index} covers {} of {} components",
                    seen.len(),
                    self.components.len()
                )));
            }
        }
        Ok(())
    }

    /// Distinct value names per property, in property order, plus the
    /// per-property (first, last) index ranges.
    #[allow(clippy::type_complexity)]
    fn collect_values(
        &self,
        prop_order: &[usize],
    ) -> Result<(
        Vec<(String, u32)>,
        Vec<(u32, u32)>,
        HashMap<(u32, String), u32>,
    )> {
        let mut names: Vec<(String, u32)> = Vec::new();
        let mut ranges = Vec::with_capacity(prop_order.len());
        let mut index: HashMap<(u32, String), u32> = HashMap::new();
        for (property_index, &spec) in prop_order.iter().enumerate() {
            let property = &self.properties[spec];
            let mut used: Vec<String> = self
                .profiles
                .iter()
                .flat_map(|p| p.values.iter())
                .filter(|(prop, _)| prop == &property.name)
                .map(|(_, value)| value.clone())
                .collect();
            if let Some(default) = &property.default_value {
                used.push(default.clone());
            }
            used.sort();
            used.dedup();
            if used.is_empty() {
                ranges.push((NONE_OFFSET, NONE_OFFSET));
                continue;
            }
            let first = names.len() as u32;
            for value in used {
                index.insert((property_index as u32, value.clone()), names.len() as u32);
                names.push((value, property_index as u32));
            }
            ranges.push((first, names.len() as u32 - 1));
        }
        Ok((names, ranges, index))
    }

    /// Build the shared node DAG; returns the arena (root at index 0) and
    /// each signature's fragment-node indices in position order.
    fn build_nodes(&self) -> Result<(Vec<BuildNode>, Vec<Vec<usize>>)> {
        let mut arena = vec![BuildNode {
            parent: usize::MAX,
            position: 0,
            chars: Vec::new(),
            children: Vec::new(),
            numeric_children: Vec::new(),
            signatures: Vec::new(),
        }];
        let mut sig_nodes = Vec::with_capacity(self.signatures.len());
        for signature in &self.signatures {
            let mut fragments = signature.fragments.clone();
            fragments.sort_by_key(|f| f.position());
            let mut current = 0usize;
            let mut nodes = Vec::with_capacity(fragments.len());
            for fragment in &fragments {
                let node = match fragment {
                    Fragment::Text { position, .. } => {
                        Self::add_run(&mut arena, current, *position, &fragment.run())
                    }
                    Fragment::Number { position, value } => {
                        Self::add_numeric(&mut arena, current, *position, *value)
                    }
                };
                nodes.push(node);
                current = node;
            }
            sig_nodes.push(nodes);
        }
        Ok((arena, sig_nodes))
    }

    /// Insert a byte run under `parent`, sharing existing prefixes and
    /// splitting nodes where runs diverge mid-way.
    fn add_run(arena: &mut Vec<BuildNode>, parent: usize, position: u16, run: &[u8]) -> usize {
        let existing = arena[parent]
            .children
            .iter()
            .copied()
            .find(|&c| arena[c].position == position && arena[c].chars[0] == run[0]);
        let Some(child) = existing else {
            let node = arena.len();
            arena.push(BuildNode {
                parent,
                position,
                chars: run.to_vec(),
                children: Vec::new(),
                numeric_children: Vec::new(),
                signatures: Vec::new(),
            });
            arena[parent].children.push(node);
            return node;
        };

        let common = arena[child]
            .chars
            .iter()
            .zip(run)
            .take_while(|(a, b)| a == b)
            .count();
        if common == arena[child].chars.len() {
            if common == run.len() {
                return child;
            }
            return Self::add_run(arena, child, position + common as u16, &run[common..]);
        }

        // Diverges inside the existing child: split it at the common prefix.
        let split = arena.len();
        arena.push(BuildNode {
            parent,
            position,
            chars: run[..common].to_vec(),
            children: vec![child],
            numeric_children: Vec::new(),
            signatures: Vec::new(),
        });
        let slot = arena[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .expect("child present");
        arena[parent].children[slot] = split;
        arena[child].parent = split;
        arena[child].position = position + common as u16;
        arena[child].chars.drain(..common);

        if common == run.len() {
            split
        } else {
            Self::add_run(arena, split, position + common as u16, &run[common..])
        }
    }

    /// Insert a numeric child under `parent`, reusing an existing child
    /// for the same value.
    fn add_numeric(arena: &mut Vec<BuildNode>, parent: usize, position: u16, value: u16) -> usize {
        if let Some(&(_, node)) = arena[parent]
            .numeric_children
            .iter()
            .find(|(v, _)| *v == value)
        {
            return node;
        }
        let node = arena.len();
        arena.push(BuildNode {
            parent,
            position,
            chars: value.to_string().into_bytes(),
            children: Vec::new(),
            numeric_children: Vec::new(),
            signatures: Vec::new(),
        });
        arena[parent].numeric_children.push((value, node));
        node
    }

    fn node_size(node: &BuildNode) -> u32 {
        (NODE_PREFIX_LEN
            + node.chars.len()
            + NODE_MID_LEN
            + 8 * node.children.len()
            + 8 * node.numeric_children.len()
            + 4 * node.signatures.len()) as u32
    }

    fn layout_nodes(arena: &[BuildNode]) -> Vec<u32> {
        let mut offsets = Vec::with_capacity(arena.len());
        let mut at = 0u32;
        for node in arena {
            offsets.push(at);
            at += Self::node_size(node);
        }
        offsets
    }

    fn write_nodes(arena: &[BuildNode], offsets: &[u32]) -> (Vec<u8>, Vec<u8>) {
        let mut bytes = Vec::new();
        for node in arena {
            let parent = if node.parent == usize::MAX {
                NONE_OFFSET
            } else {
                offsets[node.parent]
            };
            bytes.extend_from_slice(&parent.to_le_bytes());
            bytes.extend_from_slice(&node.position.to_le_bytes());
            bytes.extend_from_slice(&(node.chars.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&node.chars);

            let mut children: Vec<NodeChildRecord> = node
                .children
                .iter()
                .map(|&c| NodeChildRecord {
                    first_byte: arena[c].chars[0],
                    reserved: 0,
                    position: arena[c].position,
                    node_offset: offsets[c],
                })
                .collect();
            children.sort_by_key(|c| (c.position, c.first_byte));
            let mut numeric: Vec<NodeNumericChildRecord> = node
                .numeric_children
                .iter()
                .map(|&(value, c)| NodeNumericChildRecord {
                    value,
                    reserved: 0,
                    node_offset: offsets[c],
                })
                .collect();
            numeric.sort_by_key(|c| c.value);

            bytes.extend_from_slice(&(children.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&(numeric.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&(node.signatures.len() as u32).to_le_bytes());
            for child in &children {
                bytes.extend_from_slice(child.as_bytes());
            }
            for child in &numeric {
                bytes.extend_from_slice(child.as_bytes());
            }
            for signature in &node.signatures {
                bytes.extend_from_slice(&signature.to_le_bytes());
            }
        }
        let index: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
        (bytes, index)
    }

    fn write_profiles(
        &self,
        profile_order: &[usize],
        profile_sigs: &[Vec<u32>],
        value_index: &HashMap<(u32, String), u32>,
    ) -> Result<Vec<u8>> {
        // Property index by name mirrors the sorted property order.
        let mut prop_order: Vec<usize> = (0..self.properties.len()).collect();
        prop_order.sort_by(|&a, &b| {
            let pa = &self.properties[a];
            let pb = &self.properties[b];
            (pa.component_id, &pa.name).cmp(&(pb.component_id, &pb.name))
        });
        let mut prop_index: HashMap<&str, u32> = HashMap::new();
        for (index, &spec) in prop_order.iter().enumerate() {
            prop_index.insert(self.properties[spec].name.as_str(), index as u32);
        }

        let mut bytes = Vec::new();
        for &spec in profile_order {
            let profile = &self.profiles[spec];
            let mut values = Vec::with_capacity(profile.values.len());
            for (property, value) in &profile.values {
                let pi = *prop_index.get(property.as_str()).ok_or_else(|| {
                    FormatError::Invariant(format!(
                        "profile {} references unknown property {property}",
                        profile.profile_id
                    ))
                })?;
                let vi = *value_index.get(&(pi, value.clone())).ok_or_else(|| {
                    FormatError::Invariant(format!(
                        "profile {} references uncollected value {value}",
                        profile.profile_id
                    ))
                })?;
                values.push(vi);
            }
            values.sort_unstable();
            bytes.push(profile.component_id);
            bytes.extend_from_slice(&[0; 3]);
            bytes.extend_from_slice(&profile.profile_id.to_le_bytes());
            bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&(profile_sigs[spec].len() as u32).to_le_bytes());
            for value in values {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            for signature in &profile_sigs[spec] {
                bytes.extend_from_slice(&signature.to_le_bytes());
            }
        }
        Ok(bytes)
    }

    /// Serialize signatures in final (node-vector) order; returns the
    /// region bytes, the v3.2 offset index, and the v3.1 slot counts.
    fn write_signatures(
        &self,
        final_order: &[usize],
        sig_vectors: &[Vec<u32>],
        profile_offsets: &HashMap<u32, u32>,
    ) -> Result<(Vec<u8>, Vec<u8>, u16, u16)> {
        let sorted_profiles = |spec: &SignatureSpec| -> Vec<u32> {
            let mut profiles: Vec<&ProfileSpec> = spec
                .profile_ids
                .iter()
                .map(|pid| {
                    self.profiles
                        .iter()
                        .find(|p| p.profile_id == *pid)
                        .expect("validated")
                })
                .collect();
            profiles.sort_by_key(|p| p.component_id);
            profiles.iter().map(|p| profile_offsets[&p.profile_id]).collect()
        };

        match self.version {
            Version::V32 => {
                let mut bytes = Vec::new();
                let mut index = Vec::new();
                for &old in final_order {
                    index.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    let spec = &self.signatures[old];
                    let profiles = sorted_profiles(spec);
                    let nodes = &sig_vectors[old];
                    bytes.extend_from_slice(&(nodes.len() as u16).to_le_bytes());
                    bytes.extend_from_slice(&(profiles.len() as u16).to_le_bytes());
                    bytes.extend_from_slice(&spec.rank.to_le_bytes());
                    for profile in profiles {
                        bytes.extend_from_slice(&profile.to_le_bytes());
                    }
                    for node in nodes {
                        bytes.extend_from_slice(&node.to_le_bytes());
                    }
                }
                Ok((bytes, index, 0, 0))
            }
            Version::V31 => {
                let sp = self
                    .signatures
                    .iter()
                    .map(|s| s.profile_ids.len())
                    .max()
                    .unwrap_or(0) as u16;
                let sn = sig_vectors.iter().map(Vec::len).max().unwrap_or(0) as u16;
                let mut bytes = Vec::new();
                for &old in final_order {
                    let spec = &self.signatures[old];
                    let profiles = sorted_profiles(spec);
                    for slot in 0..sp as usize {
                        let v = profiles.get(slot).copied().unwrap_or(NONE_OFFSET);
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    for slot in 0..sn as usize {
                        let v = sig_vectors[old].get(slot).copied().unwrap_or(NONE_OFFSET);
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    bytes.extend_from_slice(&spec.rank.to_le_bytes());
                }
                Ok((bytes, Vec::new(), sp, sn))
            }
        }
    }
}

/// Interning accumulator for the strings region
#[derive(Default)]
struct StringRegion {
    bytes: Vec<u8>,
    count: u32,
    seen: HashMap<String, u32>,
}

impl StringRegion {
    /// Intern `s`, returning its region-relative offset
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.seen.get(s) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes
            .extend_from_slice(&(s.len() as u16).to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        self.seen.insert(s.to_string(), offset);
        self.count += 1;
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> DatasetBuilder {
        DatasetBuilder::new(Version::V32)
            .copyright("test data")
            .dates(1_700_000_000, 1_702_600_000)
            .component(ComponentSpec::new(1, "Hardware"))
            .component(ComponentSpec::new(2, "Browser"))
            .property(
                PropertySpec::new("IsMobile", 1, PropertyValueType::Bool)
                    .map("Lite")
                    .default_value("False"),
            )
            .property(PropertySpec::new("BrowserName", 2, PropertyValueType::String).map("Lite"))
            .profile(ProfileSpec::new(100, 1).value("IsMobile", "True"))
            .profile(ProfileSpec::new(200, 2).value("BrowserName", "Chrome"))
            .signature(SignatureSpec::new(0, vec![100, 200]).fragment(0, "Mozilla/5.0 (Linux"))
    }

    #[test]
    fn builds_and_parses_header() {
        let bytes = tiny().build().unwrap();
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.version, Version::V32);
        assert_eq!(header.component_count, 2);
        assert_eq!(header.property_count, 2);
        assert_eq!(header.signature_count, 1);
        assert!(header.node_count >= 2); // root + at least one run
        assert_eq!(header.value_ranges_offset as usize + 16, bytes.len());
    }

    #[test]
    fn rejects_incomplete_component_coverage() {
        let builder = tiny().signature(SignatureSpec::new(1, vec![100]).fragment(0, "Opera"));
        assert!(matches!(
            builder.build(),
            Err(FormatError::Invariant(_))
        ));
    }

    #[test]
    fn rejects_numeric_fragment_in_v31() {
        let builder = DatasetBuilder::new(Version::V31)
            .component(ComponentSpec::new(1, "Hardware"))
            .profile(ProfileSpec::new(1, 1))
            .signature(SignatureSpec::new(0, vec![1]).numeric_fragment(0, 9));
        assert!(builder.build().is_err());
    }

    #[test]
    fn shares_common_prefixes() {
        let bytes = tiny()
            .profile(ProfileSpec::new(300, 2).value("BrowserName", "Firefox"))
            .signature(
                SignatureSpec::new(1, vec![100, 300]).fragment(0, "Mozilla/5.0 (Android"),
            )
            .build()
            .unwrap();
        let header = Header::parse(&bytes).unwrap();
        // "Mozilla/5.0 (" shared prefix + "Linux"/"Android" split + root
        assert_eq!(header.node_count, 4);
        assert_eq!(header.signature_count, 2);
    }

    #[test]
    fn min_ua_length_defaults_to_first_fragment_end() {
        let bytes = tiny().build().unwrap();
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.min_user_agent_length, "Mozilla/5.0 (Linux".len() as u16);
    }
}
