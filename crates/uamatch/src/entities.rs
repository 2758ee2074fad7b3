//! Typed entity views over the data file
//!
//! Entities are immutable structs owning only scalar fields and
//! cross-reference offsets; navigation between entities goes through the
//! dataset, which resolves offsets against its record lists. Derived values
//! (device id, signature length) are memoised on first access.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::lists::{FixedRecord, VariableRecord};
use crate::source::Reader;
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};
use uamatch_format::{
    ComponentRecord, FormatError, NodeChildRecord, NodeNumericChildRecord, PropertyRecord,
    PropertyValueType, ValueRecord, NONE_OFFSET,
};
use zerocopy::FromBytes;

fn read_record<T: FromBytes>(reader: &mut Reader, len: usize, region: &'static str) -> Result<T> {
    let offset = reader.position();
    let buf = reader.read_bytes(len)?;
    T::read_from_bytes(&buf).map_err(|_| {
        FormatError::TruncatedRecord {
            region,
            offset,
        }
        .into()
    })
}

/// A device axis: Hardware, Software, Browser or Crawler
#[derive(Debug)]
pub struct Component {
    /// Component identifier
    pub component_id: u8,
    /// Component name, resolved at dataset init
    pub name: String,
    /// Default profile for Method=None results (profiles-region offset)
    pub default_profile_offset: u32,
    /// First property index belonging to this component
    pub first_property_index: u16,
    /// Number of properties belonging to this component
    pub property_count: u16,
}

impl Component {
    pub(crate) fn read(reader: &mut Reader, dataset_strings: impl Fn(u32) -> Result<Arc<String>>) -> Result<Self> {
        let record: ComponentRecord = read_record(reader, 16, "components")?;
        Ok(Component {
            component_id: record.component_id,
            name: dataset_strings(record.name_offset)?.as_ref().clone(),
            default_profile_offset: record.default_profile_offset,
            first_property_index: record.first_property_index,
            property_count: record.property_count,
        })
    }

    /// The component's default profile
    pub fn default_profile(&self, dataset: &Dataset) -> Result<Arc<Profile>> {
        dataset.profile_at(self.default_profile_offset)
    }

    /// Properties defined against this component
    pub fn properties<'d>(&self, dataset: &'d Dataset) -> &'d [Arc<Property>] {
        let first = self.first_property_index as usize;
        let count = self.property_count as usize;
        &dataset.properties()[first..first + count]
    }
}

/// A data-file tier (Lite / Premium / Enterprise)
#[derive(Debug, Clone)]
pub struct DataMap {
    /// Map name
    pub name: String,
}

/// A named, typed property of one component
#[derive(Debug)]
pub struct Property {
    /// Position of this property in the properties list
    pub index: u32,
    /// Owning component
    pub component_id: u8,
    /// Value kind
    pub value_type: PropertyValueType,
    /// Values form a list
    pub is_list: bool,
    /// Present in every profile
    pub is_mandatory: bool,
    /// Deprecated
    pub is_obsolete: bool,
    /// Values should be listed in UIs
    pub show_values: bool,
    /// Display ordering hint
    pub display_order: u32,
    /// Property name, resolved at dataset init
    pub name: String,
    description_offset: u32,
    category_offset: u32,
    url_offset: u32,
    javascript_name_offset: u32,
    /// Default value index ([`NONE_OFFSET`] when absent)
    pub default_value_index: u32,
    pub(crate) map_count: u32,
    pub(crate) first_map_index: u32,
}

impl Property {
    pub(crate) fn read(
        reader: &mut Reader,
        index: u32,
        dataset_strings: impl Fn(u32) -> Result<Arc<String>>,
    ) -> Result<Self> {
        let record: PropertyRecord = read_record(reader, 48, "properties")?;
        Ok(Property {
            index,
            component_id: record.component_id,
            value_type: PropertyValueType::from_u8(record.value_type)?,
            is_list: record.flags & uamatch_format::layout::FLAG_LIST != 0,
            is_mandatory: record.flags & uamatch_format::layout::FLAG_MANDATORY != 0,
            is_obsolete: record.flags & uamatch_format::layout::FLAG_OBSOLETE != 0,
            show_values: record.flags & uamatch_format::layout::FLAG_SHOW_VALUES != 0,
            display_order: record.display_order,
            name: dataset_strings(record.name_offset)?.as_ref().clone(),
            description_offset: record.description_offset,
            category_offset: record.category_offset,
            url_offset: record.url_offset,
            javascript_name_offset: record.javascript_name_offset,
            default_value_index: record.default_value_index,
            map_count: record.map_count,
            first_map_index: record.first_map_index,
        })
    }

    /// Human description
    pub fn description(&self, dataset: &Dataset) -> Result<Arc<String>> {
        dataset.string(self.description_offset)
    }

    /// UI category
    pub fn category(&self, dataset: &Dataset) -> Result<Arc<String>> {
        dataset.string(self.category_offset)
    }

    /// Documentation URL
    pub fn url(&self, dataset: &Dataset) -> Result<Arc<String>> {
        dataset.string(self.url_offset)
    }

    /// Client-side property name, when defined
    pub fn javascript_name(&self, dataset: &Dataset) -> Result<Option<Arc<String>>> {
        if self.javascript_name_offset == NONE_OFFSET {
            return Ok(None);
        }
        dataset.string(self.javascript_name_offset).map(Some)
    }

    /// Every possible value of this property
    pub fn values(&self, dataset: &Dataset) -> Result<Vec<Arc<Value>>> {
        let (first, last) = dataset.value_range(self.index);
        if first == NONE_OFFSET {
            return Ok(Vec::new());
        }
        (first..=last).map(|index| dataset.value(index)).collect()
    }

    /// Default value, when defined
    pub fn default_value(&self, dataset: &Dataset) -> Result<Option<Arc<Value>>> {
        if self.default_value_index == NONE_OFFSET {
            return Ok(None);
        }
        dataset.value(self.default_value_index).map(Some)
    }

    /// Names of the data-file tiers this property appears in
    pub fn maps<'d>(&self, dataset: &'d Dataset) -> &'d [DataMap] {
        let first = self.first_map_index as usize;
        let count = self.map_count as usize;
        &dataset.maps()[first..first + count]
    }
}

/// One possible value of a property
#[derive(Debug)]
pub struct Value {
    name_offset: u32,
    description_offset: u32,
    url_offset: u32,
    /// Index of the owning property
    pub property_index: u32,
}

impl FixedRecord for Value {
    const STRIDE: u64 = 16;

    fn read(reader: &mut Reader) -> Result<Self> {
        let record: ValueRecord = read_record(reader, 16, "values")?;
        Ok(Value {
            name_offset: record.name_offset,
            description_offset: record.description_offset,
            url_offset: record.url_offset,
            property_index: record.property_index,
        })
    }
}

impl Value {
    /// Value name
    pub fn name(&self, dataset: &Dataset) -> Result<Arc<String>> {
        dataset.string(self.name_offset)
    }

    /// Human description, when present
    pub fn description(&self, dataset: &Dataset) -> Result<Option<Arc<String>>> {
        if self.description_offset == NONE_OFFSET {
            return Ok(None);
        }
        dataset.string(self.description_offset).map(Some)
    }

    /// Documentation URL, when present
    pub fn url(&self, dataset: &Dataset) -> Result<Option<Arc<String>>> {
        if self.url_offset == NONE_OFFSET {
            return Ok(None);
        }
        dataset.string(self.url_offset).map(Some)
    }
}

/// A bundle of values for one component, stable across dataset rebuilds
#[derive(Debug)]
pub struct Profile {
    /// Owning component
    pub component_id: u8,
    /// Stable profile identifier
    pub profile_id: u32,
    /// Global value indices, ascending
    pub value_indices: Vec<u32>,
    /// Signature indices referencing this profile, ascending
    pub signature_indices: Vec<u32>,
}

impl VariableRecord for Profile {
    fn read(reader: &mut Reader) -> Result<Self> {
        let component_id = reader.read_u8()?;
        let _pad = reader.read_bytes(3)?;
        let profile_id = reader.read_u32()?;
        let value_count = reader.read_u32()?;
        let signature_count = reader.read_u32()?;
        let mut value_indices = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            value_indices.push(reader.read_u32()?);
        }
        let mut signature_indices = Vec::with_capacity(signature_count as usize);
        for _ in 0..signature_count {
            signature_indices.push(reader.read_u32()?);
        }
        Ok(Profile {
            component_id,
            profile_id,
            value_indices,
            signature_indices,
        })
    }
}

impl Profile {
    /// Every value the profile assigns
    pub fn values(&self, dataset: &Dataset) -> Result<Vec<Arc<Value>>> {
        self.value_indices
            .iter()
            .map(|&index| dataset.value(index))
            .collect()
    }

    /// Values the profile assigns to one property
    pub fn values_for_property(
        &self,
        dataset: &Dataset,
        property: &Property,
    ) -> Result<Vec<Arc<Value>>> {
        let (first, last) = dataset.value_range(property.index);
        if first == NONE_OFFSET {
            return Ok(Vec::new());
        }
        self.value_indices
            .iter()
            .filter(|&&index| index >= first && index <= last)
            .map(|&index| dataset.value(index))
            .collect()
    }
}

/// Child entry of a node
#[derive(Debug, Clone, Copy)]
pub struct NodeChild {
    /// Leading byte of the child's character run
    pub first_byte: u8,
    /// UA position where the child's run begins
    pub position: u16,
    /// Child node offset
    pub node_offset: u32,
}

/// Numeric child entry of a node (v3.2)
#[derive(Debug, Clone, Copy)]
pub struct NodeNumericChild {
    /// Integer the child's digit run encodes
    pub value: u16,
    /// Child node offset
    pub node_offset: u32,
}

/// A position in the character-positional node DAG
#[derive(Debug)]
pub struct Node {
    /// Parent node offset ([`NONE_OFFSET`] for the root)
    pub parent_offset: u32,
    /// UA byte index where this node's run begins
    pub position: u16,
    /// The byte run the node represents; empty for the root
    pub characters: Vec<u8>,
    /// Children, sorted by (position, first byte)
    pub children: Vec<NodeChild>,
    /// Numeric children, sorted by value; v3.2 only
    pub numeric_children: Vec<NodeNumericChild>,
    /// Signatures containing this node, ascending
    pub signature_indices: Vec<u32>,
}

impl VariableRecord for Node {
    fn read(reader: &mut Reader) -> Result<Self> {
        let parent_offset = reader.read_u32()?;
        let position = reader.read_u16()?;
        let characters_len = reader.read_u16()?;
        let characters = reader.read_bytes(characters_len as usize)?;
        let child_count = reader.read_u16()?;
        let numeric_count = reader.read_u16()?;
        let signature_count = reader.read_u32()?;
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let record: NodeChildRecord = read_record(reader, 8, "nodes")?;
            children.push(NodeChild {
                first_byte: record.first_byte,
                position: record.position,
                node_offset: record.node_offset,
            });
        }
        let mut numeric_children = Vec::with_capacity(numeric_count as usize);
        for _ in 0..numeric_count {
            let record: NodeNumericChildRecord = read_record(reader, 8, "nodes")?;
            numeric_children.push(NodeNumericChild {
                value: record.value,
                node_offset: record.node_offset,
            });
        }
        let mut signature_indices = Vec::with_capacity(signature_count as usize);
        for _ in 0..signature_count {
            signature_indices.push(reader.read_u32()?);
        }
        Ok(Node {
            parent_offset,
            position,
            characters,
            children,
            numeric_children,
            signature_indices,
        })
    }
}

impl Node {
    /// A node is complete when at least one signature contains it
    pub fn is_complete(&self) -> bool {
        !self.signature_indices.is_empty()
    }

    /// Locate the child whose run starts at `position` with `byte`
    ///
    /// Children are ordered by (position, first byte), so this is a single
    /// binary search.
    pub fn find_child(&self, position: u16, byte: u8) -> Option<&NodeChild> {
        self.children
            .binary_search_by_key(&(position, byte), |child| {
                (child.position, child.first_byte)
            })
            .ok()
            .map(|index| &self.children[index])
    }

    /// Distinct child positions at or past `from`, ascending
    pub fn child_positions(&self, from: u16) -> impl Iterator<Item = u16> + '_ {
        let mut last: Option<u16> = None;
        self.children.iter().filter_map(move |child| {
            if child.position < from || last == Some(child.position) {
                return None;
            }
            last = Some(child.position);
            Some(child.position)
        })
    }

    /// Numeric child with exactly `value`, when present
    pub fn numeric_child(&self, value: u16) -> Option<&NodeNumericChild> {
        self.numeric_children
            .binary_search_by_key(&value, |child| child.value)
            .ok()
            .map(|index| &self.numeric_children[index])
    }

    /// Numeric children ordered by distance from `target` (ties: smaller value)
    pub fn numeric_children_by_distance(&self, target: u16) -> Vec<&NodeNumericChild> {
        let mut ordered: Vec<&NodeNumericChild> = self.numeric_children.iter().collect();
        ordered.sort_by_key(|child| (child.value.abs_diff(target), child.value));
        ordered
    }
}

/// The canonical fragment set identifying a class of User-Agents
#[derive(Debug)]
pub struct Signature {
    /// Position of this signature in the signatures list
    pub index: u32,
    /// Node offsets, ascending by node position
    pub node_offsets: Vec<u32>,
    /// Profile offsets, ascending by component id
    pub profile_offsets: Vec<u32>,
    /// Popularity rank; lower is more popular
    pub rank: u32,
    device_id: OnceLock<String>,
    length: OnceLock<u32>,
}

impl Signature {
    pub(crate) fn new(
        index: u32,
        node_offsets: Vec<u32>,
        profile_offsets: Vec<u32>,
        rank: u32,
    ) -> Self {
        Self {
            index,
            node_offsets,
            profile_offsets,
            rank,
            device_id: OnceLock::new(),
            length: OnceLock::new(),
        }
    }

    /// The signature's profiles, one per component, ascending component id
    pub fn profiles(&self, dataset: &Dataset) -> Result<Vec<Arc<Profile>>> {
        self.profile_offsets
            .iter()
            .map(|&offset| dataset.profile_at(offset))
            .collect()
    }

    /// Every value the signature's profiles assign, in profile order
    pub fn values(&self, dataset: &Dataset) -> Result<Vec<Arc<Value>>> {
        let mut values = Vec::new();
        for profile in self.profiles(dataset)? {
            values.extend(profile.values(dataset)?);
        }
        Ok(values)
    }

    /// The `-`-joined profile ids, ascending by component id
    ///
    /// Stable across dataset rebuilds while the device's component
    /// composition is unchanged.
    pub fn device_id(&self, dataset: &Dataset) -> Result<String> {
        if let Some(cached) = self.device_id.get() {
            return Ok(cached.clone());
        }
        let profiles = self.profiles(dataset)?;
        let joined = join_device_id(&profiles);
        Ok(self.device_id.get_or_init(|| joined).clone())
    }

    /// Byte length of the shortest UA the signature can describe
    pub fn length(&self, dataset: &Dataset) -> Result<u32> {
        if let Some(&cached) = self.length.get() {
            return Ok(cached);
        }
        let mut length = 0u32;
        for &offset in &self.node_offsets {
            let node = dataset.node_at(offset)?;
            length = length.max(node.position as u32 + node.characters.len() as u32);
        }
        Ok(*self.length.get_or_init(|| length))
    }

    /// True when the signature's first nodes equal `nodes` in order
    pub fn starts_with(&self, nodes: &[u32]) -> bool {
        self.node_offsets.len() >= nodes.len() && self.node_offsets[..nodes.len()] == *nodes
    }

    /// Order by node-offset vectors; shorter is lesser on an equal prefix
    pub fn compare_nodes(&self, other: &[u32]) -> Ordering {
        self.node_offsets.as_slice().cmp(other)
    }

    /// Reconstruct the UA characters the signature describes
    ///
    /// Each node's run is laid at its position; unfilled gaps read as
    /// spaces.
    pub fn render(&self, dataset: &Dataset) -> Result<String> {
        let length = self.length(dataset)? as usize;
        let mut out = vec![b' '; length];
        for &offset in &self.node_offsets {
            let node = dataset.node_at(offset)?;
            let start = node.position as usize;
            out[start..start + node.characters.len()].copy_from_slice(&node.characters);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Join profile ids into a DeviceId, ascending by component id
pub fn join_device_id(profiles: &[Arc<Profile>]) -> String {
    let mut ordered: Vec<&Arc<Profile>> = profiles.iter().collect();
    ordered.sort_by_key(|profile| profile.component_id);
    ordered
        .iter()
        .map(|profile| profile.profile_id.to_string())
        .collect::<Vec<_>>()
        .join("-")
}
