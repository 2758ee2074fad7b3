//! Trie-file builder
//!
//! Builds the byte-indexed decision tree from (pattern, device) entries
//! and serializes the complete file. One trie node exists per pattern
//! byte; a node carries a device index only when a pattern terminates at
//! it, so walks inherit the deepest matched pattern's device.

use crate::error::{Result, TrieError};
use crate::{NO_CHILD, WIDTH_16, WIDTH_32, WIDTH_64};
use std::collections::{BTreeMap, HashMap};

struct BuildNode {
    children: BTreeMap<u8, usize>,
    device: Option<u32>,
}

/// Builds a complete trie file
pub struct TrieBuilder {
    copyright: String,
    properties: Vec<String>,
    devices: Vec<HashMap<String, String>>,
    entries: Vec<(Vec<u8>, u32)>,
    offset_width: u8,
}

impl TrieBuilder {
    /// Create a builder with the given copyright notice
    pub fn new(copyright: impl Into<String>) -> Self {
        Self {
            copyright: copyright.into(),
            properties: Vec::new(),
            devices: Vec::new(),
            entries: Vec::new(),
            offset_width: WIDTH_32,
        }
    }

    /// Declare a property; declaration order fixes the device-record layout
    pub fn property(&mut self, name: impl Into<String>) {
        self.properties.push(name.into());
    }

    /// Add a device with its property values; returns the device index
    ///
    /// Properties without a value serialize as the empty string.
    pub fn device(&mut self, values: Vec<(&str, &str)>) -> u32 {
        let index = self.devices.len() as u32;
        self.devices.push(
            values
                .into_iter()
                .map(|(property, value)| (property.to_string(), value.to_string()))
                .collect(),
        );
        index
    }

    /// Map a UA pattern prefix to a device
    pub fn entry(&mut self, pattern: impl AsRef<str>, device: u32) {
        self.entries
            .push((pattern.as_ref().as_bytes().to_vec(), device));
    }

    /// Force a child-offset width (default 32-bit)
    pub fn offset_width(&mut self, code: u8) {
        self.offset_width = code;
    }

    /// Serialize the trie file
    pub fn build(&self) -> Result<Vec<u8>> {
        for device in &self.devices {
            for property in device.keys() {
                if !self.properties.contains(property) {
                    return Err(TrieError::Invariant(format!(
                        "device references undeclared property {property}"
                    )));
                }
            }
        }

        // Byte trie with device indices at pattern ends.
        let mut arena = vec![BuildNode {
            children: BTreeMap::new(),
            device: None,
        }];
        for (pattern, device) in &self.entries {
            if *device as usize >= self.devices.len() {
                return Err(TrieError::Invariant(format!(
                    "entry references unknown device {device}"
                )));
            }
            let mut current = 0usize;
            for &byte in pattern {
                current = match arena[current].children.get(&byte) {
                    Some(&child) => child,
                    None => {
                        let child = arena.len();
                        arena.push(BuildNode {
                            children: BTreeMap::new(),
                            device: None,
                        });
                        arena[current].children.insert(byte, child);
                        child
                    }
                };
            }
            match arena[current].device {
                Some(existing) if existing != *device => {
                    return Err(TrieError::Invariant(format!(
                        "pattern maps to both device {existing} and device {device}"
                    )));
                }
                _ => arena[current].device = Some(*device),
            }
        }

        // Strings: property names and device values.
        let mut strings = StringRegion::default();
        let property_offsets: Vec<u32> = self
            .properties
            .iter()
            .map(|name| strings.intern(name))
            .collect();
        let mut device_records = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let record: Vec<u32> = self
                .properties
                .iter()
                .map(|property| strings.intern(device.get(property).map_or("", String::as_str)))
                .collect();
            device_records.push(record);
        }

        // Lookup lists, one per non-leaf node.
        let mut lookups = Vec::new();
        let mut lookup_offsets = vec![0u32; arena.len()];
        for (index, node) in arena.iter().enumerate() {
            if node.children.is_empty() {
                continue;
            }
            let low = *node.children.keys().next().expect("non-empty");
            let high = *node.children.keys().next_back().expect("non-empty");
            lookup_offsets[index] = lookups.len() as u32;
            lookups.push(low);
            lookups.push(high);
            for byte in low..=high {
                let ordinal = node
                    .children
                    .keys()
                    .position(|&key| key == byte)
                    .map(|slot| slot as u8)
                    .unwrap_or(NO_CHILD);
                lookups.push(ordinal);
            }
        }

        // Node layout: arena order, root first.
        let width_bytes: usize = match self.offset_width {
            WIDTH_16 => 2,
            WIDTH_32 => 4,
            WIDTH_64 => 8,
            other => {
                return Err(TrieError::Invariant(format!(
                    "unknown offset-width code {other}"
                )))
            }
        };
        let mut node_offsets = vec![0u64; arena.len()];
        let mut at = 0u64;
        for (index, node) in arena.iter().enumerate() {
            node_offsets[index] = at;
            let device_bytes = if node.device.is_some() { 4 } else { 0 };
            at += 4 + device_bytes + 2 + 1 + (node.children.len() * width_bytes) as u64;
        }
        let max_offset = node_offsets.last().copied().unwrap_or(0);
        if self.offset_width == WIDTH_16 && max_offset > u16::MAX as u64 {
            return Err(TrieError::Invariant(format!(
                "16-bit child offsets cannot address node at offset {max_offset}"
            )));
        }
        if self.offset_width == WIDTH_32 && max_offset > u32::MAX as u64 {
            return Err(TrieError::Invariant(format!(
                "32-bit child offsets cannot address node at offset {max_offset}"
            )));
        }

        let mut nodes = Vec::with_capacity(at as usize);
        for (index, node) in arena.iter().enumerate() {
            let mut lookup_raw = lookup_offsets[index] as i32;
            if node.device.is_some() {
                lookup_raw |= i32::MIN;
            }
            nodes.extend_from_slice(&lookup_raw.to_le_bytes());
            if let Some(device) = node.device {
                nodes.extend_from_slice(&device.to_le_bytes());
            }
            nodes.extend_from_slice(&(node.children.len() as u16).to_le_bytes());
            nodes.push(self.offset_width);
            for &child in node.children.values() {
                let offset = node_offsets[child];
                match self.offset_width {
                    WIDTH_16 => nodes.extend_from_slice(&(offset as u16).to_le_bytes()),
                    WIDTH_32 => nodes.extend_from_slice(&(offset as u32).to_le_bytes()),
                    _ => nodes.extend_from_slice(&offset.to_le_bytes()),
                }
            }
        }

        // Assemble the file.
        let mut out = Vec::new();
        out.extend_from_slice(&(self.copyright.len() as u16).to_le_bytes());
        out.extend_from_slice(self.copyright.as_bytes());
        out.extend_from_slice(&(strings.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&strings.bytes);
        out.extend_from_slice(&(self.properties.len() as u32).to_le_bytes());
        for offset in &property_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&(self.devices.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.properties.len() as u32).to_le_bytes());
        for record in &device_records {
            for offset in record {
                out.extend_from_slice(&offset.to_le_bytes());
            }
        }
        out.extend_from_slice(&(lookups.len() as u32).to_le_bytes());
        out.extend_from_slice(&lookups);
        out.extend_from_slice(&(nodes.len() as u64).to_le_bytes());
        out.extend_from_slice(&nodes);
        Ok(out)
    }
}

#[derive(Default)]
struct StringRegion {
    bytes: Vec<u8>,
    seen: HashMap<String, u32>,
}

impl StringRegion {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.seen.get(s) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes
            .extend_from_slice(&(s.len() as u16).to_le_bytes());
        self.bytes.extend_from_slice(s.as_bytes());
        self.seen.insert(s.to_string(), offset);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrieProvider;

    #[test]
    fn sixteen_bit_offsets_round_trip() {
        let mut builder = TrieBuilder::new("");
        builder.property("Kind");
        let bot = builder.device(vec![("Kind", "Crawler")]);
        builder.entry("curl/", bot);
        builder.offset_width(WIDTH_16);
        let trie = TrieProvider::from_bytes(builder.build().unwrap()).unwrap();
        let result = trie.match_user_agent("curl/8.5.0").unwrap();
        assert_eq!(trie.device_value(result.device_index, "Kind").unwrap(), Some("Crawler"));
    }

    #[test]
    fn conflicting_pattern_devices_fail() {
        let mut builder = TrieBuilder::new("");
        builder.property("Kind");
        let a = builder.device(vec![("Kind", "A")]);
        let b = builder.device(vec![("Kind", "B")]);
        builder.entry("same", a);
        builder.entry("same", b);
        assert!(matches!(builder.build(), Err(TrieError::Invariant(_))));
    }

    #[test]
    fn undeclared_property_fails() {
        let mut builder = TrieBuilder::new("");
        builder.property("Kind");
        builder.device(vec![("Missing", "x")]);
        assert!(builder.build().is_err());
    }

    #[test]
    fn longest_declared_prefix_wins() {
        let mut builder = TrieBuilder::new("");
        builder.property("Name");
        let generic = builder.device(vec![("Name", "Mozilla")]);
        let specific = builder.device(vec![("Name", "Firefox")]);
        builder.entry("Mozilla/5.0", generic);
        builder.entry("Mozilla/5.0 (X11; Linux) Gecko Firefox", specific);
        let trie = TrieProvider::from_bytes(builder.build().unwrap()).unwrap();

        let deep = trie
            .match_user_agent("Mozilla/5.0 (X11; Linux) Gecko Firefox/121.0")
            .unwrap();
        assert_eq!(trie.device_value(deep.device_index, "Name").unwrap(), Some("Firefox"));

        let shallow = trie.match_user_agent("Mozilla/5.0 (Macintosh)").unwrap();
        assert_eq!(
            trie.device_value(shallow.device_index, "Name").unwrap(),
            Some("Mozilla")
        );
    }
}
