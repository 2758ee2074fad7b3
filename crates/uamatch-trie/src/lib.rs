//! Byte-indexed decision-tree provider
//!
//! The trie format trades file size for latency: matching walks one node
//! per User-Agent byte through per-byte lookup tables, with no candidate
//! scoring at all. Every walk terminates with a device index, which
//! resolves to property values through the devices block.
//!
//! # File layout
//!
//! ```text
//! [u16 copyright length][copyright bytes]
//! [u32 strings length][strings: u16 length-prefixed runs]
//! [u32 property count][u32 string-offset per property name]
//! [u32 device count][u32 property count]
//! [device records: one u32 string-offset per property]
//! [u32 lookup length][lookup lists: low u8, high u8, ordinals]
//! [u64 nodes length]
//! [nodes]
//! ```
//!
//! A node stores a lookup-list offset whose sign bit says whether the node
//! carries its own device index or inherits its parent's, the optional
//! 32-bit device index, a child count, an offset-width byte (0, 1, 2 for
//! 16/32/64-bit child offsets), and the child-offset table. Child offsets
//! are relative to the start of the nodes region.
//!
//! Walking: for UA byte `b`, bound-check `b` against the lookup list's
//! `[low, high]`; out of range or an ordinal of 255 terminates with the
//! current device index. Otherwise the walk seeks the chosen child and
//! advances one byte.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Trie-file builder
pub mod builder;
/// Error types
pub mod error;

pub use builder::TrieBuilder;
pub use error::{Result, TrieError};

use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Child ordinal marking "no child" in a lookup table
pub const NO_CHILD: u8 = 0xFF;

/// Offset-width byte: 16-bit child offsets
pub const WIDTH_16: u8 = 0;
/// Offset-width byte: 32-bit child offsets
pub const WIDTH_32: u8 = 1;
/// Offset-width byte: 64-bit child offsets
pub const WIDTH_64: u8 = 2;

enum Storage {
    Owned(Vec<u8>),
    Mapped(Arc<Mmap>),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(bytes) => bytes,
            Storage::Mapped(map) => map,
        }
    }
}

struct Regions {
    copyright: (usize, usize),
    strings: (usize, usize),
    property_count: u32,
    properties: usize,
    device_count: u32,
    device_property_count: u32,
    devices: usize,
    lookups: (usize, usize),
    nodes: (usize, usize),
}

/// A matched device: its index plus access to its property values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieMatch {
    /// Index into the devices block
    pub device_index: u32,
    /// UA bytes consumed before the walk terminated
    pub bytes_walked: usize,
}

/// Builder for opening trie providers
pub struct TrieProviderOpener {
    path: PathBuf,
}

impl TrieProviderOpener {
    /// Open the trie file
    pub fn open(self) -> Result<TrieProvider> {
        let file = File::open(&self.path)?;
        let map = unsafe { Mmap::map(&file) }?;
        TrieProvider::from_storage(Storage::Mapped(Arc::new(map)))
    }
}

/// Latency-critical alternative matcher over a trie file
pub struct TrieProvider {
    storage: Storage,
    regions: Regions,
}

impl TrieProvider {
    /// Open a trie provider for the file at `path`
    pub fn from(path: impl AsRef<Path>) -> TrieProviderOpener {
        TrieProviderOpener {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Open a trie provider over owned bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_storage(Storage::Owned(bytes))
    }

    fn from_storage(storage: Storage) -> Result<Self> {
        let regions = Self::parse_regions(storage.bytes())?;
        Ok(Self { storage, regions })
    }

    fn parse_regions(bytes: &[u8]) -> Result<Regions> {
        let mut at = 0usize;
        let take =
            |at: &mut usize, n: usize, what: &str| -> Result<usize> {
                if *at + n > bytes.len() {
                    return Err(TrieError::Truncated(format!(
                        "{what} at offset {at} needs {n} bytes of {}",
                        bytes.len()
                    )));
                }
                let here = *at;
                *at += n;
                Ok(here)
            };
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        let copyright_len = u16_at(take(&mut at, 2, "copyright length")?) as usize;
        let copyright = (take(&mut at, copyright_len, "copyright")?, copyright_len);

        let strings_len = u32_at(take(&mut at, 4, "strings length")?) as usize;
        let strings = (take(&mut at, strings_len, "strings")?, strings_len);

        let property_count = u32_at(take(&mut at, 4, "property count")?);
        let properties = take(&mut at, property_count as usize * 4, "properties")?;

        let device_count = u32_at(take(&mut at, 4, "device count")?);
        let device_property_count = u32_at(take(&mut at, 4, "device property count")?);
        let devices = take(
            &mut at,
            device_count as usize * device_property_count as usize * 4,
            "devices",
        )?;

        let lookups_len = u32_at(take(&mut at, 4, "lookup length")?) as usize;
        let lookups = (take(&mut at, lookups_len, "lookups")?, lookups_len);

        let nodes_start = take(&mut at, 8, "nodes length")?;
        let nodes_len = u64::from_le_bytes(
            bytes[nodes_start..nodes_start + 8]
                .try_into()
                .expect("eight bytes"),
        ) as usize;
        let nodes = (take(&mut at, nodes_len, "nodes")?, nodes_len);

        if device_property_count != property_count {
            return Err(TrieError::Invariant(format!(
                "device records carry {device_property_count} values for {property_count} properties"
            )));
        }
        Ok(Regions {
            copyright,
            strings,
            property_count,
            properties,
            device_count,
            device_property_count,
            devices,
            lookups,
            nodes,
        })
    }

    fn u16_at(&self, at: usize) -> u16 {
        let bytes = self.storage.bytes();
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn u32_at(&self, at: usize) -> u32 {
        let bytes = self.storage.bytes();
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    /// Copyright notice embedded in the file
    pub fn copyright(&self) -> &str {
        let (at, len) = self.regions.copyright;
        std::str::from_utf8(&self.storage.bytes()[at..at + len]).unwrap_or("")
    }

    /// Number of properties each device carries
    pub fn property_count(&self) -> u32 {
        self.regions.property_count
    }

    /// Number of devices in the file
    pub fn device_count(&self) -> u32 {
        self.regions.device_count
    }

    fn string_at(&self, offset: u32) -> Result<&str> {
        let (strings, len) = self.regions.strings;
        if offset as usize + 2 > len {
            return Err(TrieError::Truncated(format!(
                "string offset {offset} outside {len}-byte region"
            )));
        }
        let at = strings + offset as usize;
        let run = self.u16_at(at) as usize;
        if offset as usize + 2 + run > len {
            return Err(TrieError::Truncated(format!(
                "string at offset {offset} overruns region"
            )));
        }
        std::str::from_utf8(&self.storage.bytes()[at + 2..at + 2 + run])
            .map_err(|_| TrieError::Invariant(format!("string at offset {offset} is not UTF-8")))
    }

    /// Property names, in device-record order
    pub fn property_names(&self) -> Result<Vec<&str>> {
        (0..self.regions.property_count)
            .map(|index| {
                let offset = self.u32_at(self.regions.properties + index as usize * 4);
                self.string_at(offset)
            })
            .collect()
    }

    /// One property value of a device
    pub fn device_value(&self, device_index: u32, property: &str) -> Result<Option<&str>> {
        if device_index >= self.regions.device_count {
            return Err(TrieError::Invariant(format!(
                "device index {device_index} out of {}",
                self.regions.device_count
            )));
        }
        let names = self.property_names()?;
        let Some(slot) = names.iter().position(|name| *name == property) else {
            return Ok(None);
        };
        let record = self.regions.devices
            + (device_index as usize * self.regions.device_property_count as usize + slot) * 4;
        let offset = self.u32_at(record);
        self.string_at(offset).map(Some)
    }

    /// Every property value of a device, in property order
    pub fn device_values(&self, device_index: u32) -> Result<Vec<(&str, &str)>> {
        if device_index >= self.regions.device_count {
            return Err(TrieError::Invariant(format!(
                "device index {device_index} out of {}",
                self.regions.device_count
            )));
        }
        let names = self.property_names()?;
        let record_start = self.regions.devices
            + device_index as usize * self.regions.device_property_count as usize * 4;
        names
            .into_iter()
            .enumerate()
            .map(|(slot, name)| {
                let offset = self.u32_at(record_start + slot * 4);
                Ok((name, self.string_at(offset)?))
            })
            .collect()
    }

    /// Walk the trie one node per UA byte
    ///
    /// Non-ASCII bytes are rewritten to 0x20 like the signature matcher.
    /// The walk terminates with the deepest device index seen, so a UA
    /// running past the known prefixes still resolves (the Nearest-like
    /// fallback).
    pub fn match_user_agent(&self, user_agent: &str) -> Result<TrieMatch> {
        let (nodes, nodes_len) = self.regions.nodes;
        let (lookups, lookups_len) = self.regions.lookups;
        let bytes = self.storage.bytes();

        let mut at = nodes; // root is the first node
        let mut device_index = 0u32;
        let mut walked = 0usize;
        for raw in user_agent.bytes() {
            let byte = if raw < 0x80 { raw } else { b' ' };

            if at + 4 > nodes + nodes_len {
                return Err(TrieError::Truncated(format!(
                    "node at offset {} overruns nodes region",
                    at - nodes
                )));
            }
            let lookup_raw = i32::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
            ]);
            let mut cursor = at + 4;
            // Sign bit: the node carries its own device index.
            if lookup_raw < 0 {
                if cursor + 4 > nodes + nodes_len {
                    return Err(TrieError::Truncated(format!(
                        "node at offset {} overruns nodes region",
                        at - nodes
                    )));
                }
                device_index = self.u32_at(cursor);
                cursor += 4;
            }
            if cursor + 3 > nodes + nodes_len {
                return Err(TrieError::Truncated(format!(
                    "node at offset {} overruns nodes region",
                    at - nodes
                )));
            }
            let lookup_offset = (lookup_raw & i32::MAX) as usize;
            let child_count = self.u16_at(cursor) as usize;
            let width_code = bytes[cursor + 2];
            cursor += 3;
            if child_count == 0 {
                return Ok(TrieMatch {
                    device_index,
                    bytes_walked: walked,
                });
            }

            if lookup_offset + 2 > lookups_len {
                return Err(TrieError::Truncated(format!(
                    "lookup list offset {lookup_offset} outside {lookups_len}-byte region"
                )));
            }
            let low = bytes[lookups + lookup_offset];
            let high = bytes[lookups + lookup_offset + 1];
            if lookup_offset + 2 + (high.saturating_sub(low) as usize + 1) > lookups_len {
                return Err(TrieError::Truncated(format!(
                    "lookup list at offset {lookup_offset} overruns region"
                )));
            }
            if byte < low || byte > high {
                return Ok(TrieMatch {
                    device_index,
                    bytes_walked: walked,
                });
            }
            let table = lookups + lookup_offset + 2;
            let ordinal = bytes[table + (byte - low) as usize];
            if ordinal == NO_CHILD {
                return Ok(TrieMatch {
                    device_index,
                    bytes_walked: walked,
                });
            }
            if ordinal as usize >= child_count {
                return Err(TrieError::Invariant(format!(
                    "lookup ordinal {ordinal} out of {child_count} children"
                )));
            }

            let width_bytes = match width_code {
                WIDTH_16 => 2,
                WIDTH_32 => 4,
                WIDTH_64 => 8,
                other => {
                    return Err(TrieError::Invariant(format!(
                        "unknown offset-width code {other}"
                    )))
                }
            };
            if cursor + child_count * width_bytes > nodes + nodes_len {
                return Err(TrieError::Truncated(format!(
                    "child table of node at offset {} overruns nodes region",
                    at - nodes
                )));
            }
            let child_at = cursor + ordinal as usize * width_bytes;
            let child_offset = match width_code {
                WIDTH_16 => self.u16_at(child_at) as u64,
                WIDTH_32 => self.u32_at(child_at) as u64,
                _ => u64::from_le_bytes(
                    bytes[child_at..child_at + 8].try_into().expect("eight bytes"),
                ),
            };
            at = nodes + child_offset as usize;
            walked += 1;
        }
        // UA exhausted: the deepest node visited decides. Its own device
        // index, if any, has not been read yet.
        if at + 4 <= nodes + nodes_len {
            let lookup_raw =
                i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            if lookup_raw < 0 {
                device_index = self.u32_at(at + 4);
            }
        }
        Ok(TrieMatch {
            device_index,
            bytes_walked: walked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TrieBuilder;

    fn provider() -> TrieProvider {
        let mut builder = TrieBuilder::new("test trie");
        builder.property("IsMobile");
        builder.property("HardwareName");
        let desktop = builder.device(vec![("IsMobile", "False"), ("HardwareName", "Desktop")]);
        let galaxy = builder.device(vec![("IsMobile", "True"), ("HardwareName", "Galaxy S5")]);
        let iphone = builder.device(vec![("IsMobile", "True"), ("HardwareName", "iPhone")]);
        builder.entry("Mozilla/5.0 (Windows NT", desktop);
        builder.entry("Mozilla/5.0 (Linux; Android 5.0; SM-G900F", galaxy);
        builder.entry("Mozilla/5.0 (iPhone", iphone);
        TrieProvider::from_bytes(builder.build().unwrap()).unwrap()
    }

    #[test]
    fn exact_prefix_resolves_device() {
        let trie = provider();
        let result = trie
            .match_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 9_0 like Mac OS X)")
            .unwrap();
        assert_eq!(
            trie.device_value(result.device_index, "HardwareName").unwrap(),
            Some("iPhone")
        );
        assert_eq!(
            trie.device_value(result.device_index, "IsMobile").unwrap(),
            Some("True")
        );
    }

    #[test]
    fn divergence_falls_back_to_deepest_device() {
        let trie = provider();
        // Shares the "Mozilla/5.0 (" prefix then diverges; the walk stops
        // at the divergence with whatever device was inherited.
        let result = trie.match_user_agent("Mozilla/5.0 (X11; Linux x86_64)").unwrap();
        assert!(result.device_index < trie.device_count());
        assert!(result.bytes_walked >= "Mozilla/5.0 (".len());
    }

    #[test]
    fn unknown_property_is_none() {
        let trie = provider();
        let result = trie.match_user_agent("Mozilla/5.0 (iPhone").unwrap();
        assert_eq!(trie.device_value(result.device_index, "Nope").unwrap(), None);
    }

    #[test]
    fn copyright_round_trips() {
        assert_eq!(provider().copyright(), "test trie");
    }

    #[test]
    fn empty_ua_matches_root_device() {
        let trie = provider();
        let result = trie.match_user_agent("").unwrap();
        assert_eq!(result.bytes_walked, 0);
    }

    #[test]
    fn memory_mapped_file_matches_like_bytes() {
        let mut builder = TrieBuilder::new("mmap test");
        builder.property("Kind");
        let bot = builder.device(vec![("Kind", "Crawler")]);
        builder.entry("curl/", bot);
        let bytes = builder.build().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.trie");
        std::fs::write(&path, &bytes).unwrap();

        let mapped = TrieProvider::from(&path).open().unwrap();
        let owned = TrieProvider::from_bytes(bytes).unwrap();
        let a = mapped.match_user_agent("curl/8.5.0").unwrap();
        let b = owned.match_user_agent("curl/8.5.0").unwrap();
        assert_eq!(a, b);
        assert_eq!(mapped.copyright(), "mmap test");
    }
}
