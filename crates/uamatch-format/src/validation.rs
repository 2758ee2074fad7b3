//! Data-file validation for untrusted files
//!
//! Walks every region of a data file and checks the structural invariants
//! a correct file upholds: regions inside the file, cross-references inside
//! their target regions, signature node positions strictly ascending, node
//! children ordered for binary search, one profile per component per
//! signature. [`validate`] stops at the first violation;
//! [`validate_collecting`] keeps going and returns everything it found,
//! which is the useful mode for tooling.

use crate::error::{FormatError, Result};
use crate::layout::{
    Header, Version, NODE_MID_LEN, NODE_PREFIX_LEN, NONE_OFFSET, SIGNATURE_HEADER_LEN_V32,
    STRING_PREFIX_LEN,
};

struct Slice<'a> {
    bytes: &'a [u8],
}

impl<'a> Slice<'a> {
    fn u16_at(&self, at: usize) -> Option<u16> {
        let b = self.bytes.get(at..at + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_at(&self, at: usize) -> Option<u32> {
        let b = self.bytes.get(at..at + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Validate a data file, failing on the first violation
pub fn validate(bytes: &[u8]) -> Result<()> {
    let violations = validate_collecting(bytes)?;
    match violations.into_iter().next() {
        Some(first) => Err(FormatError::Invariant(first)),
        None => Ok(()),
    }
}

/// Validate a data file, returning every violation found
///
/// Header-level failures (bad magic, truncation) still fail immediately
/// since nothing else can be interpreted without a header.
pub fn validate_collecting(bytes: &[u8]) -> Result<Vec<String>> {
    let header = Header::parse(bytes)?;
    let file_len = bytes.len() as u64;
    let slice = Slice { bytes };
    let mut violations = Vec::new();

    let mut region = |name: &'static str, offset: u32, len: u64| {
        if offset as u64 + len > file_len {
            violations.push(format!(
                "{name} region out of bounds (offset {offset}, len {len}, file {file_len})"
            ));
            false
        } else {
            true
        }
    };

    let strings_ok = region("strings", header.strings_offset, header.strings_byte_len as u64);
    region("components", header.components_offset, header.component_count as u64 * 16);
    region("maps", header.maps_offset, header.map_count as u64 * 8);
    region("properties", header.properties_offset, header.property_count as u64 * 48);
    region("values", header.values_offset, header.value_count as u64 * 16);
    let profiles_ok = region("profiles", header.profiles_offset, header.profiles_byte_len as u64);
    region("profile index", header.profile_index_offset, header.profile_count as u64 * 4);
    let signatures_ok = region(
        "signatures",
        header.signatures_offset,
        header.signatures_byte_len as u64,
    );
    region(
        "ranked signatures",
        header.ranked_signatures_offset,
        header.signature_count as u64 * 4,
    );
    let nodes_ok = region("nodes", header.nodes_offset, header.nodes_byte_len as u64);
    region("node index", header.node_index_offset, header.node_count as u64 * 4);
    region("value ranges", header.value_ranges_offset, header.property_count as u64 * 8);
    if header.version == Version::V32 {
        region(
            "signature index",
            header.signature_index_offset,
            header.signature_count as u64 * 4,
        );
    }
    if !(strings_ok && profiles_ok && signatures_ok && nodes_ok) {
        return Ok(violations);
    }

    check_string_refs(&slice, &header, &mut violations);
    let node_positions = check_nodes(&slice, &header, &mut violations);
    check_signatures(&slice, &header, &node_positions, &mut violations);
    check_value_ranges(&slice, &header, &mut violations);

    Ok(violations)
}

fn string_ref_ok(slice: &Slice<'_>, header: &Header, offset: u32) -> bool {
    if offset == NONE_OFFSET {
        return true;
    }
    if offset >= header.strings_byte_len {
        return false;
    }
    let at = header.strings_offset as usize + offset as usize;
    match slice.u16_at(at) {
        Some(len) => {
            offset as usize + STRING_PREFIX_LEN + len as usize <= header.strings_byte_len as usize
        }
        None => false,
    }
}

fn check_string_refs(slice: &Slice<'_>, header: &Header, violations: &mut Vec<String>) {
    if !string_ref_ok(slice, header, header.copyright_offset) {
        violations.push("copyright string reference out of bounds".into());
    }
    for index in 0..header.component_count {
        let at = header.components_offset as usize + index as usize * 16;
        if let Some(name) = slice.u32_at(at + 4) {
            if !string_ref_ok(slice, header, name) {
                violations.push(format!("component {index} name string out of bounds"));
            }
        }
    }
    for index in 0..header.property_count {
        let at = header.properties_offset as usize + index as usize * 48;
        for (field, label) in [(8usize, "name"), (12, "description"), (16, "category")] {
            if let Some(offset) = slice.u32_at(at + field) {
                if !string_ref_ok(slice, header, offset) {
                    violations.push(format!("property {index} {label} string out of bounds"));
                }
            }
        }
    }
    for index in 0..header.value_count {
        let at = header.values_offset as usize + index as usize * 16;
        if let Some(name) = slice.u32_at(at) {
            if !string_ref_ok(slice, header, name) {
                violations.push(format!("value {index} name string out of bounds"));
            }
        }
        if let Some(property) = slice.u32_at(at + 12) {
            if property >= header.property_count {
                violations.push(format!(
                    "value {index} references property {property} of {}",
                    header.property_count
                ));
            }
        }
    }
}

/// Walk every node record; returns position-by-offset for signature checks
fn check_nodes(
    slice: &Slice<'_>,
    header: &Header,
    violations: &mut Vec<String>,
) -> Vec<(u32, u16)> {
    let mut positions = Vec::with_capacity(header.node_count as usize);
    let region_start = header.nodes_offset as usize;
    let region_len = header.nodes_byte_len as usize;
    let mut at = 0usize;
    for index in 0..header.node_count {
        if at + NODE_PREFIX_LEN > region_len {
            violations.push(format!("node {index} truncated at offset {at}"));
            break;
        }
        let record = region_start + at;
        let position = slice.u16_at(record + 4).unwrap_or(0);
        let chars_len = slice.u16_at(record + 6).unwrap_or(0) as usize;
        let mid = record + NODE_PREFIX_LEN + chars_len;
        if at + NODE_PREFIX_LEN + chars_len + NODE_MID_LEN > region_len {
            violations.push(format!("node {index} character run overruns region"));
            break;
        }
        let child_count = slice.u16_at(mid).unwrap_or(0) as usize;
        let numeric_count = slice.u16_at(mid + 2).unwrap_or(0) as usize;
        let signature_count = slice.u32_at(mid + 4).unwrap_or(0) as usize;
        let body = NODE_PREFIX_LEN + chars_len + NODE_MID_LEN
            + 8 * child_count
            + 8 * numeric_count
            + 4 * signature_count;
        if at + body > region_len {
            violations.push(format!("node {index} body overruns region"));
            break;
        }
        if header.version == Version::V31 && numeric_count > 0 {
            violations.push(format!("node {index} has numeric children in a v3.1 file"));
        }

        let children_at = mid + NODE_MID_LEN;
        let mut last: Option<(u16, u8)> = None;
        for child in 0..child_count {
            let entry = children_at + child * 8;
            let first_byte = slice.bytes[entry];
            let child_position = slice.u16_at(entry + 2).unwrap_or(0);
            let child_offset = slice.u32_at(entry + 4).unwrap_or(0);
            if child_offset >= header.nodes_byte_len {
                violations.push(format!("node {index} child {child} offset out of bounds"));
            }
            let key = (child_position, first_byte);
            if let Some(previous) = last {
                if key <= previous {
                    violations.push(format!(
                        "node {index} children not ordered by (position, byte)"
                    ));
                }
            }
            last = Some(key);
        }
        let numeric_at = children_at + 8 * child_count;
        let mut last_value: Option<u16> = None;
        for child in 0..numeric_count {
            let entry = numeric_at + child * 8;
            let value = slice.u16_at(entry).unwrap_or(0);
            if let Some(previous) = last_value {
                if value <= previous {
                    violations.push(format!("node {index} numeric children not ordered"));
                }
            }
            last_value = Some(value);
            if slice.u32_at(entry + 4).unwrap_or(0) >= header.nodes_byte_len {
                violations.push(format!(
                    "node {index} numeric child {child} offset out of bounds"
                ));
            }
        }
        let signatures_at = numeric_at + 8 * numeric_count;
        for signature in 0..signature_count {
            let value = slice.u32_at(signatures_at + signature * 4).unwrap_or(0);
            if value >= header.signature_count {
                violations.push(format!(
                    "node {index} references signature {value} of {}",
                    header.signature_count
                ));
            }
        }

        positions.push((at as u32, position));
        at += body;
    }
    positions
}

fn check_signatures(
    slice: &Slice<'_>,
    header: &Header,
    node_positions: &[(u32, u16)],
    violations: &mut Vec<String>,
) {
    let position_of = |offset: u32| -> Option<u16> {
        node_positions
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|i| node_positions[i].1)
    };
    let profile_component = |offset: u32| -> Option<u8> {
        if offset >= header.profiles_byte_len {
            return None;
        }
        slice
            .bytes
            .get(header.profiles_offset as usize + offset as usize)
            .copied()
    };

    for index in 0..header.signature_count {
        let (profiles, nodes) = match header.version {
            Version::V32 => {
                let index_at = header.signature_index_offset as usize + index as usize * 4;
                let Some(record_offset) = slice.u32_at(index_at) else {
                    violations.push(format!("signature index entry {index} unreadable"));
                    continue;
                };
                if record_offset as usize + SIGNATURE_HEADER_LEN_V32
                    > header.signatures_byte_len as usize
                {
                    violations.push(format!(
                        "signature {index} record offset {record_offset} out of bounds"
                    ));
                    continue;
                }
                let record = header.signatures_offset as usize + record_offset as usize;
                let Some(node_count) = slice.u16_at(record) else {
                    violations.push(format!("signature {index} header unreadable"));
                    continue;
                };
                let profile_count = slice.u16_at(record + 2).unwrap_or(0);
                let profiles_at = record + SIGNATURE_HEADER_LEN_V32;
                let profiles: Vec<u32> = (0..profile_count as usize)
                    .filter_map(|i| slice.u32_at(profiles_at + i * 4))
                    .collect();
                let nodes_at = profiles_at + profile_count as usize * 4;
                let nodes: Vec<u32> = (0..node_count as usize)
                    .filter_map(|i| slice.u32_at(nodes_at + i * 4))
                    .collect();
                (profiles, nodes)
            }
            Version::V31 => {
                let stride = header.signature_stride_v31();
                let record = header.signatures_offset as usize + index as usize * stride;
                let profiles: Vec<u32> = (0..header.signature_profiles_count as usize)
                    .filter_map(|i| slice.u32_at(record + i * 4))
                    .filter(|&o| o != NONE_OFFSET)
                    .collect();
                let nodes_at = record + header.signature_profiles_count as usize * 4;
                let nodes: Vec<u32> = (0..header.signature_nodes_count as usize)
                    .filter_map(|i| slice.u32_at(nodes_at + i * 4))
                    .filter(|&o| o != NONE_OFFSET)
                    .collect();
                (profiles, nodes)
            }
        };

        let mut components = Vec::new();
        for &profile in &profiles {
            match profile_component(profile) {
                Some(component) => {
                    if components.contains(&component) {
                        violations.push(format!(
                            "signature {index} has two profiles for component {component}"
                        ));
                    }
                    if let Some(&previous) = components.last() {
                        if component < previous {
                            violations.push(format!(
                                "signature {index} profiles not ordered by component"
                            ));
                        }
                    }
                    components.push(component);
                }
                None => violations.push(format!(
                    "signature {index} profile offset {profile} out of bounds"
                )),
            }
        }

        let mut last_position: Option<u16> = None;
        for &node in &nodes {
            match position_of(node) {
                Some(position) => {
                    if let Some(previous) = last_position {
                        if position <= previous {
                            violations.push(format!(
                                "signature {index} node positions not strictly ascending"
                            ));
                        }
                    }
                    last_position = Some(position);
                }
                None => violations.push(format!(
                    "signature {index} node offset {node} does not start a node"
                )),
            }
        }
    }
}

fn check_value_ranges(slice: &Slice<'_>, header: &Header, violations: &mut Vec<String>) {
    for index in 0..header.property_count {
        let at = header.value_ranges_offset as usize + index as usize * 8;
        let first = slice.u32_at(at).unwrap_or(0);
        let last = slice.u32_at(at + 4).unwrap_or(0);
        if first == NONE_OFFSET && last == NONE_OFFSET {
            continue;
        }
        if first > last || last >= header.value_count {
            violations.push(format!(
                "property {index} value range {first}..={last} invalid for {} values",
                header.value_count
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{
        ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, SignatureSpec,
    };
    use crate::layout::PropertyValueType;

    fn fixture() -> Vec<u8> {
        DatasetBuilder::new(Version::V32)
            .copyright("validation fixture")
            .component(ComponentSpec::new(1, "Hardware"))
            .property(
                PropertySpec::new("IsMobile", 1, PropertyValueType::Bool).default_value("False"),
            )
            .profile(ProfileSpec::new(10, 1).value("IsMobile", "True"))
            .profile(ProfileSpec::new(11, 1).value("IsMobile", "False"))
            .signature(SignatureSpec::new(0, vec![10]).fragment(0, "Mobile Safari"))
            .signature(SignatureSpec::new(1, vec![11]).fragment(0, "Macintosh"))
            .build()
            .unwrap()
    }

    #[test]
    fn clean_file_passes() {
        let bytes = fixture();
        assert!(validate(&bytes).is_ok());
        assert!(validate_collecting(&bytes).unwrap().is_empty());
    }

    #[test]
    fn truncated_file_fails() {
        let bytes = fixture();
        let truncated = &bytes[..bytes.len() - 12];
        assert!(!validate_collecting(truncated).unwrap().is_empty());
    }

    #[test]
    fn corrupt_value_range_is_reported() {
        let mut bytes = fixture();
        let header = Header::parse(&bytes).unwrap();
        let at = header.value_ranges_offset as usize;
        bytes[at..at + 4].copy_from_slice(&5u32.to_le_bytes());
        bytes[at + 4..at + 8].copy_from_slice(&2u32.to_le_bytes());
        let violations = validate_collecting(&bytes).unwrap();
        assert!(violations.iter().any(|v| v.contains("value range")));
    }

    #[test]
    fn corrupt_signature_index_is_reported() {
        let mut bytes = fixture();
        let header = Header::parse(&bytes).unwrap();
        // Point the second signature's record past the region end.
        let at = header.signature_index_offset as usize + 4;
        bytes[at..at + 4].copy_from_slice(&header.signatures_byte_len.to_le_bytes());
        let violations = validate_collecting(&bytes).unwrap();
        assert!(violations.iter().any(|v| v.contains("signature 1")));
    }

    #[test]
    fn v31_fixture_passes() {
        let bytes = DatasetBuilder::new(Version::V31)
            .component(ComponentSpec::new(1, "Hardware"))
            .property(PropertySpec::new("IsMobile", 1, PropertyValueType::Bool))
            .profile(ProfileSpec::new(10, 1).value("IsMobile", "True"))
            .signature(SignatureSpec::new(0, vec![10]).fragment(0, "Mobile"))
            .build()
            .unwrap();
        assert!(validate(&bytes).is_ok());
    }
}
