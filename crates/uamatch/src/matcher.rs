//! The five-strategy signature matcher
//!
//! A match walks the character-positional node DAG to collect the nodes
//! whose byte runs align with the candidate User-Agent, then resolves a
//! signature through a ladder of strategies:
//!
//! 1. **Exact** - a signature's node vector equals the matched vector.
//! 2. **Numeric** (v3.2) - re-walk substituting the nearest numeric child
//!    where an integer in the UA diverges from the canonical one.
//! 3. **Nearest** - among signatures sharing nodes with the matched set,
//!    one whose nodes are all matched; scored by the surplus matched nodes.
//! 4. **Closest** - byte-level difference between each candidate's runs
//!    and the UA at the runs' positions.
//! 5. **None** - nothing matched; the dataset's default profiles apply.
//!
//! Ties always break by rank ascending, then signature index ascending, so
//! a match is a pure function of (dataset, User-Agent). Non-ASCII input
//! bytes are rewritten to 0x20 before matching.

use crate::dataset::Dataset;
use crate::entities::{join_device_id, Node, Profile, Signature};
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uamatch_format::Version;

/// How a match was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    /// Node vector equality
    Exact,
    /// Numeric-child substitution
    Numeric,
    /// Signature contained in the matched node set
    Nearest,
    /// Byte-level difference scoring
    Closest,
    /// No node matched; default profiles
    None,
}

impl MatchMethod {
    /// Stable name for logs and serialization
    pub fn name(self) -> &'static str {
        match self {
            MatchMethod::Exact => "Exact",
            MatchMethod::Numeric => "Numeric",
            MatchMethod::Nearest => "Nearest",
            MatchMethod::Closest => "Closest",
            MatchMethod::None => "None",
        }
    }
}

/// Immutable result of one match
///
/// Self-contained: property values, device id and the rendered signature
/// are resolved at build time, so a result stays valid after its dataset
/// is swapped out or disposed.
#[derive(Debug, Clone)]
pub struct Match {
    /// Strategy that resolved the match
    pub method: MatchMethod,
    /// Strategy-specific difference; 0 for Exact, UA length for None
    pub difference: u32,
    /// Winning candidate score for Nearest/Closest; equals `difference`
    pub lowest_score: u32,
    /// Node records evaluated
    pub nodes_evaluated: u32,
    /// Signature records compared or scored
    pub signatures_compared: u32,
    /// False when the node-evaluation budget cut the match short
    pub is_complete: bool,
    /// Wall-clock time of the match
    pub elapsed: Duration,
    /// The User-Agent as matched
    pub user_agent: String,
    device_id: String,
    signature_index: Option<u32>,
    signature_rank: Option<u32>,
    signature_string: Option<String>,
    /// (property name, value names), sorted by property name
    properties: Vec<(String, Vec<String>)>,
}

impl Match {
    /// Values of a property; `None` when the property is absent
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.properties
            .binary_search_by(|(candidate, _)| candidate.as_str().cmp(name))
            .ok()
            .map(|slot| self.properties[slot].1.as_slice())
    }

    /// First value of a property
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values(name)?.first().map(String::as_str)
    }

    /// The matched device's id: `-`-joined profile ids
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Index of the matched signature, when one matched
    pub fn signature_index(&self) -> Option<u32> {
        self.signature_index
    }

    /// Rank of the matched signature, when one matched
    pub fn signature_rank(&self) -> Option<u32> {
        self.signature_rank
    }

    /// The matched signature rendered to its UA characters
    pub fn signature(&self) -> Option<&str> {
        self.signature_string.as_deref()
    }

    /// Every matched property with its values, sorted by name
    pub fn properties(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.properties
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Replace (or insert) a property's values; used by explicit overrides
    pub(crate) fn override_value(&mut self, name: &str, value: String) {
        match self
            .properties
            .binary_search_by(|(candidate, _)| candidate.as_str().cmp(name))
        {
            Ok(slot) => self.properties[slot].1 = vec![value],
            Err(slot) => self.properties.insert(slot, (name.to_string(), vec![value])),
        }
    }
}

struct MatchState {
    nodes_evaluated: u32,
    signatures_compared: u32,
    complete: bool,
    budget: u64,
}

impl MatchState {
    fn new(budget: u64) -> Self {
        Self {
            nodes_evaluated: 0,
            signatures_compared: 0,
            complete: true,
            budget,
        }
    }

    fn count_node(&mut self) {
        self.nodes_evaluated += 1;
    }

    fn within_budget(&mut self) -> bool {
        if self.nodes_evaluated as u64 > self.budget {
            self.complete = false;
            return false;
        }
        true
    }
}

/// One matched node: its region offset and record
type MatchedNode = (u32, Arc<Node>);

/// Runs the match pipeline against one dataset
pub(crate) struct Matcher<'d> {
    dataset: &'d Dataset,
    budget: u64,
}

impl<'d> Matcher<'d> {
    pub(crate) fn new(dataset: &'d Dataset, budget: Option<u64>) -> Self {
        Self {
            dataset,
            budget: budget.unwrap_or(u64::MAX),
        }
    }

    /// Match a User-Agent, never returning an empty-handed result
    pub(crate) fn match_user_agent(&self, user_agent: &str) -> Result<Match> {
        let started = Instant::now();
        self.dataset.check_open()?;
        let ua: Vec<u8> = user_agent
            .bytes()
            .map(|b| if b < 0x80 { b } else { b' ' })
            .collect();
        let mut state = MatchState::new(self.budget);

        if (ua.len() as u64) < self.dataset.min_user_agent_length() as u64 {
            return self.finalize_default(user_agent, &ua, state, started);
        }

        let matched = self.discover(&ua, &mut state)?;
        if matched.is_empty() {
            return self.finalize_default(user_agent, &ua, state, started);
        }
        let matched_offsets: Vec<u32> = matched.iter().map(|(offset, _)| *offset).collect();

        if let Some(signature) = self.exact_lookup(&matched_offsets, &mut state)? {
            return self.finalize_signature(
                user_agent,
                MatchMethod::Exact,
                0,
                signature,
                state,
                started,
            );
        }

        if self.dataset.version() == Version::V32 {
            if let Some((signature, delta)) = self.numeric_lookup(&ua, &mut state)? {
                return self.finalize_signature(
                    user_agent,
                    MatchMethod::Numeric,
                    delta,
                    signature,
                    state,
                    started,
                );
            }
        }

        // Candidates for the two fuzzy strategies: every signature sharing
        // at least one node with the matched set.
        let matched_set: BTreeSet<u32> = matched_offsets.iter().copied().collect();
        let mut candidates: BTreeSet<u32> = BTreeSet::new();
        for (_, node) in &matched {
            candidates.extend(node.signature_indices.iter().copied());
        }

        // Nearest: signatures whose nodes were all matched, scored by the
        // surplus matched nodes. Best (score, rank, index) wins.
        let mut nearest: Option<(u32, u32, u32, Arc<Signature>)> = None;
        let mut closest: Option<(u32, u32, u32, Arc<Signature>)> = None;
        for &index in &candidates {
            if !state.within_budget() {
                break;
            }
            let signature = self.dataset.signature(index)?;
            state.signatures_compared += 1;
            if signature
                .node_offsets
                .iter()
                .all(|offset| matched_set.contains(offset))
            {
                let score = (matched_offsets.len() - signature.node_offsets.len()) as u32;
                let key = (score, signature.rank, index);
                if nearest
                    .as_ref()
                    .is_none_or(|(s, r, i, _)| key < (*s, *r, *i))
                {
                    nearest = Some((score, signature.rank, index, signature));
                }
                continue;
            }
            let score = self.closest_score(&ua, &signature, &mut state)?;
            let key = (score, signature.rank, index);
            if closest
                .as_ref()
                .is_none_or(|(s, r, i, _)| key < (*s, *r, *i))
            {
                closest = Some((score, signature.rank, index, signature));
            }
        }

        if let Some((score, _, _, signature)) = nearest {
            return self.finalize_signature(
                user_agent,
                MatchMethod::Nearest,
                score,
                signature,
                state,
                started,
            );
        }
        if let Some((score, _, _, signature)) = closest {
            return self.finalize_signature(
                user_agent,
                MatchMethod::Closest,
                score,
                signature,
                state,
                started,
            );
        }
        self.finalize_default(user_agent, &ua, state, started)
    }

    /// Walk the node DAG, collecting complete nodes whose runs align with
    /// the UA. A dead end re-roots the walk; positions only move forward,
    /// so the walk terminates.
    fn discover(&self, ua: &[u8], state: &mut MatchState) -> Result<Vec<MatchedNode>> {
        let mut matched = Vec::new();
        let root = self.dataset.root_node()?;
        let mut current = Arc::clone(&root);
        let mut at_root = true;
        let mut position = 0usize;
        loop {
            if !state.within_budget() {
                break;
            }
            match self.step(&current, ua, position, state)? {
                Some((offset, node, next)) => {
                    if node.is_complete() {
                        matched.push((offset, Arc::clone(&node)));
                    }
                    current = node;
                    at_root = false;
                    position = next;
                }
                None if at_root => break,
                None => {
                    current = Arc::clone(&root);
                    at_root = true;
                }
            }
        }
        Ok(matched)
    }

    /// Match one child of `node` at the first possible position at or past
    /// `from`. Numeric children take a regular step when the UA's integer
    /// equals theirs exactly.
    fn step(
        &self,
        node: &Node,
        ua: &[u8],
        from: usize,
        state: &mut MatchState,
    ) -> Result<Option<(u32, Arc<Node>, usize)>> {
        for position in node.child_positions(from as u16) {
            let position = position as usize;
            if position >= ua.len() {
                break;
            }
            if let Some(child) = node.find_child(position as u16, ua[position]) {
                state.count_node();
                let child_node = self.dataset.node_at(child.node_offset)?;
                let run = &child_node.characters;
                if position + run.len() <= ua.len()
                    && ua[position..position + run.len()] == run[..]
                {
                    let next_position = position + run.len();
                    return Ok(Some((child.node_offset, child_node, next_position)));
                }
            }
        }
        for numeric in &node.numeric_children {
            state.count_node();
            let child_node = self.dataset.node_at(numeric.node_offset)?;
            let position = child_node.position as usize;
            if position < from || position >= ua.len() || !ua[position].is_ascii_digit() {
                continue;
            }
            let (value, digits) = parse_integer(&ua[position..]);
            if value == numeric.value as u32 {
                return Ok(Some((numeric.node_offset, child_node, position + digits)));
            }
        }
        Ok(None)
    }

    /// Binary search the signature list, ordered by node vectors
    fn exact_lookup(
        &self,
        target: &[u32],
        state: &mut MatchState,
    ) -> Result<Option<Arc<Signature>>> {
        let mut low = 0u32;
        let mut high = self.dataset.signature_count();
        while low < high {
            let mid = low + (high - low) / 2;
            let signature = self.dataset.signature(mid)?;
            state.signatures_compared += 1;
            match signature.compare_nodes(target) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Some(signature)),
            }
        }
        Ok(None)
    }

    /// Re-walk the DAG substituting numeric children where the UA's
    /// integer diverges; the first complete walk whose rebuilt vector is a
    /// known signature wins. Difference is the sum of integer deltas.
    fn numeric_lookup(
        &self,
        ua: &[u8],
        state: &mut MatchState,
    ) -> Result<Option<(Arc<Signature>, u32)>> {
        let root = self.dataset.root_node()?;
        let mut vector = Vec::new();
        self.numeric_step(&root, ua, 0, &mut vector, 0, state)
    }

    fn numeric_step(
        &self,
        current: &Arc<Node>,
        ua: &[u8],
        from: usize,
        vector: &mut Vec<u32>,
        delta: u32,
        state: &mut MatchState,
    ) -> Result<Option<(Arc<Signature>, u32)>> {
        if !state.within_budget() {
            return Ok(None);
        }

        // A regular step is always preferred and never branches.
        if let Some((offset, node, next)) = self.step(current, ua, from, state)? {
            let recorded = node.is_complete();
            if recorded {
                vector.push(offset);
            }
            let found = self.numeric_step(&node, ua, next, vector, delta, state)?;
            if found.is_none() && recorded {
                vector.pop();
            }
            return Ok(found);
        }

        // Dead end: branch over numeric children by distance from the
        // UA's integer at each child's position.
        let mut branches: Vec<(u32, u32, Arc<Node>, usize)> = Vec::new();
        for numeric in &current.numeric_children {
            state.count_node();
            let child = self.dataset.node_at(numeric.node_offset)?;
            let position = child.position as usize;
            if position < from || position >= ua.len() || !ua[position].is_ascii_digit() {
                continue;
            }
            let (value, digits) = parse_integer(&ua[position..]);
            if value == numeric.value as u32 {
                continue; // an exact value already took the regular step
            }
            let distance = (numeric.value as u32).abs_diff(value);
            branches.push((distance, numeric.node_offset, child, position + digits));
        }
        branches.sort_by_key(|(distance, offset, _, _)| (*distance, *offset));
        for (distance, offset, child, next) in branches {
            let recorded = child.is_complete();
            if recorded {
                vector.push(offset);
            }
            let found =
                self.numeric_step(&child, ua, next, vector, delta + distance, state)?;
            if found.is_some() {
                return Ok(found);
            }
            if recorded {
                vector.pop();
            }
        }

        // Walk over; a substituted vector that names a real signature wins.
        if delta > 0 && !vector.is_empty() {
            if let Some(signature) = self.exact_lookup(vector, state)? {
                return Ok(Some((signature, delta)));
            }
        }
        Ok(None)
    }

    /// Byte-level difference between the UA and a signature's runs at the
    /// runs' positions; missing bytes count one each
    fn closest_score(
        &self,
        ua: &[u8],
        signature: &Signature,
        state: &mut MatchState,
    ) -> Result<u32> {
        let mut score = 0u32;
        for &offset in &signature.node_offsets {
            state.count_node();
            let node = self.dataset.node_at(offset)?;
            let start = node.position as usize;
            for (index, &byte) in node.characters.iter().enumerate() {
                match ua.get(start + index) {
                    Some(&actual) if actual == byte => {}
                    _ => score += 1,
                }
            }
        }
        Ok(score)
    }

    fn finalize_signature(
        &self,
        user_agent: &str,
        method: MatchMethod,
        difference: u32,
        signature: Arc<Signature>,
        state: MatchState,
        started: Instant,
    ) -> Result<Match> {
        let profiles = signature.profiles(self.dataset)?;
        let device_id = signature.device_id(self.dataset)?;
        let rendered = signature.render(self.dataset)?;
        self.build_match(
            user_agent,
            method,
            difference,
            profiles,
            device_id,
            Some(signature.index),
            Some(signature.rank),
            Some(rendered),
            state,
            started,
        )
    }

    fn finalize_default(
        &self,
        user_agent: &str,
        ua: &[u8],
        state: MatchState,
        started: Instant,
    ) -> Result<Match> {
        let profiles = self.dataset.default_profiles()?;
        let device_id = join_device_id(&profiles);
        self.build_match(
            user_agent,
            MatchMethod::None,
            ua.len() as u32,
            profiles,
            device_id,
            None,
            None,
            None,
            state,
            started,
        )
    }

    /// Build a result for explicit profiles, e.g. a replayed DeviceId
    pub(crate) fn match_profiles(
        &self,
        label: &str,
        profiles: Vec<Arc<Profile>>,
    ) -> Result<Match> {
        let started = Instant::now();
        let device_id = join_device_id(&profiles);
        self.build_match(
            label,
            MatchMethod::None,
            0,
            profiles,
            device_id,
            None,
            None,
            None,
            MatchState::new(self.budget),
            started,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_match(
        &self,
        user_agent: &str,
        method: MatchMethod,
        difference: u32,
        profiles: Vec<Arc<Profile>>,
        device_id: String,
        signature_index: Option<u32>,
        signature_rank: Option<u32>,
        signature_string: Option<String>,
        state: MatchState,
        started: Instant,
    ) -> Result<Match> {
        let mut properties: Vec<(String, Vec<String>)> = Vec::new();
        for property in self.dataset.properties() {
            let profile = profiles
                .iter()
                .find(|profile| profile.component_id == property.component_id);
            let mut values = Vec::new();
            if let Some(profile) = profile {
                for value in profile.values_for_property(self.dataset, property)? {
                    values.push(value.name(self.dataset)?.as_ref().clone());
                }
            }
            if values.is_empty() {
                if let Some(default) = property.default_value(self.dataset)? {
                    values.push(default.name(self.dataset)?.as_ref().clone());
                }
            }
            if !values.is_empty() {
                properties.push((property.name.clone(), values));
            }
        }
        properties.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Match {
            method,
            difference,
            lowest_score: difference,
            nodes_evaluated: state.nodes_evaluated,
            signatures_compared: state.signatures_compared,
            is_complete: state.complete,
            elapsed: started.elapsed(),
            user_agent: user_agent.to_string(),
            device_id,
            signature_index,
            signature_rank,
            signature_string,
            properties,
        })
    }
}

/// Parse the leading ASCII digit run; the value saturates past nine digits
fn parse_integer(bytes: &[u8]) -> (u32, usize) {
    let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    let parsed = std::str::from_utf8(&bytes[..digits.min(9)])
        .expect("digits are ASCII")
        .parse::<u32>()
        .unwrap_or(0);
    let value = if digits > 9 { u32::MAX } else { parsed };
    (value, digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integer_reads_leading_digits() {
        assert_eq!(parse_integer(b"123_456"), (123, 3));
        assert_eq!(parse_integer(b"9)"), (9, 1));
        assert_eq!(parse_integer(b"0"), (0, 1));
    }

    #[test]
    fn parse_integer_saturates_long_runs() {
        let (value, digits) = parse_integer(b"12345678901234");
        assert_eq!(value, u32::MAX);
        assert_eq!(digits, 14);
    }

    #[test]
    fn method_names_are_stable() {
        assert_eq!(MatchMethod::Exact.name(), "Exact");
        assert_eq!(MatchMethod::None.name(), "None");
    }
}
