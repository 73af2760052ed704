//! Snapshots of the data and state a drain leaves behind.

use super::{FieldMap, Item, MemberId, Token};
use crate::errors::MergeConflictError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An immutable snapshot of everything a drain left behind.
///
/// `data` maps each edge token to the items still sitting on that edge, in
/// stream order. `state` holds the captured fields of stateful members.
///
/// Merging is not idempotent: merging the same snapshot twice duplicates its
/// items, so every partial snapshot must be merged exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainData {
    #[serde(with = "token_entries")]
    data: BTreeMap<Token, Vec<Item>>,
    #[serde(default)]
    state: BTreeMap<MemberId, FieldMap>,
}

impl DrainData {
    /// Creates a snapshot from its parts.
    #[must_use]
    pub fn new(data: BTreeMap<Token, Vec<Item>>, state: BTreeMap<MemberId, FieldMap>) -> Self {
        Self { data, state }
    }

    /// Creates an empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns all edge data.
    #[must_use]
    pub fn data(&self) -> &BTreeMap<Token, Vec<Item>> {
        &self.data
    }

    /// Returns the items left on one edge, if the edge was reported.
    #[must_use]
    pub fn get_data(&self, token: Token) -> Option<&[Item]> {
        self.data.get(&token).map(Vec::as_slice)
    }

    /// Returns the full state table.
    #[must_use]
    pub fn state(&self) -> &BTreeMap<MemberId, FieldMap> {
        &self.state
    }

    /// Returns the captured fields of one member.
    #[must_use]
    pub fn member_state(&self, member: MemberId) -> Option<&FieldMap> {
        self.state.get(&member)
    }

    /// Returns one captured field value.
    #[must_use]
    pub fn get_state(&self, member: MemberId, field: &str) -> Option<&serde_json::Value> {
        self.state.get(&member).and_then(|fields| fields.get(field))
    }

    /// Total number of items across all edges.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    /// Returns true if no items and no state are recorded.
    ///
    /// Edges reported with an empty sequence do not count as content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0 && self.state.values().all(BTreeMap::is_empty)
    }

    /// Combines two snapshots.
    ///
    /// Item sequences for a shared token are concatenated, `self` first.
    /// State rows are unioned; capturing the same field of the same member
    /// twice is an error.
    pub fn merge(&self, other: &Self) -> Result<Self, MergeConflictError> {
        let mut merged = self.clone();
        for (token, items) in &other.data {
            merged
                .data
                .entry(*token)
                .or_default()
                .extend(items.iter().cloned());
        }
        for (member, fields) in &other.state {
            let row = merged.state.entry(*member).or_default();
            for (field, value) in fields {
                if row.contains_key(field) {
                    return Err(MergeConflictError::new(*member, field.clone()));
                }
                row.insert(field.clone(), value.clone());
            }
        }
        Ok(merged)
    }

    /// Returns the part of this snapshot concerning the given tokens and
    /// members.
    #[must_use]
    pub fn subset<'a>(
        &self,
        tokens: impl IntoIterator<Item = &'a Token>,
        members: impl IntoIterator<Item = &'a MemberId>,
    ) -> Self {
        let tokens: BTreeSet<&Token> = tokens.into_iter().collect();
        let members: BTreeSet<&MemberId> = members.into_iter().collect();
        Self {
            data: self
                .data
                .iter()
                .filter(|(t, _)| tokens.contains(t))
                .map(|(t, items)| (*t, items.clone()))
                .collect(),
            state: self
                .state
                .iter()
                .filter(|(m, _)| members.contains(m))
                .map(|(m, fields)| (*m, fields.clone()))
                .collect(),
        }
    }

    /// Splits the snapshot into its parts.
    #[must_use]
    pub fn into_parts(self) -> (BTreeMap<Token, Vec<Item>>, BTreeMap<MemberId, FieldMap>) {
        (self.data, self.state)
    }

    /// Summarizes the snapshot's sizes.
    #[must_use]
    pub fn stats(&self) -> DrainDataStats {
        DrainDataStats {
            items_per_token: self.data.iter().map(|(t, v)| (*t, v.len())).collect(),
            total_items: self.item_count(),
            stateful_members: self.state.len(),
            state_fields: self.state.values().map(BTreeMap::len).sum(),
        }
    }
}

/// Size summary of a `DrainData`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainDataStats {
    /// Number of items per reported edge.
    pub items_per_token: BTreeMap<Token, usize>,
    /// Total item count.
    pub total_items: usize,
    /// Number of members with captured state.
    pub stateful_members: usize,
    /// Number of captured fields.
    pub state_fields: usize,
}

/// Incremental builder used by units while extracting their residue.
#[derive(Debug, Default)]
pub struct DrainDataBuilder {
    data: BTreeMap<Token, Vec<Item>>,
    state: BTreeMap<MemberId, FieldMap>,
}

impl DrainDataBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an edge as reported, even if nothing is left on it.
    pub fn touch(&mut self, token: Token) -> &mut Self {
        self.data.entry(token).or_default();
        self
    }

    /// Appends items to an edge.
    pub fn extend_items(&mut self, token: Token, items: impl IntoIterator<Item = Item>) -> &mut Self {
        self.data.entry(token).or_default().extend(items);
        self
    }

    /// Adds the captured state of one member.
    pub fn put_state(&mut self, member: MemberId, fields: FieldMap) -> Result<&mut Self, MergeConflictError> {
        let row = self.state.entry(member).or_default();
        for (field, value) in fields {
            if row.contains_key(&field) {
                return Err(MergeConflictError::new(member, field));
            }
            row.insert(field, value);
        }
        Ok(self)
    }

    /// Builds the snapshot.
    #[must_use]
    pub fn build(self) -> DrainData {
        DrainData::new(self.data, self.state)
    }
}

/// JSON object keys must be strings, so the token map travels as a list of
/// `{ "token": .., "items": [..] }` entries.
mod token_entries {
    use super::{Item, Token};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct EntryRef<'a> {
        token: Token,
        items: &'a [Item],
    }

    #[derive(Deserialize)]
    struct Entry {
        token: Token,
        items: Vec<Item>,
    }

    pub fn serialize<S: Serializer>(map: &BTreeMap<Token, Vec<Item>>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter().map(|(token, items)| EntryRef {
            token: *token,
            items,
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<Token, Vec<Item>>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in entries {
            map.entry(entry.token)
                .or_insert_with(Vec::new)
                .extend(entry.items);
        }
        Ok(map)
    }
}
