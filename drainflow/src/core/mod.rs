//! Core value types shared by every layer of the runtime.
//!
//! This module contains:
//! - `Token`, the identity of an edge between two units
//! - `MemberId`, the identity of a worker inside a unit
//! - `DrainData`, the snapshot a drain leaves behind

mod drain_data;
mod token;

pub use drain_data::{DrainData, DrainDataBuilder, DrainDataStats};
pub use token::{MemberId, Token};

/// An opaque data item travelling along an edge.
pub type Item = serde_json::Value;

/// Captured field values of one stateful member, keyed by field name.
pub type FieldMap = std::collections::BTreeMap<String, serde_json::Value>;
