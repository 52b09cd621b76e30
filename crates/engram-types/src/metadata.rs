//! Typed metadata values.
//!
//! Query results and stored records carry a typed map of scalars instead of
//! free-form JSON; `Opaque` is the escape hatch for payloads the substrate
//! does not interpret.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key→value metadata attached to records, nodes, and hits.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Uninterpreted bytes.
    Opaque(Vec<u8>),
}

impl MetadataValue {
    /// Approximate heap footprint in bytes, used for cache budgets.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::Text(text) => text.len(),
            Self::Opaque(bytes) => bytes.len(),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
