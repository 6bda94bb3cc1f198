//! Core document types for vecstore.
//!
//! A [`Document`] is the unit callers hand to the engine: a caller-chosen string
//! id, its embedding, optional text for keyword search, and arbitrary key-value
//! metadata. [`MetadataValue`] supports the scalar types used by filters plus
//! null and nested lists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed metadata value attached to a document.
///
/// Used for metadata filtering in search queries (e.g., `eq`, `gt`, `in` operators).
/// Uses the default externally-tagged serde representation for bincode compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Explicit null.
    Null,
    /// Boolean value (`true` / `false`).
    Boolean(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<MetadataValue>),
}

impl MetadataValue {
    /// Numeric view used by ordering operators.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Converts a JSON value into metadata. Objects are not representable and yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        Some(match value {
            serde_json::Value::Null => MetadataValue::Null,
            serde_json::Value::Bool(b) => MetadataValue::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => MetadataValue::Integer(i),
                None => MetadataValue::Float(n.as_f64()?),
            },
            serde_json::Value::String(s) => MetadataValue::String(s.clone()),
            serde_json::Value::Array(items) => MetadataValue::List(
                items
                    .iter()
                    .map(MetadataValue::from_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
            serde_json::Value::Object(_) => return None,
        })
    }

    /// Converts metadata into plain (untagged) JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Null => serde_json::Value::Null,
            MetadataValue::Boolean(b) => serde_json::Value::Bool(*b),
            MetadataValue::Integer(i) => serde_json::Value::from(*i),
            MetadataValue::Float(f) => serde_json::Value::from(*f),
            MetadataValue::String(s) => serde_json::Value::String(s.clone()),
            MetadataValue::List(items) => {
                serde_json::Value::Array(items.iter().map(MetadataValue::to_json).collect())
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Boolean(value)
    }
}

/// Document metadata. Ordered so that serialized documents are byte-stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A document as supplied by callers: id, embedding, metadata and optional text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-chosen identifier, unique within a collection.
    pub id: String,
    /// Embedding; its length must equal the collection's dimensions.
    pub vector: Vec<f32>,
    /// Arbitrary key-value metadata for filtering.
    #[serde(default)]
    pub metadata: Metadata,
    /// Text content, indexed by BM25 when present.
    #[serde(default)]
    pub text: Option<String>,
}

impl Document {
    /// Creates a document with empty metadata and no text.
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: Metadata::new(),
            text: None,
        }
    }

    /// Attaches text for keyword search.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
