//! Metadata filter types for search queries.
//!
//! Defines the filter clause structure used by the engine for pre-filtering
//! during vector search, post-filtering keyword results, and `delete_where`.

use serde::{Deserialize, Serialize};

/// Metadata filter clause with `must` (AND) and `must_not` (AND-NOT) conditions.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilterClause {
    #[serde(default)]
    pub must: Vec<FilterCondition>,
    #[serde(default)]
    pub must_not: Vec<FilterCondition>,
}

impl FilterClause {
    /// A clause with a single `must` condition.
    pub fn must(condition: FilterCondition) -> Self {
        Self {
            must: vec![condition],
            must_not: Vec::new(),
        }
    }

    /// Adds a `must` condition.
    pub fn and(mut self, condition: FilterCondition) -> Self {
        self.must.push(condition);
        self
    }

    /// Adds a `must_not` condition.
    pub fn and_not(mut self, condition: FilterCondition) -> Self {
        self.must_not.push(condition);
        self
    }

    /// Returns `true` when the clause has no conditions and matches everything.
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }
}

/// A single filter condition on a metadata field.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilterCondition {
    pub field: String,
    pub op: FilterOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,
}

impl FilterCondition {
    /// Condition comparing `field` against a single value.
    pub fn new(
        field: impl Into<String>,
        op: FilterOperator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            op,
            value: Some(value.into()),
            values: None,
        }
    }

    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// `field ∈ values`.
    pub fn one_of(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOperator::In,
            value: None,
            values: Some(values),
        }
    }
}

/// Comparison operator for filter conditions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
}
