//! Metadata filtering engine.
//!
//! Evaluates [`FilterClause`] predicates against document metadata.
//! `must` conditions are AND-ed, `must_not` conditions are AND-NOT-ed.
//! Operators: `eq`, `ne`, `gt`, `lt`, `gte`, `lte`, `in`.

use crate::document::{Metadata, MetadataValue};
use crate::filter_types::{FilterClause, FilterCondition, FilterOperator};
use std::cmp::Ordering;

/// Check if a document's metadata matches the given filter clause.
pub fn matches_filter(metadata: &Metadata, filter: &FilterClause) -> bool {
    filter.must.iter().all(|cond| evaluate_condition(metadata, cond))
        && !filter
            .must_not
            .iter()
            .any(|cond| evaluate_condition(metadata, cond))
}

fn evaluate_condition(metadata: &Metadata, cond: &FilterCondition) -> bool {
    // A missing field never satisfies a condition, including `ne`.
    let Some(field_value) = metadata.get(&cond.field) else {
        return false;
    };

    if cond.op == FilterOperator::In {
        return cond
            .values
            .as_ref()
            .is_some_and(|vals| vals.iter().any(|v| json_eq(field_value, v)));
    }

    let Some(val) = cond.value.as_ref() else {
        return false;
    };
    match cond.op {
        FilterOperator::Eq => json_eq(field_value, val),
        FilterOperator::Ne => !json_eq(field_value, val),
        FilterOperator::Gt => json_cmp(field_value, val) == Some(Ordering::Greater),
        FilterOperator::Lt => json_cmp(field_value, val) == Some(Ordering::Less),
        FilterOperator::Gte => json_cmp(field_value, val).is_some_and(|o| o != Ordering::Less),
        FilterOperator::Lte => json_cmp(field_value, val).is_some_and(|o| o != Ordering::Greater),
        // A single `value` is accepted as a one-element set.
        FilterOperator::In => json_eq(field_value, val),
    }
}

/// Compare a MetadataValue with a serde_json::Value for equality.
fn json_eq(meta: &MetadataValue, json: &serde_json::Value) -> bool {
    match (meta, json) {
        (MetadataValue::Null, serde_json::Value::Null) => true,
        (MetadataValue::String(s), serde_json::Value::String(js)) => s == js,
        (MetadataValue::Boolean(b), serde_json::Value::Bool(jb)) => b == jb,
        (MetadataValue::Integer(i), serde_json::Value::Number(n)) => {
            n.as_i64().is_some_and(|ni| *i == ni)
                || n.as_f64()
                    .is_some_and(|nf| (*i as f64 - nf).abs() < f64::EPSILON)
        }
        (MetadataValue::Float(f), serde_json::Value::Number(n)) => {
            n.as_f64().is_some_and(|nf| (*f - nf).abs() < f64::EPSILON)
        }
        (MetadataValue::List(items), serde_json::Value::Array(js)) => {
            items.len() == js.len() && items.iter().zip(js).all(|(m, j)| json_eq(m, j))
        }
        _ => false,
    }
}

/// Numeric ordering between metadata and a JSON value; strings compare lexically.
fn json_cmp(meta: &MetadataValue, json: &serde_json::Value) -> Option<Ordering> {
    if let (MetadataValue::String(s), serde_json::Value::String(js)) = (meta, json) {
        return Some(s.as_str().cmp(js.as_str()));
    }
    meta.as_f64()?.partial_cmp(&json.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: Vec<(&str, MetadataValue)>) -> Metadata {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn clause(cond: FilterCondition) -> FilterClause {
        FilterClause::must(cond)
    }

    #[test]
    fn test_eq_string() {
        let m = meta(vec![("color", "red".into())]);
        assert!(matches_filter(&m, &clause(FilterCondition::eq("color", "red"))));
        assert!(!matches_filter(&m, &clause(FilterCondition::eq("color", "blue"))));
    }

    #[test]
    fn test_ne_requires_field() {
        let m = meta(vec![("status", "active".into())]);
        let ne = FilterCondition::new("status", FilterOperator::Ne, "deleted");
        assert!(matches_filter(&m, &clause(ne)));
        let missing = FilterCondition::new("other", FilterOperator::Ne, "deleted");
        assert!(!matches_filter(&m, &clause(missing)));
    }

    #[test]
    fn test_numeric_ordering() {
        let m = meta(vec![("age", MetadataValue::Integer(25)), ("score", MetadataValue::Float(0.5))]);
        assert!(matches_filter(&m, &clause(FilterCondition::new("age", FilterOperator::Gt, 18))));
        assert!(matches_filter(&m, &clause(FilterCondition::new("age", FilterOperator::Gte, 25))));
        assert!(matches_filter(&m, &clause(FilterCondition::new("age", FilterOperator::Lte, 25))));
        assert!(!matches_filter(&m, &clause(FilterCondition::new("age", FilterOperator::Lt, 25))));
        assert!(matches_filter(&m, &clause(FilterCondition::new("score", FilterOperator::Lt, 0.9))));
    }

    #[test]
    fn test_string_ordering() {
        let m = meta(vec![("name", "beta".into())]);
        assert!(matches_filter(&m, &clause(FilterCondition::new("name", FilterOperator::Gt, "alpha"))));
        assert!(!matches_filter(&m, &clause(FilterCondition::new("name", FilterOperator::Gt, 10))));
    }

    #[test]
    fn test_in_operator() {
        let m = meta(vec![("lang", "it".into())]);
        let hit = FilterCondition::one_of("lang", vec![json!("en"), json!("it")]);
        let miss = FilterCondition::one_of("lang", vec![json!("de")]);
        assert!(matches_filter(&m, &clause(hit)));
        assert!(!matches_filter(&m, &clause(miss)));
    }

    #[test]
    fn test_must_not() {
        let m = meta(vec![("status", "deleted".into()), ("size", MetadataValue::Integer(5))]);
        let filter = FilterClause::default().and_not(FilterCondition::eq("status", "deleted"));
        assert!(!matches_filter(&m, &filter));

        let filter = FilterClause::must(FilterCondition::new("size", FilterOperator::Lt, 10))
            .and_not(FilterCondition::eq("status", "active"));
        assert!(matches_filter(&m, &filter));
    }

    #[test]
    fn test_missing_value_never_matches() {
        let m = meta(vec![("x", MetadataValue::Integer(1))]);
        for op in [
            FilterOperator::Eq,
            FilterOperator::Ne,
            FilterOperator::Gt,
            FilterOperator::Lt,
            FilterOperator::Gte,
            FilterOperator::Lte,
            FilterOperator::In,
        ] {
            let cond = FilterCondition {
                field: "x".into(),
                op,
                value: None,
                values: None,
            };
            assert!(!matches_filter(&m, &clause(cond)), "{op:?} without value");
        }
    }

    #[test]
    fn test_type_mismatch_is_not_equal() {
        let m = meta(vec![
            ("n", MetadataValue::Integer(42)),
            ("b", MetadataValue::Boolean(true)),
        ]);
        assert!(!matches_filter(&m, &clause(FilterCondition::eq("n", "42"))));
        assert!(!matches_filter(&m, &clause(FilterCondition::eq("b", "true"))));
        assert!(matches_filter(&m, &clause(FilterCondition::eq("n", 42.0))));
    }

    #[test]
    fn test_null_and_list_equality() {
        let m = meta(vec![
            ("gone", MetadataValue::Null),
            ("tags", MetadataValue::List(vec!["a".into(), "b".into()])),
        ]);
        assert!(matches_filter(&m, &clause(FilterCondition::eq("gone", serde_json::Value::Null))));
        assert!(matches_filter(&m, &clause(FilterCondition::eq("tags", json!(["a", "b"])))));
        assert!(!matches_filter(&m, &clause(FilterCondition::eq("tags", json!(["b", "a"])))));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(matches_filter(&Metadata::new(), &FilterClause::default()));
    }
}
