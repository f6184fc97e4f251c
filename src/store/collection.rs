//! One entity set's rows for one tenant, with type-aware key matching.

use crate::error::AppError;
use crate::store::{KeyMap, Record};
use serde_json::Value;

/// Ordered rows of one entity set. Key tuples are unique.
#[derive(Clone, Debug, Default)]
pub struct EntityCollection {
    keys: Vec<String>,
    rows: Vec<Record>,
}

impl EntityCollection {
    pub fn new(keys: Vec<String>, rows: Vec<Record>) -> Self {
        EntityCollection { keys, rows }
    }

    /// Live rows, for callers that chain further work without cloning.
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn all_rows(&self) -> Vec<Record> {
        self.rows.clone()
    }

    /// Rows matching every given key (partial match; empty predicate matches all).
    pub fn fetch(&self, keys: &KeyMap) -> Vec<Record> {
        self.rows.iter().filter(|r| row_matches(r, keys)).cloned().collect()
    }

    pub fn exists(&self, keys: &KeyMap) -> bool {
        self.rows.iter().any(|r| row_matches(r, keys))
    }

    /// Append a row. Fails when a row with the same key tuple is already present.
    pub fn add(&mut self, row: Record) -> Result<(), AppError> {
        let key_tuple = key_tuple(&self.keys, &row);
        if !key_tuple.is_empty() && self.rows.iter().any(|r| row_matches_all(r, &key_tuple)) {
            return Err(AppError::Conflict(format!("entity with keys {} already exists", format_keys(&key_tuple))));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Merge `patch` into the first matching row. Returns the updated row.
    pub fn update(&mut self, keys: &KeyMap, patch: &Record) -> Option<Record> {
        let row = self.rows.iter_mut().find(|r| row_matches(r, keys))?;
        for (k, v) in patch {
            row.insert(k.clone(), v.clone());
        }
        Some(row.clone())
    }

    /// Replace the first matching row in place.
    pub fn replace(&mut self, keys: &KeyMap, row: Record) -> bool {
        match self.rows.iter_mut().find(|r| row_matches(r, keys)) {
            Some(existing) => {
                *existing = row;
                true
            }
            None => false,
        }
    }

    /// Remove every matching row. Returns how many were removed.
    pub fn remove(&mut self, keys: &KeyMap) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| !row_matches(r, keys));
        before - self.rows.len()
    }

    /// Monotonic integer for numeric keys: one above the current maximum.
    pub fn next_integer(&self, property: &str) -> i64 {
        self.rows
            .iter()
            .filter_map(|r| r.get(property))
            .filter_map(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Key tuple of a row for the given key names; missing keys are skipped.
pub fn key_tuple(keys: &[String], row: &Record) -> KeyMap {
    keys.iter()
        .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

pub fn row_matches(row: &Record, keys: &KeyMap) -> bool {
    keys.iter().all(|(k, expected)| match row.get(k) {
        Some(actual) => loose_eq(actual, expected),
        None => expected.is_null(),
    })
}

fn row_matches_all(row: &Record, keys: &KeyMap) -> bool {
    keys.iter().all(|(k, v)| row.get(k).map(|actual| loose_eq(actual, v)).unwrap_or(false))
}

/// Compare a stored value with a key literal: numeric strings as numbers, boolean strings as booleans,
/// quoted and `guid'...'` literals unwrapped.
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            unwrap_literal(s).parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            unwrap_literal(s).eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        (Value::String(a), Value::String(b)) => {
            let (a, b) = (unwrap_literal(a), unwrap_literal(b));
            a == b || (looks_like_guid(&a) && a.eq_ignore_ascii_case(&b))
        }
        (Value::Null, Value::String(s)) | (Value::String(s), Value::Null) => s == "null",
        _ => actual == expected,
    }
}

/// Strip `'...'` quoting (with `''` escapes) and `guid'...'` style prefixes from a literal.
pub fn unwrap_literal(s: &str) -> String {
    let s = s.trim();
    if let Some(start) = s.find('\'') {
        let prefix = &s[..start];
        if s.ends_with('\'') && s.len() > start + 1 && prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return s[start + 1..s.len() - 1].replace("''", "'");
        }
    }
    s.to_string()
}

pub fn looks_like_guid(s: &str) -> bool {
    s.len() == 36 && uuid::Uuid::parse_str(s).is_ok()
}

pub fn format_keys(keys: &KeyMap) -> String {
    keys.iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}='{}'", k, s),
            other => format!("{}={}", k, other),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn keys(v: Value) -> KeyMap {
        v.as_object().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    #[test]
    fn key_literals_coerce_to_stored_types() {
        assert!(loose_eq(&json!(42), &json!("42")));
        assert!(loose_eq(&json!(true), &json!("true")));
        assert!(loose_eq(&json!("FR"), &json!("'FR'")));
        assert!(loose_eq(
            &json!("0d1f2c3e-0000-4000-8000-000000000001"),
            &json!("guid'0D1F2C3E-0000-4000-8000-000000000001'")
        ));
        assert!(!loose_eq(&json!(false), &json!("true")));
    }

    #[test]
    fn add_rejects_duplicate_key_tuple() {
        let mut c = EntityCollection::new(vec!["ID".into()], vec![row(json!({"ID": 1}))]);
        assert!(c.add(row(json!({"ID": 1, "Name": "x"}))).is_err());
        assert!(c.add(row(json!({"ID": 2}))).is_ok());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn partial_keys_fetch_all_siblings() {
        let c = EntityCollection::new(
            vec!["ID".into(), "IsActiveEntity".into()],
            vec![
                row(json!({"ID": 1, "IsActiveEntity": true})),
                row(json!({"ID": 1, "IsActiveEntity": false})),
                row(json!({"ID": 2, "IsActiveEntity": true})),
            ],
        );
        assert_eq!(c.fetch(&keys(json!({"ID": "1"}))).len(), 2);
        assert_eq!(c.fetch(&keys(json!({"ID": "1", "IsActiveEntity": "false"}))).len(), 1);
        assert_eq!(c.fetch(&KeyMap::new()).len(), 3);
    }

    #[test]
    fn update_merges_and_remove_counts() {
        let mut c = EntityCollection::new(vec!["ID".into()], vec![row(json!({"ID": 1, "Name": "a"}))]);
        let updated = c.update(&keys(json!({"ID": 1})), &row(json!({"Name": "b"}))).unwrap();
        assert_eq!(updated["Name"], json!("b"));
        assert_eq!(c.next_integer("ID"), 2);
        assert_eq!(c.remove(&keys(json!({"ID": 1}))), 1);
        assert!(c.is_empty());
    }
}
