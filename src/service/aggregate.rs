//! Grouping and aggregation for `$apply`.

use crate::query::{AggregateExpr, AggregateMethod};
use crate::service::evaluator::{compare_values, parse_number, value_at};
use crate::store::Record;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Callback for custom aggregates: `None` falls back to a sum.
pub type CustomAggregate<'a> = &'a dyn Fn(&str, &[Record]) -> Option<Value>;

/// Rows grouped by the values at `properties`, in first-appearance order. Each group's record carries
/// the grouping values (nested for slash paths).
pub fn group_rows(rows: Vec<Record>, properties: &[String]) -> Vec<(Record, Vec<Record>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Record, Vec<Record>)> = HashMap::new();
    for row in rows {
        let values: Vec<Value> = properties
            .iter()
            .map(|p| value_at(&row, p).map(|v| v.into_owned()).unwrap_or(Value::Null))
            .collect();
        let key = Value::Array(values.clone()).to_string();
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            let mut head = Record::new();
            for (path, value) in properties.iter().zip(values) {
                set_path(&mut head, path, value);
            }
            (head, Vec::new())
        });
        entry.1.push(row);
    }
    order.into_iter().filter_map(|k| groups.remove(&k)).collect()
}

/// Write `value` at a slash path, creating intermediate objects.
pub fn set_path(row: &mut Record, path: &str, value: Value) {
    match path.split_once('/') {
        None => {
            row.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = row.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(obj) = child {
                set_path(obj, rest, value);
            }
        }
    }
}

/// Reduce `rows` into one record holding every aggregate under its alias.
pub fn aggregate(rows: &[Record], expressions: &[AggregateExpr], custom: CustomAggregate) -> Record {
    let mut out = Record::new();
    for expr in expressions {
        let value = match expr.method {
            Some(method) => reduce(method, rows, &expr.property),
            None => custom(&expr.property, rows).unwrap_or_else(|| reduce(AggregateMethod::Sum, rows, &expr.property)),
        };
        out.insert(expr.alias.clone(), value);
    }
    out
}

fn reduce(method: AggregateMethod, rows: &[Record], property: &str) -> Value {
    let values: Vec<Value> = rows
        .iter()
        .filter_map(|r| value_at(r, property).map(|v| v.into_owned()))
        .filter(|v| !v.is_null())
        .collect();
    let numbers = || values.iter().filter_map(as_number);
    match method {
        AggregateMethod::Count => Value::from(rows.len()),
        AggregateMethod::Sum => number_value(numbers().sum()),
        AggregateMethod::Average => {
            let n: Vec<f64> = numbers().collect();
            if n.is_empty() {
                Value::Null
            } else {
                number_value(n.iter().sum::<f64>() / n.len() as f64)
            }
        }
        AggregateMethod::Max => values
            .iter()
            .max_by(|a, b| compare_values(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateMethod::Min => values
            .iter()
            .min_by(|a, b| compare_values(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        AggregateMethod::CountDistinct => {
            let distinct: HashSet<String> = values.iter().map(|v| v.to_string()).collect();
            Value::from(distinct.len())
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Integral results stay integers in JSON.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Record> {
        [("A", 10, "x"), ("B", 5, "y"), ("A", 7, "y"), ("C", 1, "x"), ("B", 2, "x")]
            .iter()
            .map(|(customer, score, kind)| {
                json!({ "Customer": customer, "CreditScore": score, "Kind": kind })
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn expr(property: &str, method: Option<AggregateMethod>, alias: &str) -> AggregateExpr {
        AggregateExpr {
            property: property.into(),
            method,
            alias: alias.into(),
        }
    }

    #[test]
    fn groups_keep_first_appearance_order() {
        let groups = group_rows(rows(), &["Customer".to_string()]);
        let names: Vec<&str> = groups.iter().map(|(h, _)| h["Customer"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn default_method_is_sum() {
        let no_custom = |_: &str, _: &[Record]| None;
        let out = aggregate(&rows()[..3], &[expr("CreditScore", None, "CreditScore")], &no_custom);
        assert_eq!(out["CreditScore"], json!(22));
    }

    #[test]
    fn explicit_methods() {
        let no_custom = |_: &str, _: &[Record]| None;
        let out = aggregate(
            &rows(),
            &[
                expr("CreditScore", Some(AggregateMethod::Max), "Max"),
                expr("CreditScore", Some(AggregateMethod::Min), "Min"),
                expr("CreditScore", Some(AggregateMethod::Average), "Avg"),
                expr("Customer", Some(AggregateMethod::CountDistinct), "Customers"),
                expr("$count", Some(AggregateMethod::Count), "N"),
            ],
            &no_custom,
        );
        assert_eq!(out["Max"], json!(10));
        assert_eq!(out["Min"], json!(1));
        assert_eq!(out["Avg"], json!(5));
        assert_eq!(out["Customers"], json!(3));
        assert_eq!(out["N"], json!(5));
    }

    #[test]
    fn custom_aggregate_callback_wins() {
        let custom = |name: &str, rows: &[Record]| (name == "CreditScore").then(|| json!(rows.len() * 100));
        let out = aggregate(&rows(), &[expr("CreditScore", None, "CreditScore")], &custom);
        assert_eq!(out["CreditScore"], json!(500));
    }
}
