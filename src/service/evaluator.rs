//! Filter/Search evaluator: pure predicates over one record, coercing literals by declared property type.

use crate::config::{EdmType, EntityType, ServiceSchema};
use crate::query::{CompareOp, FilterExpr, Lambda, LambdaKind, Literal, Operand};
use crate::store::{unwrap_literal, Record};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde_json::Value;
use std::cmp::Ordering;

/// Type information for resolving identifiers against a record.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub schema: &'a ServiceSchema,
    /// `None` inside a lambda over a primitive collection.
    pub entity_type: Option<&'a EntityType>,
    /// Element type of the primitive collection a lambda iterates.
    pub item_type: Option<EdmType>,
}

impl<'a> EvalContext<'a> {
    pub fn new(schema: &'a ServiceSchema, entity_type: &'a EntityType) -> Self {
        EvalContext {
            schema,
            entity_type: Some(entity_type),
            item_type: None,
        }
    }

    fn property_type(&self, path: &str) -> Option<EdmType> {
        if path.is_empty() {
            return self.item_type;
        }
        let entity_type = self.entity_type?;
        self.schema.property_at(entity_type, path).map(|p| p.edm_type)
    }
}

/// Comparable form of an operand.
#[derive(Clone, Debug, PartialEq)]
enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    /// Milliseconds since the epoch (or since midnight for times of day).
    Time(i64),
    Text(String),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => format_number(*n),
            Scalar::Time(t) => t.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => parse_number(s),
            Scalar::Time(t) => Some(*t as f64),
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Numeric literal, tolerating the `M`, `m`, `d`, `f` and `L` type suffixes.
pub fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_suffix(['M', 'm', 'd', 'D', 'f', 'F', 'L', 'l']).unwrap_or(trimmed);
    trimmed.parse().ok()
}

/// Milliseconds for `/Date(ms)/`, RFC 3339, naive date-times and plain dates; times of day give
/// milliseconds since midnight.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let s = unwrap_literal(s);
    let s = s.trim();
    if let Some(inner) = s.strip_prefix("/Date(").and_then(|r| r.strip_suffix(")/")) {
        let digits: String = inner
            .chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
            .map(|(_, c)| c)
            .collect();
        return digits.parse().ok();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }
    if let Some(t) = parse_time_of_day(s) {
        return Some(t.num_seconds_from_midnight() as i64 * 1000 + (t.nanosecond() / 1_000_000) as i64);
    }
    None
}

fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    if let Ok(t) = NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
        return Some(t);
    }
    // V2 Edm.Time duration form: PT12H30M00S
    let rest = s.strip_prefix("PT")?;
    let (h, rest) = rest.split_once('H')?;
    let (m, rest) = rest.split_once('M')?;
    let sec = rest.strip_suffix('S')?;
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, sec.parse::<f64>().ok()? as u32)
}

fn value_to_scalar(value: &Value, hint: Option<EdmType>) -> Scalar {
    match value {
        Value::Null => Scalar::Null,
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Number(n) => Scalar::Number(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => text_to_scalar(s, hint),
        other => Scalar::Text(other.to_string()),
    }
}

fn text_to_scalar(s: &str, hint: Option<EdmType>) -> Scalar {
    match hint {
        Some(t) if t.is_numeric() => parse_number(s).map(Scalar::Number).unwrap_or_else(|| Scalar::Text(s.to_string())),
        Some(EdmType::Boolean) => match s.to_ascii_lowercase().as_str() {
            "true" => Scalar::Bool(true),
            "false" => Scalar::Bool(false),
            _ => Scalar::Text(s.to_string()),
        },
        Some(t) if t.is_temporal() || t == EdmType::TimeOfDay => {
            parse_timestamp(s).map(Scalar::Time).unwrap_or_else(|| Scalar::Text(s.to_string()))
        }
        Some(EdmType::Guid) => Scalar::Text(s.to_ascii_lowercase()),
        _ => Scalar::Text(s.to_string()),
    }
}

fn literal_to_scalar(literal: &Literal, hint: Option<EdmType>) -> Scalar {
    match literal {
        Literal::Null => Scalar::Null,
        Literal::Bool(b) => Scalar::Bool(*b),
        Literal::String(s) => text_to_scalar(s, hint),
        Literal::Typed { prefix, value } => match prefix.as_str() {
            "guid" => Scalar::Text(value.to_ascii_lowercase()),
            "datetime" | "datetimeoffset" | "time" | "date" => {
                parse_timestamp(value).map(Scalar::Time).unwrap_or_else(|| Scalar::Text(value.clone()))
            }
            _ => text_to_scalar(value, hint),
        },
        Literal::Raw(raw) => match hint {
            Some(_) => text_to_scalar(raw, hint),
            None => {
                if let Some(n) = parse_number(raw) {
                    Scalar::Number(n)
                } else if let Some(t) = parse_timestamp(raw) {
                    Scalar::Time(t)
                } else {
                    Scalar::Text(raw.to_ascii_lowercase())
                }
            }
        },
    }
}

/// Value at a slash path. Walks nested objects and V2 `{results}` wrappers; `X/$count` is a length.
pub fn value_at<'v>(row: &'v Record, path: &str) -> Option<std::borrow::Cow<'v, Value>> {
    use std::borrow::Cow;
    if path.is_empty() {
        return row.get("").map(Cow::Borrowed);
    }
    let mut parts = path.split('/');
    let first = parts.next()?;
    let mut current: &Value = row.get(first)?;
    for part in parts {
        if part == "$count" {
            return Some(Cow::Owned(Value::from(collection_items(current).map(|i| i.len()).unwrap_or(0))));
        }
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            _ => return None,
        };
    }
    Some(Cow::Borrowed(current))
}

/// Items of a collection value: a JSON array or a V2 `{results:[...]}` wrapper.
pub fn collection_items(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(obj) => match obj.get("results") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn operand_hint(operand: &Operand, ctx: &EvalContext) -> Option<EdmType> {
    match operand {
        Operand::Property(p) if p.ends_with("/$count") => Some(EdmType::Int64),
        Operand::Property(p) => ctx.property_type(p),
        _ => None,
    }
}

fn resolve(operand: &Operand, row: &Record, ctx: &EvalContext, hint: Option<EdmType>) -> Scalar {
    match operand {
        Operand::Property(path) => match value_at(row, path) {
            Some(v) => value_to_scalar(&v, ctx.property_type(path).or(hint)),
            None => Scalar::Null,
        },
        Operand::Literal(literal) => literal_to_scalar(literal, hint),
        Operand::Call { function, args } => call(function, args, row, ctx),
        Operand::Lambda(lambda) => Scalar::Bool(evaluate_lambda(lambda, row, ctx)),
    }
}

fn call(function: &str, args: &[Operand], row: &Record, ctx: &EvalContext) -> Scalar {
    let arg = |i: usize| args.get(i).map(|a| resolve(a, row, ctx, None)).unwrap_or(Scalar::Null);
    let text = |i: usize| arg(i).as_text();
    match function {
        "contains" => Scalar::Bool(text(0).contains(&text(1))),
        "substringof" => Scalar::Bool(text(1).contains(&text(0))),
        "startswith" => Scalar::Bool(text(0).starts_with(&text(1))),
        "endswith" => Scalar::Bool(text(0).ends_with(&text(1))),
        "tolower" => Scalar::Text(text(0).to_lowercase()),
        "toupper" => Scalar::Text(text(0).to_uppercase()),
        "trim" => Scalar::Text(text(0).trim().to_string()),
        "length" => Scalar::Number(text(0).chars().count() as f64),
        "concat" => Scalar::Text(args.iter().map(|a| resolve(a, row, ctx, None).as_text()).collect()),
        "indexof" => Scalar::Number(
            text(0)
                .find(&text(1))
                .map(|byte| text(0)[..byte].chars().count() as f64)
                .unwrap_or(-1.0),
        ),
        "substring" => {
            let s: Vec<char> = text(0).chars().collect();
            let start = arg(1).as_number().unwrap_or(0.0).max(0.0) as usize;
            let start = start.min(s.len());
            let end = match args.get(2) {
                Some(_) => (start + arg(2).as_number().unwrap_or(0.0).max(0.0) as usize).min(s.len()),
                None => s.len(),
            };
            Scalar::Text(s[start..end].iter().collect())
        }
        "round" => arg(0).as_number().map(|n| Scalar::Number(n.round())).unwrap_or(Scalar::Null),
        "floor" => arg(0).as_number().map(|n| Scalar::Number(n.floor())).unwrap_or(Scalar::Null),
        "ceiling" => arg(0).as_number().map(|n| Scalar::Number(n.ceil())).unwrap_or(Scalar::Null),
        "year" | "month" | "day" | "hour" | "minute" | "second" => date_part(function, arg(0)),
        other => {
            tracing::warn!(function = %other, "unsupported $filter function");
            Scalar::Null
        }
    }
}

fn date_part(part: &str, value: Scalar) -> Scalar {
    use chrono::Datelike;
    let ms = match value {
        Scalar::Time(ms) => ms,
        other => match parse_timestamp(&other.as_text()) {
            Some(ms) => ms,
            None => return Scalar::Null,
        },
    };
    let Some(dt) = DateTime::from_timestamp_millis(ms) else {
        return Scalar::Null;
    };
    let n = match part {
        "year" => dt.year() as f64,
        "month" => dt.month() as f64,
        "day" => dt.day() as f64,
        "hour" => dt.hour() as f64,
        "minute" => dt.minute() as f64,
        _ => dt.second() as f64,
    };
    Scalar::Number(n)
}

fn compare_scalars(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a, b) {
        (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
        (Scalar::Null, _) | (_, Scalar::Null) => None,
        (Scalar::Bool(x), Scalar::Bool(y)) => Some(x.cmp(y)),
        (Scalar::Number(x), Scalar::Number(y)) => x.partial_cmp(y),
        (Scalar::Time(x), Scalar::Time(y)) => Some(x.cmp(y)),
        (Scalar::Text(x), Scalar::Text(y)) => Some(x.cmp(y)),
        (Scalar::Bool(x), Scalar::Text(y)) => Some(x.to_string().cmp(&y.to_ascii_lowercase())),
        (Scalar::Text(x), Scalar::Bool(y)) => Some(x.to_ascii_lowercase().cmp(&y.to_string())),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(a.as_text().cmp(&b.as_text())),
        },
    }
}

fn apply_operator(operator: CompareOp, ordering: Option<Ordering>, either_null: bool) -> bool {
    match operator {
        CompareOp::Eq => ordering == Some(Ordering::Equal),
        CompareOp::Ne => ordering != Some(Ordering::Equal),
        _ if either_null => false,
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

fn evaluate_lambda(lambda: &Lambda, row: &Record, ctx: &EvalContext) -> bool {
    let items = match value_at(row, &lambda.collection) {
        Some(v) => collection_items(&v).cloned().unwrap_or_default(),
        None => Vec::new(),
    };
    let Some(predicate) = &lambda.predicate else {
        return match lambda.kind {
            LambdaKind::Any => !items.is_empty(),
            LambdaKind::All => true,
        };
    };
    let target_type = ctx
        .entity_type
        .and_then(|t| ctx.schema.navigation_type_at(t, &lambda.collection));
    let item_type = ctx
        .entity_type
        .and_then(|t| ctx.schema.property_at(t, &lambda.collection))
        .map(|p| p.edm_type);
    let inner = EvalContext {
        schema: ctx.schema,
        entity_type: target_type.as_deref(),
        item_type,
    };
    let test = |item: &Value| match item {
        Value::Object(obj) => evaluate(predicate, obj, &inner),
        scalar => {
            let mut wrapper = Record::new();
            wrapper.insert(String::new(), scalar.clone());
            evaluate(predicate, &wrapper, &inner)
        }
    };
    match lambda.kind {
        LambdaKind::Any => items.iter().any(test),
        LambdaKind::All => items.iter().all(test),
    }
}

/// Evaluate a filter expression against one row.
pub fn evaluate(expr: &FilterExpr, row: &Record, ctx: &EvalContext) -> bool {
    match expr {
        FilterExpr::And(items) => items.iter().all(|e| evaluate(e, row, ctx)),
        FilterExpr::Or(items) => items.iter().any(|e| evaluate(e, row, ctx)),
        FilterExpr::Not(inner) => !evaluate(inner, row, ctx),
        FilterExpr::Compare { left, operator, right } => {
            let hint = operand_hint(left, ctx).or_else(|| operand_hint(right, ctx));
            let l = resolve(left, row, ctx, hint);
            let r = resolve(right, row, ctx, hint);
            let either_null = l == Scalar::Null || r == Scalar::Null;
            apply_operator(*operator, compare_scalars(&l, &r), either_null)
        }
        FilterExpr::In { left, values } => {
            let hint = operand_hint(left, ctx);
            let l = resolve(left, row, ctx, hint);
            values
                .iter()
                .any(|v| compare_scalars(&l, &resolve(v, row, ctx, hint)) == Some(Ordering::Equal))
        }
    }
}

/// Every token must occur (case-insensitively) in at least one string property.
pub fn matches_search(tokens: &[String], row: &Record, entity_type: &EntityType) -> bool {
    tokens.iter().all(|token| {
        let needle = token.to_lowercase();
        entity_type.string_properties().any(|p| {
            row.get(&p.name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
    })
}

/// Total order used by `$orderby`: nulls first, numbers numerically, otherwise by text.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let to_scalar = |v: Option<&Value>| v.map(|v| value_to_scalar(v, None)).unwrap_or(Scalar::Null);
    let (a, b) = (to_scalar(a), to_scalar(b));
    match (&a, &b) {
        (Scalar::Null, Scalar::Null) => Ordering::Equal,
        (Scalar::Null, _) => Ordering::Less,
        (_, Scalar::Null) => Ordering::Greater,
        _ => compare_scalars(&a, &b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve as resolve_schema, ServiceConfig};
    use crate::query::parse_filter;
    use serde_json::json;

    fn schema() -> ServiceSchema {
        let config: ServiceConfig = serde_json::from_value(json!({
            "entity_types": [
                {
                    "name": "Order",
                    "keys": ["ID"],
                    "properties": [
                        { "name": "ID", "type": "Edm.Int32" },
                        { "name": "Name", "type": "Edm.String" },
                        { "name": "Price", "type": "Edm.Decimal" },
                        { "name": "Paid", "type": "Edm.Boolean" },
                        { "name": "CreatedAt", "type": "Edm.DateTimeOffset" },
                        { "name": "Tags", "type": "Collection(Edm.String)", "is_collection": true }
                    ],
                    "navigation_properties": [
                        { "name": "to_Items", "target_type": "Item", "is_collection": true }
                    ]
                },
                {
                    "name": "Item",
                    "keys": ["ItemID"],
                    "properties": [
                        { "name": "ItemID", "type": "Edm.Int32" },
                        { "name": "Quantity", "type": "Edm.Int32" }
                    ]
                }
            ],
            "entity_sets": [{ "name": "Orders", "entity_type": "Order" }, { "name": "Items", "entity_type": "Item" }]
        }))
        .unwrap();
        resolve_schema(&config).unwrap()
    }

    fn row() -> Record {
        json!({
            "ID": 7,
            "Name": "Bob's Order",
            "Price": "12.50",
            "Paid": true,
            "CreatedAt": "2024-03-01T10:00:00Z",
            "Tags": ["urgent", "gift"],
            "to_Items": [{ "ItemID": 1, "Quantity": 1 }, { "ItemID": 2, "Quantity": 5 }]
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn check(filter: &str) -> bool {
        let schema = schema();
        let entity_type = schema.entity_type("Order").unwrap().clone();
        let ctx = EvalContext::new(&schema, &entity_type);
        evaluate(&parse_filter(filter).unwrap(), &row(), &ctx)
    }

    #[test]
    fn literals_coerce_by_declared_type() {
        assert!(check("ID eq '7'"));
        assert!(check("ID eq 7"));
        assert!(check("Price gt 12.4M"));
        assert!(check("Paid eq true"));
        assert!(check("Paid"));
        assert!(!check("Paid eq false"));
        assert!(check("CreatedAt lt 2024-03-02T00:00:00Z"));
        assert!(check("CreatedAt ge datetime'2024-03-01T10:00:00'"));
    }

    #[test]
    fn boolean_composites_and_functions() {
        assert!(check("startswith(Name,'Bob') and not (ID ne 7)"));
        assert!(check("contains(tolower(Name),'order') or ID eq 1"));
        assert!(check("substringof('Order',Name)"));
        assert!(check("length(Name) eq 11"));
        assert!(check("year(CreatedAt) eq 2024"));
        assert!(check("ID in (1,7)"));
        assert!(!check("Name eq null"));
        assert!(check("Name ne null"));
    }

    #[test]
    fn lambdas_over_navigation_and_primitive_collections() {
        assert!(check("to_Items/any(i:i/Quantity ge 5)"));
        assert!(!check("to_Items/all(i:i/Quantity ge 5)"));
        assert!(check("Tags/any(t:t eq 'gift')"));
        assert!(check("to_Items/any()"));
    }

    #[test]
    fn search_requires_every_token() {
        let schema = schema();
        let entity_type = schema.entity_type("Order").unwrap();
        assert!(matches_search(&["bob".into(), "ORDER".into()], &row(), entity_type));
        assert!(!matches_search(&["bob".into(), "alice".into()], &row(), entity_type));
    }

    #[test]
    fn timestamps_accept_legacy_form() {
        assert_eq!(parse_timestamp("/Date(1700000000000)/"), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp("1970-01-02"), Some(86_400_000));
        assert_eq!(parse_timestamp("PT01H00M00S"), Some(3_600_000));
    }
}
