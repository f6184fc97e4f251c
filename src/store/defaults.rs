//! Default values: empty rows, generated keys and synthetic mock rows.

use crate::config::{EdmType, EntitySetDef, Property, ServiceSchema};
use crate::store::{EntityCollection, Record};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

/// Rows synthesized for an entity set that has no seed file.
pub const GENERATED_ROW_COUNT: usize = 150;

const WORDS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet", "kilo", "lima",
    "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango", "uniform", "victor", "whiskey",
    "xray", "yankee", "zulu",
];

/// Row with schema defaults: computed properties stay null, non-nullable ones get a typed default,
/// complex properties are synthesized recursively.
pub fn empty_row(properties: &[Property], schema: &ServiceSchema) -> Record {
    let mut row = Record::new();
    for p in properties {
        let value = if p.computed {
            Value::Null
        } else if p.is_collection {
            Value::Array(Vec::new())
        } else if p.edm_type == EdmType::Complex {
            match schema.complex_type(&p.type_name) {
                Some(c) => Value::Object(empty_row(&c.properties, schema)),
                None => Value::Null,
            }
        } else if !p.nullable {
            typed_default(p)
        } else {
            Value::Null
        };
        row.insert(p.name.clone(), value);
    }
    row
}

fn typed_default(p: &Property) -> Value {
    match p.edm_type {
        EdmType::String => json!(""),
        EdmType::Boolean => json!(false),
        t if t.is_numeric() => json!(0),
        EdmType::Guid => json!(uuid::Uuid::nil().to_string()),
        EdmType::Date => json!(Utc::now().format("%Y-%m-%d").to_string()),
        EdmType::DateTime | EdmType::DateTimeOffset => json!(Utc::now().to_rfc3339()),
        EdmType::TimeOfDay => json!("00:00:00"),
        _ => Value::Null,
    }
}

/// New key value: monotonic integer for numeric keys, a UUID for GUID keys, a random token otherwise.
pub fn generate_key(property: &Property, collection: &EntityCollection) -> Value {
    match property.edm_type {
        t if t.is_numeric() => json!(collection.next_integer(&property.name)),
        EdmType::Guid => json!(uuid::Uuid::new_v4().to_string()),
        _ => {
            let token = uuid::Uuid::new_v4().simple().to_string();
            let len = property.max_length.map(|m| m as usize).unwrap_or(token.len()).clamp(1, token.len());
            json!(token[..len].to_string())
        }
    }
}

/// Deterministic synthetic rows for an entity set (seeded from the set name).
pub fn generate_rows(set: &EntitySetDef, schema: &ServiceSchema, count: usize) -> Vec<Record> {
    let seed = set.name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut rng = StdRng::seed_from_u64(seed);
    let entity_type = &set.entity_type;
    (0..count)
        .map(|i| {
            let mut row = Record::new();
            for p in &entity_type.properties {
                let value = if entity_type.is_key(&p.name) {
                    generated_key_value(p, i, &mut rng)
                } else {
                    random_value(p, schema, &mut rng, 0)
                };
                row.insert(p.name.clone(), value);
            }
            row
        })
        .collect()
}

fn generated_key_value(p: &Property, index: usize, rng: &mut StdRng) -> Value {
    match p.edm_type {
        t if t.is_numeric() => json!(index + 1),
        EdmType::Guid => json!(uuid::Builder::from_random_bytes(rng.gen()).into_uuid().to_string()),
        EdmType::Boolean => json!(true),
        _ => {
            let prefixed = format!("{}{}", p.name.chars().take(3).collect::<String>().to_uppercase(), index + 1);
            let fits = p.max_length.map(|m| prefixed.chars().count() <= m as usize).unwrap_or(true);
            if fits {
                json!(prefixed)
            } else {
                json!(to_base36(index + 1))
            }
        }
    }
}

fn to_base36(mut n: usize) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[n % 36]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn random_value(p: &Property, schema: &ServiceSchema, rng: &mut StdRng, depth: usize) -> Value {
    if p.is_collection {
        return Value::Array(Vec::new());
    }
    match p.edm_type {
        EdmType::String => {
            let words: Vec<&str> = (0..rng.gen_range(1..=3)).map(|_| WORDS[rng.gen_range(0..WORDS.len())]).collect();
            json!(truncate(&words.join(" "), p.max_length))
        }
        EdmType::Boolean => json!(rng.gen_bool(0.5)),
        EdmType::Byte => json!(rng.gen_range(0..=255)),
        EdmType::SByte => json!(rng.gen_range(-128..=127)),
        EdmType::Int16 => json!(rng.gen_range(0..1000)),
        EdmType::Int32 | EdmType::Int64 => json!(rng.gen_range(0..100_000)),
        EdmType::Decimal | EdmType::Double | EdmType::Single => {
            let scale = p.scale.unwrap_or(2).min(6) as i32;
            let factor = 10f64.powi(scale);
            let raw: f64 = rng.gen_range(0.0..10_000.0);
            json!((raw * factor).round() / factor)
        }
        EdmType::Guid => json!(uuid::Builder::from_random_bytes(rng.gen()).into_uuid().to_string()),
        EdmType::Date => {
            let base = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN);
            let day = base + Duration::days(rng.gen_range(0..1500));
            json!(day.format("%Y-%m-%d").to_string())
        }
        EdmType::DateTime | EdmType::DateTimeOffset => {
            let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
            let ts = base + Duration::seconds(rng.gen_range(0..130_000_000));
            json!(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        }
        EdmType::TimeOfDay => json!(format!(
            "{:02}:{:02}:{:02}",
            rng.gen_range(0..24),
            rng.gen_range(0..60),
            rng.gen_range(0..60)
        )),
        EdmType::Complex if depth < 4 => match schema.complex_type(&p.type_name) {
            Some(c) => Value::Object(
                c.properties
                    .iter()
                    .map(|cp| (cp.name.clone(), random_value(cp, schema, rng, depth + 1)))
                    .collect(),
            ),
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

fn truncate(s: &str, max_length: Option<u32>) -> String {
    match max_length {
        Some(max) => s.chars().take(max as usize).collect(),
        None => s.to_string(),
    }
}
