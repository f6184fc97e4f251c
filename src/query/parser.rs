//! Path, key predicate and system query option parsing.

use crate::error::AppError;
use crate::query::apply::parse_apply;
use crate::query::filter::parse_filter;
use crate::query::{ExpandNode, OrderBy, PathSegment, Query, SelectSet, SortDirection};
use crate::store::{unwrap_literal, KeyMap, DEFAULT_KEY};
use serde_json::Value;

/// Percent-decode one query or path component; `+` stands for a space.
pub fn decode(raw: &str) -> Result<String, AppError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| AppError::BadRequest(format!("invalid percent-encoding in '{}': {}", raw, e)))
}

/// Split on `sep` outside of quotes and `()`, `[]`, `{}` nesting.
pub fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' | '[' | '{' if !in_quote => depth += 1,
            ')' | ']' | '}' if !in_quote => depth -= 1,
            _ => {}
        }
        if c == sep && depth == 0 && !in_quote {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Parentheses outside of quotes balance.
pub fn is_balanced(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_quote = false;
    for c in input.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// `name(args)` -> (`name`, `args`) when the input is a single call.
pub fn split_call(input: &str) -> Option<(&str, &str)> {
    let input = input.trim();
    let open = input.find('(')?;
    if !input.ends_with(')') {
        return None;
    }
    Some((input[..open].trim(), &input[open + 1..input.len() - 1]))
}

/// Key predicate body (`'FR'`, `ID=1,IsActiveEntity=true`) to a key map.
pub fn parse_key_predicate(inner: &str) -> Result<KeyMap, AppError> {
    let mut keys = KeyMap::new();
    for part in split_top_level(inner, ',') {
        let (name, literal) = match split_assignment(&part) {
            Some((name, literal)) => (name.trim().to_string(), literal.trim()),
            None => (DEFAULT_KEY.to_string(), part.as_str()),
        };
        let decoded = decode(literal)?;
        keys.insert(name, key_literal(&decoded));
    }
    Ok(keys)
}

fn split_assignment(part: &str) -> Option<(&str, &str)> {
    let eq = part.find('=')?;
    if part[..eq].contains('\'') {
        return None;
    }
    Some((&part[..eq], &part[eq + 1..]))
}

fn key_literal(literal: &str) -> Value {
    if literal == "null" {
        return Value::Null;
    }
    Value::String(unwrap_literal(literal))
}

/// Resource path (relative to the service root) to segments with their key predicates.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, AppError> {
    let mut segments = Vec::new();
    for raw in split_top_level(path.trim_matches('/'), '/') {
        if !is_balanced(&raw) {
            return Err(AppError::BadRequest(format!("unbalanced parentheses in path segment '{}'", raw)));
        }
        let segment = match split_call(&raw) {
            Some((name, inner)) => PathSegment {
                path: decode(name)?,
                keys: parse_key_predicate(inner)?,
            },
            None => PathSegment {
                path: decode(&raw)?,
                keys: KeyMap::new(),
            },
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// `Name desc, Price` -> order list; direction defaults to ascending.
pub fn parse_order_by(input: &str) -> Vec<OrderBy> {
    split_top_level(input, ',')
        .into_iter()
        .map(|clause| {
            let mut words = clause.split_whitespace();
            let property = words.next().unwrap_or_default().to_string();
            let direction = match words.next() {
                Some(d) if d.eq_ignore_ascii_case("desc") => SortDirection::Desc,
                _ => SortDirection::Asc,
            };
            OrderBy { property, direction }
        })
        .filter(|o| !o.property.is_empty())
        .collect()
}

/// `$search` value to tokens; quoted phrases stay together and boolean keywords are dropped.
pub fn parse_search(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quote = !in_quote;
                if !in_quote && !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !in_quote => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens.retain(|t| t != "AND" && t != "OR");
    tokens
}

pub fn parse_select(input: &str) -> SelectSet {
    let mut select = SelectSet::default();
    let items = split_top_level(input, ',');
    if items.is_empty() || items.iter().any(|i| i == "*") {
        return select;
    }
    select.all = false;
    select.properties.extend(items);
    select
}

/// `$expand` value (nested V4 options or V2 slash paths) to an expand tree.
pub fn parse_expand(input: &str) -> Result<Vec<ExpandNode>, AppError> {
    if !is_balanced(input) {
        return Err(AppError::BadRequest(format!("unbalanced parentheses in $expand '{}'", input)));
    }
    let mut nodes: Vec<ExpandNode> = Vec::new();
    for item in split_top_level(input, ',') {
        let node = match split_call(&item) {
            Some((name, options)) => {
                let mut node = ExpandNode::new(name);
                for option in split_top_level(options, ';') {
                    let Some((key, value)) = option.split_once('=') else {
                        continue;
                    };
                    match key.trim() {
                        "$select" => node.select = parse_select(value),
                        "$expand" => node.expand = parse_expand(value)?,
                        other => tracing::debug!(option = %other, "nested expand option ignored"),
                    }
                }
                node
            }
            None => {
                let mut parts = item.split('/').rev();
                let mut node = ExpandNode::new(parts.next().unwrap_or_default());
                for parent in parts {
                    let mut wrapper = ExpandNode::new(parent);
                    wrapper.expand.push(node);
                    node = wrapper;
                }
                node
            }
        };
        merge_expand(&mut nodes, node);
    }
    Ok(nodes)
}

fn merge_expand(nodes: &mut Vec<ExpandNode>, node: ExpandNode) {
    match nodes.iter_mut().find(|n| n.name == node.name) {
        Some(existing) => {
            if !node.select.all {
                existing.select.all = false;
                existing.select.properties.extend(node.select.properties);
            }
            for child in node.expand {
                merge_expand(&mut existing.expand, child);
            }
        }
        None => nodes.push(node),
    }
}

/// `$select=Nav/Prop` narrows the select set of the matching expand node.
fn narrow_expanded_selects(select: &mut SelectSet, expand: &mut [ExpandNode]) {
    let nested: Vec<String> = select.properties.iter().filter(|p| p.contains('/')).cloned().collect();
    for path in nested {
        let parts: Vec<&str> = path.split('/').collect();
        if narrow_path(expand, &parts) {
            select.properties.remove(&path);
            select.properties.insert(parts[0].to_string());
        }
    }
}

fn narrow_path(nodes: &mut [ExpandNode], parts: &[&str]) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return false;
    };
    let Some(node) = nodes.iter_mut().find(|n| n.name == *first) else {
        return false;
    };
    match rest {
        [] => true,
        [property] => {
            node.select.all = false;
            node.select.properties.insert(property.to_string());
            true
        }
        deeper => narrow_path(&mut node.expand, deeper),
    }
}

/// Raw query string to a [`Query`]. Non-system parameters are kept for function imports.
pub fn parse_query(raw_query: Option<&str>) -> Result<Query, AppError> {
    let mut query = Query::default();
    let Some(raw) = raw_query else {
        return Ok(query);
    };
    let mut select_raw = None;
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode(name)?;
        let value = decode(value)?;
        match name.as_str() {
            "$filter" => query.filter = Some(parse_filter(&value)?),
            "$search" => query.search = parse_search(&value),
            "$orderby" => query.order_by = parse_order_by(&value),
            "$select" => select_raw = Some(value),
            "$expand" => query.expand = parse_expand(&value)?,
            "$apply" => query.apply = parse_apply(&value)?,
            "$skip" => query.skip = value.trim().parse().unwrap_or(0),
            "$top" => query.top = value.trim().parse().ok(),
            "$count" => query.count = value.eq_ignore_ascii_case("true"),
            "$inlinecount" => query.count = value.eq_ignore_ascii_case("allpages"),
            "$format" | "$skiptoken" => {}
            other if other.starts_with('$') => {
                tracing::debug!(option = %other, "unsupported system query option ignored")
            }
            _ => {
                query.params.insert(name, value);
            }
        }
    }
    if let Some(select) = select_raw {
        if !is_balanced(&select) {
            return Err(AppError::BadRequest(format!("unbalanced parentheses in $select '{}'", select)));
        }
        query.select = parse_select(&select);
        narrow_expanded_selects(&mut query.select, &mut query.expand);
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_segments_with_default_and_named_keys() {
        let segments = parse_path("/Countries('FR')/to_Regions(ID=42,IsActiveEntity=true)/Name").unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].path, "Countries");
        assert_eq!(segments[0].keys[DEFAULT_KEY], json!("FR"));
        assert_eq!(segments[1].keys["ID"], json!("42"));
        assert_eq!(segments[1].keys["IsActiveEntity"], json!("true"));
        assert!(segments[2].keys.is_empty());
    }

    #[test]
    fn quoted_keys_may_contain_separators() {
        let segments = parse_path("Items('a%2Fb,c')").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].keys[DEFAULT_KEY], json!("a/b,c"));
        let segments = parse_path("Items(guid'0d1f2c3e-0000-4000-8000-000000000001')").unwrap();
        assert_eq!(segments[0].keys[DEFAULT_KEY], json!("0d1f2c3e-0000-4000-8000-000000000001"));
    }

    #[test]
    fn order_by_defaults_to_ascending() {
        let order = parse_order_by("Name desc, Price");
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].direction, SortDirection::Desc);
        assert_eq!(order[1].property, "Price");
        assert_eq!(order[1].direction, SortDirection::Asc);
    }

    #[test]
    fn nested_v4_expand_and_v2_paths() {
        let nodes = parse_expand("to_Items($select=ID,Quantity;$expand=to_Product),to_Customer/to_Address").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes[0].select.all);
        assert!(nodes[0].select.properties.contains("Quantity"));
        assert_eq!(nodes[0].expand[0].name, "to_Product");
        assert_eq!(nodes[1].name, "to_Customer");
        assert_eq!(nodes[1].expand[0].name, "to_Address");
        assert!(parse_expand("to_Items($select=ID").is_err());
    }

    #[test]
    fn query_options_and_paging_defaults() {
        let q = parse_query(Some("$top=abc&$skip=x&$count=true&$select=Name,to_Items/ID&$expand=to_Items&foo=bar"))
            .unwrap();
        assert_eq!(q.top, None);
        assert_eq!(q.skip, 0);
        assert!(q.count);
        assert!(q.select.properties.contains("to_Items"));
        assert!(q.expand[0].select.properties.contains("ID"));
        assert_eq!(q.params["foo"], "bar");
        let q = parse_query(Some("$inlinecount=allpages&$filter=Name%20eq%20'a+b'")).unwrap();
        assert!(q.count);
        assert!(q.filter.is_some());
    }

    #[test]
    fn search_keeps_phrases() {
        assert_eq!(parse_search("\"new york\" AND paris"), vec!["new york", "paris"]);
    }
}
