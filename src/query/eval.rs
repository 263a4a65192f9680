//! In-process evaluation of the query language over `serde_json::Value`.
//!
//! Semantics follow the SQL rendering: missing fields never satisfy a
//! comparison, nulls sort after every value when ascending, text compares
//! by bytes, and numbers compare numerically.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::{
    AggregateSpec, Aggregation, FindSpec, JsonPath, MapReduce, Predicate, Reducer, SortDirection,
    SortKind, SortSpec, Update, UpdateOp,
};
use crate::{Error, Result};

pub fn get_path<'a>(doc: &'a Value, path: &JsonPath) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.parts() {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Equality as jsonb sees it: numbers compare by value, not by representation.
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, x)| ym.get(k).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

fn compare_scalar(field: &Value, bound: &Value) -> Option<Ordering> {
    match bound {
        Value::Number(b) => {
            let f = match field {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.parse::<f64>().ok()?,
                _ => return None,
            };
            f.partial_cmp(&b.as_f64()?)
        }
        Value::String(b) => Some(text_of(field)?.as_str().cmp(b.as_str())),
        Value::Bool(b) => match field {
            Value::Bool(f) => Some(f.cmp(b)),
            _ => None,
        },
        _ => None,
    }
}

fn cmp_matches(doc: &Value, path: &JsonPath, bound: &Value, accept: fn(Ordering) -> bool) -> bool {
    get_path(doc, path)
        .and_then(|field| compare_scalar(field, bound))
        .is_some_and(accept)
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| stem(&w.to_lowercase()))
}

fn stem(word: &str) -> String {
    word.strip_suffix("es")
        .filter(|w| w.ends_with('s') || w.ends_with('x') || w.ends_with("ch") || w.ends_with("sh"))
        .or_else(|| word.strip_suffix('s').filter(|w| w.len() > 2 && !w.ends_with('s')))
        .unwrap_or(word)
        .to_string()
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn text_matches(doc: &Value, query: &str) -> bool {
    let terms: Vec<String> = words(query).collect();
    if terms.is_empty() {
        return false;
    }
    let mut strings = Vec::new();
    collect_strings(doc, &mut strings);
    let vocabulary: Vec<String> = strings.iter().flat_map(|s| words(s)).collect();
    terms.iter().all(|t| vocabulary.contains(t))
}

pub fn matches(predicate: &Predicate, doc: &Value) -> Result<bool> {
    Ok(match predicate {
        Predicate::True => true,
        Predicate::Eq { path, value } => get_path(doc, path).is_some_and(|f| json_eq(f, value)),
        Predicate::Ne { path, value } => !get_path(doc, path).is_some_and(|f| json_eq(f, value)),
        Predicate::Gt { path, value } => cmp_matches(doc, path, value, Ordering::is_gt),
        Predicate::Ge { path, value } => cmp_matches(doc, path, value, Ordering::is_ge),
        Predicate::Lt { path, value } => cmp_matches(doc, path, value, Ordering::is_lt),
        Predicate::Le { path, value } => cmp_matches(doc, path, value, Ordering::is_le),
        Predicate::Range { path, low, high } => {
            let above = low
                .as_ref()
                .is_none_or(|low| cmp_matches(doc, path, low, Ordering::is_ge));
            let below = high
                .as_ref()
                .is_none_or(|high| cmp_matches(doc, path, high, Ordering::is_le));
            above && below
        }
        Predicate::In { path, values } => get_path(doc, path)
            .is_some_and(|f| values.iter().any(|v| json_eq(f, v))),
        Predicate::Exists(path) => get_path(doc, path).is_some(),
        Predicate::Text { query, .. } => text_matches(doc, query),
        Predicate::Regex {
            path,
            pattern,
            case_insensitive,
        } => {
            let re = RegexBuilder::new(pattern)
                .case_insensitive(*case_insensitive)
                .build()
                .map_err(|e| Error::validation("pattern", e.to_string()))?;
            get_path(doc, path)
                .and_then(text_of)
                .is_some_and(|text| re.is_match(&text))
        }
        Predicate::Not(inner) => !matches(inner, doc)?,
        Predicate::And(predicates) => {
            for p in predicates {
                if !matches(p, doc)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or(predicates) => {
            for p in predicates {
                if matches(p, doc)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}

fn sort_key_cmp(a: Option<&Value>, b: Option<&Value>, kind: SortKind) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match kind {
            SortKind::Numeric => {
                let x = a.as_f64().or_else(|| a.as_str().and_then(|s| s.parse().ok()));
                let y = b.as_f64().or_else(|| b.as_str().and_then(|s| s.parse().ok()));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            SortKind::Text => text_of(a).cmp(&text_of(b)),
        },
    }
}

pub fn compare_documents(a: &Value, b: &Value, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ord = sort_key_cmp(get_path(a, &spec.path), get_path(b, &spec.path), spec.kind);
        let ord = match spec.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn project(doc: &Value, fields: &[String]) -> Value {
    let mut out = Map::new();
    for field in fields {
        let value = get_path(doc, &JsonPath::from(field.as_str()))
            .cloned()
            .unwrap_or(Value::Null);
        out.insert(field.clone(), value);
    }
    Value::Object(out)
}

/// Filter, sort, page and project `docs` the way a find would.
pub fn run_find<'a, I>(docs: I, spec: &FindSpec) -> Result<Vec<Value>>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut hits = Vec::new();
    for doc in docs {
        if matches(&spec.filter, doc)? {
            hits.push(doc);
        }
    }
    hits.sort_by(|a, b| compare_documents(a, b, &spec.sort));
    let limit = spec.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    Ok(hits
        .into_iter()
        .skip(spec.skip as usize)
        .take(limit)
        .map(|doc| match &spec.projection {
            Some(fields) if !fields.is_empty() => project(doc, fields),
            _ => doc.clone(),
        })
        .collect())
}

fn ensure_parent<'a>(doc: &'a mut Value, parts: &[String]) -> Option<&'a mut Map<String, Value>> {
    let mut current = doc;
    for part in parts {
        let map = current.as_object_mut()?;
        current = map
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current.as_object_mut()
}

fn set_path(doc: &mut Value, path: &JsonPath, value: Value) {
    if let Some((last, parents)) = path.parts().split_last() {
        if let Some(map) = ensure_parent(doc, parents) {
            map.insert(last.clone(), value);
        }
    }
}

pub fn apply_update(doc: &mut Value, update: &Update) {
    for op in update.ops() {
        match op {
            UpdateOp::Set { path, value } => set_path(doc, path, value.clone()),
            UpdateOp::Unset { path } => {
                if let Some((last, parents)) = path.parts().split_last() {
                    let parent = JsonPath::from(parents.to_vec());
                    let target = if parents.is_empty() {
                        Some(&mut *doc)
                    } else {
                        get_path_mut(doc, &parent)
                    };
                    if let Some(Value::Object(map)) = target {
                        map.remove(last);
                    }
                }
            }
            UpdateOp::Inc { path, by } => {
                let current = get_path(doc, path).and_then(Value::as_f64).unwrap_or(0.0);
                let next = current + by;
                let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                    Value::from(next as i64)
                } else {
                    Value::from(next)
                };
                set_path(doc, path, value);
            }
            UpdateOp::Push { path, value } => {
                let mut items = match get_path(doc, path) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.push(value.clone());
                set_path(doc, path, Value::Array(items));
            }
        }
    }
}

fn get_path_mut<'a>(doc: &'a mut Value, path: &JsonPath) -> Option<&'a mut Value> {
    let mut current = doc;
    for part in path.parts() {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn numbers(docs: &[&Value], path: &JsonPath) -> Vec<f64> {
    docs.iter()
        .filter_map(|d| get_path(d, path))
        .filter_map(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .collect()
}

fn number_value(n: Option<f64>) -> Value {
    n.map(Value::from).unwrap_or(Value::Null)
}

fn group<'a>(docs: &[&'a Value], keys: &[JsonPath]) -> BTreeMap<String, (Vec<Value>, Vec<&'a Value>)> {
    let mut groups: BTreeMap<String, (Vec<Value>, Vec<&'a Value>)> = BTreeMap::new();
    for doc in docs {
        let key: Vec<Value> = keys
            .iter()
            .map(|k| get_path(doc, k).cloned().unwrap_or(Value::Null))
            .collect();
        let label = Value::Array(key.clone()).to_string();
        groups.entry(label).or_insert_with(|| (key, Vec::new())).1.push(*doc);
    }
    groups
}

pub fn run_aggregation<'a, I>(docs: I, aggregation: &Aggregation) -> Result<Vec<Value>>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut hits = Vec::new();
    for doc in docs {
        if matches(&aggregation.filter, doc)? {
            hits.push(doc);
        }
    }
    let mut out = Vec::new();
    for (_, (key, members)) in group(&hits, &aggregation.group_by) {
        let mut row = Map::new();
        for (path, value) in aggregation.group_by.iter().zip(key) {
            row.insert(path.dotted(), value);
        }
        for agg in &aggregation.aggregates {
            let value = match agg {
                AggregateSpec::Count { .. } => Value::from(members.len() as u64),
                AggregateSpec::Sum { path, .. } => {
                    number_value(Some(numbers(&members, path).iter().sum()))
                }
                AggregateSpec::Avg { path, .. } => {
                    let ns = numbers(&members, path);
                    number_value((!ns.is_empty()).then(|| ns.iter().sum::<f64>() / ns.len() as f64))
                }
                AggregateSpec::Min { path, .. } => {
                    number_value(numbers(&members, path).into_iter().reduce(f64::min))
                }
                AggregateSpec::Max { path, .. } => {
                    number_value(numbers(&members, path).into_iter().reduce(f64::max))
                }
            };
            row.insert(agg.alias().to_string(), value);
        }
        out.push(Value::Object(row));
    }
    Ok(out)
}

pub fn run_map_reduce<'a, I>(docs: I, spec: &MapReduce) -> Result<Vec<Value>>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut hits = Vec::new();
    for doc in docs {
        if matches(&spec.filter, doc)? {
            hits.push(doc);
        }
    }
    let value_path = spec.value.clone().unwrap_or_else(|| spec.key.clone());
    let mut out = Vec::new();
    for (_, (mut key, members)) in group(&hits, std::slice::from_ref(&spec.key)) {
        let reduced = match spec.reducer {
            Reducer::Count => Value::from(members.len() as u64),
            Reducer::Sum => number_value(Some(numbers(&members, &value_path).iter().sum())),
            Reducer::Min => number_value(numbers(&members, &value_path).into_iter().reduce(f64::min)),
            Reducer::Max => number_value(numbers(&members, &value_path).into_iter().reduce(f64::max)),
            Reducer::Collect => Value::Array(
                members
                    .iter()
                    .map(|d| get_path(d, &value_path).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
        };
        let mut row = Map::new();
        row.insert("_id".into(), key.pop().unwrap_or(Value::Null));
        row.insert("value".into(), reduced);
        out.push(Value::Object(row));
    }
    Ok(out)
}
