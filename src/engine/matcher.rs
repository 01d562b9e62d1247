use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::error::malformed;
use super::EngineError;

// ── Paths ────────────────────────────────────────────────────────

/// Resolve a dotted path, fanning out over arrays the way document stores do:
/// `bookings.start` yields the `start` of every element of `bookings`.
/// Numeric segments index into arrays. Missing fields yield nothing.
pub(crate) fn resolve<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![value];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for v in current {
            match v {
                Value::Object(map) => {
                    if let Some(child) = map.get(segment) {
                        next.push(child);
                    }
                }
                Value::Array(items) => {
                    if let Ok(idx) = segment.parse::<usize>() {
                        if let Some(child) = items.get(idx) {
                            next.push(child);
                        }
                    } else {
                        for item in items {
                            if let Some(child) = item.as_object().and_then(|m| m.get(segment)) {
                                next.push(child);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Values a comparison is tested against: each resolved value, and for
/// arrays also each of their elements.
fn candidates<'a>(resolved: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for v in resolved {
        out.push(*v);
        if let Value::Array(items) = v {
            out.extend(items.iter());
        }
    }
    out
}

// ── Ordering ─────────────────────────────────────────────────────

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn cmp_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

/// Comparison within one type bracket; `None` across brackets.
fn cmp_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => Some(cmp_numbers(x, y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                match total_cmp(l, r) {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        (Value::Object(_), Value::Object(_)) => Some(a.to_string().cmp(&b.to_string())),
        _ => None,
    }
}

/// Total order used for sorting: null < numbers < strings < objects < arrays < booleans.
pub(crate) fn total_cmp(a: &Value, b: &Value) -> Ordering {
    cmp_same_type(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    cmp_same_type(a, b) == Some(Ordering::Equal)
}

/// Sort key of a document for one field. Array-valued keys sort by their
/// smallest element ascending and by their largest descending.
pub(crate) fn sort_key(doc: &Value, path: &str, descending: bool) -> Value {
    let resolved = resolve(doc, path);
    let mut flat: Vec<&Value> = Vec::new();
    for v in resolved {
        match v {
            Value::Array(items) => flat.extend(items.iter()),
            other => flat.push(other),
        }
    }
    let pick = if descending {
        flat.into_iter().max_by(|a, b| total_cmp(a, b))
    } else {
        flat.into_iter().min_by(|a, b| total_cmp(a, b))
    };
    pick.cloned().unwrap_or(Value::Null)
}

/// Parse a `{field: 1 | -1}` sort document into `(field, descending)` keys.
pub(crate) fn parse_sort(spec: &Value) -> Result<Vec<(String, bool)>, EngineError> {
    let map = spec
        .as_object()
        .ok_or_else(|| malformed("sort must be a document"))?;
    map.iter()
        .map(|(field, dir)| match dir.as_i64() {
            Some(1) => Ok((field.clone(), false)),
            Some(-1) => Ok((field.clone(), true)),
            _ => Err(malformed(format!("sort direction for {field} must be 1 or -1"))),
        })
        .collect()
}

pub(crate) fn sort_documents(docs: &mut [Value], keys: &[(String, bool)]) {
    docs.sort_by(|a, b| {
        for (field, descending) in keys {
            let ord = total_cmp(&sort_key(a, field, *descending), &sort_key(b, field, *descending));
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// ── Filters ──────────────────────────────────────────────────────

fn is_operator_doc(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn clauses<'a>(op: &str, value: &'a Value) -> Result<&'a Vec<Value>, EngineError> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(malformed(format!("{op} expects a non-empty array"))),
    }
}

/// Evaluate a filter document against `doc`.
///
/// When a top-level `$elemMatch` matches, the index of the first matching
/// element is written to `position` for the positional `$` update operator.
pub(crate) fn matches(
    doc: &Value,
    filter: &Value,
    position: &mut Option<usize>,
) -> Result<bool, EngineError> {
    let map = filter
        .as_object()
        .ok_or_else(|| malformed("filter must be a document"))?;
    for (key, cond) in map {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, cond)? {
                    if !matches(doc, clause, position)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, cond)? {
                    if matches(doc, clause, position)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, cond)? {
                    // positions found under a negation never identify an element
                    if matches(doc, clause, &mut None)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            k if k.starts_with('$') => return Err(malformed(format!("unknown operator {k}"))),
            field => field_matches(doc, field, cond, position)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(
    doc: &Value,
    field: &str,
    cond: &Value,
    position: &mut Option<usize>,
) -> Result<bool, EngineError> {
    let resolved = resolve(doc, field);
    match cond {
        Value::Object(ops) if is_operator_doc(ops) => {
            for (op, operand) in ops {
                if !operator_matches(&resolved, op, operand, position)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(eq_matches(&resolved, literal)),
    }
}

fn eq_matches(resolved: &[&Value], operand: &Value) -> bool {
    if resolved.is_empty() {
        return operand.is_null();
    }
    candidates(resolved).iter().any(|v| values_equal(v, operand))
}

fn operator_matches(
    resolved: &[&Value],
    op: &str,
    operand: &Value,
    position: &mut Option<usize>,
) -> Result<bool, EngineError> {
    let ordered = |want: fn(Ordering) -> bool| {
        candidates(resolved)
            .iter()
            .any(|v| cmp_same_type(v, operand).is_some_and(want))
    };
    match op {
        "$eq" => Ok(eq_matches(resolved, operand)),
        "$ne" => Ok(!eq_matches(resolved, operand)),
        "$lt" => Ok(ordered(|o| o == Ordering::Less)),
        "$lte" => Ok(ordered(|o| o != Ordering::Greater)),
        "$gt" => Ok(ordered(|o| o == Ordering::Greater)),
        "$gte" => Ok(ordered(|o| o != Ordering::Less)),
        "$elemMatch" => {
            for v in resolved {
                let Value::Array(items) = v else { continue };
                for (idx, item) in items.iter().enumerate() {
                    if item.is_object() && matches(item, operand, &mut None)? {
                        if position.is_none() && resolved.len() == 1 {
                            *position = Some(idx);
                        }
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        other => Err(malformed(format!("unknown operator {other}"))),
    }
}

/// Fields an upsert seeds a new document with: the equality terms of the
/// filter, at the top level and inside `$and`.
pub(crate) fn equality_terms(filter: &Value, out: &mut Vec<(String, Value)>) {
    let Some(map) = filter.as_object() else { return };
    for (key, cond) in map {
        if key == "$and" {
            if let Value::Array(items) = cond {
                for item in items {
                    equality_terms(item, out);
                }
            }
        } else if !key.starts_with('$') {
            match cond {
                Value::Object(ops) if is_operator_doc(ops) => {
                    if let Some(v) = ops.get("$eq") {
                        out.push((key.clone(), v.clone()));
                    }
                }
                literal => out.push((key.clone(), literal.clone())),
            }
        }
    }
}
