//! Aggregation pipelines: an ordered list of stages, each consuming the rows
//! the previous one produced.
//!
//! `$group` emits groups in hash order. Pipelines that need an ordered result
//! sort after regrouping.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::query::ID_FIELD;

use super::error::malformed;
use super::matcher::{matches, parse_sort, sort_documents};
use super::{Engine, EngineError};

/// Follow a dotted path through nested objects. `None` when any step is missing.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, seg| match current {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Evaluate an aggregation expression against one row. `None` means missing.
fn eval_expr(doc: &Value, expr: &Value) -> Result<Option<Value>, EngineError> {
    match expr {
        Value::String(s) if s == "$$ROOT" => Ok(Some(doc.clone())),
        Value::String(s) if s.starts_with("$$") => Err(malformed(format!("unknown variable {s}"))),
        Value::String(s) if s.starts_with('$') => Ok(lookup(doc, &s[1..]).cloned()),
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, arg) = map.iter().next().ok_or_else(|| malformed("empty expression"))?;
            match op.as_str() {
                "$mergeObjects" => {
                    let parts = match arg {
                        Value::Array(items) => items.as_slice(),
                        single => std::slice::from_ref(single),
                    };
                    let mut merged = Map::new();
                    for part in parts {
                        match eval_expr(doc, part)? {
                            Some(Value::Object(fields)) => merged.extend(fields),
                            None | Some(Value::Null) => {}
                            Some(_) => return Err(malformed("$mergeObjects only accepts documents")),
                        }
                    }
                    Ok(Some(Value::Object(merged)))
                }
                "$literal" => Ok(Some(arg.clone())),
                other => Err(malformed(format!("unknown expression operator {other}"))),
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if let Some(value) = eval_expr(doc, v)? {
                    out.insert(k.clone(), value);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| eval_expr(doc, item).map(|v| v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(Value::Array(values)))
        }
        literal => Ok(Some(literal.clone())),
    }
}

fn unwind(rows: Vec<Value>, spec: &Value) -> Result<Vec<Value>, EngineError> {
    let path = match spec {
        Value::String(p) => p,
        Value::Object(m) => m
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("$unwind requires a path"))?,
        _ => return Err(malformed("$unwind requires a field path")),
    };
    let field = path
        .strip_prefix('$')
        .filter(|f| !f.is_empty() && !f.contains('.'))
        .ok_or_else(|| malformed(format!("$unwind path {path} must name a top-level field")))?;

    let mut out = Vec::new();
    for row in rows {
        let Value::Object(mut map) = row else { continue };
        match map.remove(field) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = map.clone();
                    copy.insert(field.to_string(), item);
                    out.push(Value::Object(copy));
                }
            }
            // missing, null and empty arrays produce no rows
            None | Some(Value::Null) => {}
            Some(scalar) => {
                map.insert(field.to_string(), scalar);
                out.push(Value::Object(map));
            }
        }
    }
    Ok(out)
}

enum Accumulator {
    First,
    Push,
}

fn group(rows: Vec<Value>, spec: &Value) -> Result<Vec<Value>, EngineError> {
    let spec = spec
        .as_object()
        .ok_or_else(|| malformed("$group expects a document"))?;
    let key_expr = spec
        .get(ID_FIELD)
        .ok_or_else(|| malformed("$group requires an _id expression"))?;

    let mut fields = Vec::new();
    for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
        let (op, expr) = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| malformed(format!("$group field {name} needs one accumulator")))?;
        let kind = match op.as_str() {
            "$first" => Accumulator::First,
            "$push" => Accumulator::Push,
            other => return Err(malformed(format!("unknown accumulator {other}"))),
        };
        fields.push((name.clone(), kind, expr));
    }

    let mut groups: HashMap<String, Map<String, Value>> = HashMap::new();
    for row in &rows {
        let key = eval_expr(row, key_expr)?.unwrap_or(Value::Null);
        let slot = groups.entry(key.to_string()).or_insert_with(|| {
            let mut m = Map::new();
            m.insert(ID_FIELD.into(), key.clone());
            m
        });
        for (name, kind, expr) in &fields {
            let value = eval_expr(row, expr)?;
            match kind {
                Accumulator::First => {
                    if !slot.contains_key(name) {
                        slot.insert(name.clone(), value.unwrap_or(Value::Null));
                    }
                }
                Accumulator::Push => {
                    let entry = slot
                        .entry(name.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let (Value::Array(items), Some(v)) = (entry, value) {
                        items.push(v);
                    }
                }
            }
        }
    }
    Ok(groups.into_values().map(Value::Object).collect())
}

fn replace_root(rows: Vec<Value>, spec: &Value) -> Result<Vec<Value>, EngineError> {
    let expr = spec
        .get("newRoot")
        .ok_or_else(|| malformed("$replaceRoot requires newRoot"))?;
    rows.iter()
        .map(|row| match eval_expr(row, expr)? {
            Some(root @ Value::Object(_)) => Ok(root),
            _ => Err(malformed("newRoot must evaluate to a document")),
        })
        .collect()
}

fn count_arg(stage: &str, spec: &Value) -> Result<usize, EngineError> {
    spec.as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed(format!("{stage} expects a non-negative integer")))
}

impl Engine {
    /// Run an aggregation pipeline over a collection.
    pub async fn aggregate(&self, collection: &str, pipeline: &Value) -> Result<Vec<Value>, EngineError> {
        let stages = pipeline
            .as_array()
            .ok_or_else(|| malformed("pipeline must be an array of stages"))?;

        // A leading $match filters while reading.
        let (mut rows, rest) = match stages.split_first() {
            Some((first, rest)) if first.get("$match").is_some() => {
                (self.matching(collection, &first["$match"]).await?, rest)
            }
            _ => (self.matching(collection, &Value::Object(Map::new())).await?, stages.as_slice()),
        };

        for stage in rest {
            let (name, spec) = stage
                .as_object()
                .filter(|m| m.len() == 1)
                .and_then(|m| m.iter().next())
                .ok_or_else(|| malformed("each stage must be a single-key document"))?;
            rows = match name.as_str() {
                "$match" => {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows {
                        if matches(&row, spec, &mut None)? {
                            kept.push(row);
                        }
                    }
                    kept
                }
                "$unwind" => unwind(rows, spec)?,
                "$sort" => {
                    sort_documents(&mut rows, &parse_sort(spec)?);
                    rows
                }
                "$limit" => {
                    let n = count_arg(name, spec)?;
                    if n == 0 {
                        return Err(malformed("$limit must be positive"));
                    }
                    rows.truncate(n);
                    rows
                }
                "$group" => group(rows, spec)?,
                "$replaceRoot" => replace_root(rows, spec)?,
                other => return Err(malformed(format!("unsupported stage {other}"))),
            };
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwind_drops_missing_and_empty() {
        let rows = vec![
            json!({"_id": "a", "xs": [1, 2]}),
            json!({"_id": "b", "xs": []}),
            json!({"_id": "c"}),
        ];
        let out = unwind(rows, &json!("$xs")).unwrap();
        assert_eq!(out, vec![json!({"_id": "a", "xs": 1}), json!({"_id": "a", "xs": 2})]);
        assert!(unwind(vec![], &json!("$a.b")).is_err());
    }

    #[test]
    fn group_collects_per_key() {
        let rows = vec![
            json!({"_id": "a", "x": 1}),
            json!({"_id": "b", "x": 5}),
            json!({"_id": "a", "x": 2}),
        ];
        let spec = json!({
            "_id": "$_id",
            "first": {"$first": "$x"},
            "xs": {"$push": "$x"}
        });
        let mut out = group(rows, &spec).unwrap();
        out.sort_by_key(|g| g["_id"].as_str().unwrap_or_default().to_string());
        assert_eq!(out[0], json!({"_id": "a", "first": 1, "xs": [1, 2]}));
        assert_eq!(out[1], json!({"_id": "b", "first": 5, "xs": [5]}));
        assert!(group(vec![], &json!({"_id": "$_id", "n": {"$sum": 1}})).is_err());
    }

    #[test]
    fn merge_objects_later_wins() {
        let doc = json!({"_root": {"_id": "a", "xs": 1, "make": "VW"}, "xs": [1, 2]});
        let out = eval_expr(&doc, &json!({"$mergeObjects": ["$_root", {"xs": "$xs"}]})).unwrap();
        assert_eq!(out, Some(json!({"_id": "a", "xs": [1, 2], "make": "VW"})));
    }

    #[test]
    fn root_variable_and_missing_paths() {
        let doc = json!({"a": {"b": 1}});
        assert_eq!(eval_expr(&doc, &json!("$$ROOT")).unwrap(), Some(doc.clone()));
        assert_eq!(eval_expr(&doc, &json!("$a.b")).unwrap(), Some(json!(1)));
        assert_eq!(eval_expr(&doc, &json!("$nope")).unwrap(), None);
        assert!(eval_expr(&doc, &json!("$$NOW")).is_err());
    }
}
