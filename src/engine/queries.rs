use serde_json::{Map, Value};

use crate::query::ID_FIELD;

use super::error::malformed;
use super::matcher::{matches, parse_sort, sort_documents};
use super::{Engine, EngineError};

/// Options of a `find`: all optional, applied as sort, then limit, then projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    pub sort: Option<Value>,
    pub projection: Option<Value>,
    pub limit: Option<u64>,
}

/// Inclusion projection: keeps the listed top-level fields and always `_id`.
pub(crate) fn project(doc: &Value, projection: &Value) -> Result<Value, EngineError> {
    let fields = projection
        .as_object()
        .ok_or_else(|| malformed("projection must be a document"))?;
    let Value::Object(source) = doc else {
        return Ok(doc.clone());
    };
    let mut out = Map::new();
    if let Some(id) = source.get(ID_FIELD) {
        out.insert(ID_FIELD.into(), id.clone());
    }
    for (field, include) in fields {
        let included = match include {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64() != Some(0.0),
            _ => return Err(malformed(format!("projection of {field} must be 0 or 1"))),
        };
        if !included {
            if field == ID_FIELD {
                out.remove(ID_FIELD);
                continue;
            }
            return Err(malformed("exclusion projections are not supported"));
        }
        if field.contains('.') {
            return Err(malformed(format!("nested projection {field} is not supported")));
        }
        if let Some(v) = source.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    Ok(Value::Object(out))
}

impl Engine {
    /// Documents matching `filter`, each read under its own read lock.
    pub(super) async fn matching(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, EngineError> {
        let mut out = Vec::new();
        for (_, slot) in self.snapshot(collection) {
            let doc = Value::Object(slot.read().await.clone());
            if matches(&doc, filter, &mut None)? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    pub async fn find(&self, collection: &str, filter: &Value, spec: &FindSpec) -> Result<Vec<Value>, EngineError> {
        let mut docs = self.matching(collection, filter).await?;
        if let Some(sort) = &spec.sort {
            sort_documents(&mut docs, &parse_sort(sort)?);
        }
        if let Some(limit) = spec.limit.filter(|n| *n > 0) {
            docs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        match &spec.projection {
            Some(p) => docs.iter().map(|d| project(d, p)).collect(),
            None => Ok(docs),
        }
    }

    /// First document matching `filter`. Stops at the first match and reads
    /// only the pinned document when the filter has an `_id` equality.
    pub async fn find_one(
        &self,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
    ) -> Result<Option<Value>, EngineError> {
        for (_, slot) in self.candidates(collection, filter) {
            let doc = Value::Object(slot.read().await.clone());
            if matches(&doc, filter, &mut None)? {
                return match projection {
                    Some(p) => project(&doc, p).map(Some),
                    None => Ok(Some(doc)),
                };
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projection_keeps_id_and_listed_fields() {
        let doc = json!({"_id": "a", "bookings": [1], "make": "VW"});
        assert_eq!(project(&doc, &json!({"bookings": 1})).unwrap(), json!({"_id": "a", "bookings": [1]}));
        assert_eq!(project(&doc, &json!({"_id": 1})).unwrap(), json!({"_id": "a"}));
        assert_eq!(project(&doc, &json!({"_id": 0, "make": 1})).unwrap(), json!({"make": "VW"}));
    }

    #[test]
    fn projection_rejects_exclusion_and_nesting() {
        let doc = json!({"_id": "a"});
        assert!(project(&doc, &json!({"make": 0})).is_err());
        assert!(project(&doc, &json!({"a.b": 1})).is_err());
    }
}
