use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::query::ID_FIELD;

use super::error::malformed;
use super::matcher::{equality_terms, matches};
use super::{Collection, Document, Engine, EngineError, SharedDocument};

/// Length of generated `_id`s for documents inserted without one.
const GENERATED_ID_LEN: usize = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<String>,
}

// ── Update application ───────────────────────────────────────────

fn path_segments(path: &str, position: Option<usize>) -> Result<Vec<String>, EngineError> {
    path.split('.')
        .map(|seg| match seg {
            "$" => position
                .map(|p| p.to_string())
                .ok_or_else(|| malformed(format!("positional operator in {path} without a matched array element"))),
            "" => Err(malformed(format!("empty segment in path {path}"))),
            other => Ok(other.to_string()),
        })
        .collect()
}

/// Walk `segments`, creating missing fields as null and turning null
/// intermediates into objects.
fn slot_mut<'a>(doc: &'a mut Value, segments: &[String]) -> Result<&'a mut Value, EngineError> {
    let mut current = doc;
    for seg in segments {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(seg.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let idx: usize = seg
                    .parse()
                    .map_err(|_| malformed(format!("cannot address array with field {seg}")))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| malformed(format!("array index {idx} out of range")))?
            }
            _ => return Err(malformed(format!("cannot create field {seg} inside a scalar"))),
        };
    }
    Ok(current)
}

fn set_path(doc: &mut Value, segments: &[String], value: Value) -> Result<bool, EngineError> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(malformed("empty update path"));
    };
    let parent = slot_mut(doc, parents)?;
    if parent.is_null() {
        *parent = Value::Object(Map::new());
    }
    match parent {
        Value::Object(map) => {
            let changed = map.get(last) != Some(&value);
            map.insert(last.clone(), value);
            Ok(changed)
        }
        Value::Array(items) => {
            let idx: usize = last
                .parse()
                .map_err(|_| malformed(format!("cannot address array with field {last}")))?;
            let item = items
                .get_mut(idx)
                .ok_or_else(|| malformed(format!("array index {idx} out of range")))?;
            let changed = *item != value;
            *item = value;
            Ok(changed)
        }
        _ => Err(malformed(format!("cannot set {last} inside a scalar"))),
    }
}

fn push_path(doc: &mut Value, segments: &[String], value: Value) -> Result<(), EngineError> {
    let target = slot_mut(doc, segments)?;
    match target {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        Value::Null => {
            *target = Value::Array(vec![value]);
            Ok(())
        }
        _ => Err(malformed(format!("$push target {} is not an array", segments.join(".")))),
    }
}

/// Apply an operator update (`$set`, `$push`) in place. Returns whether the
/// document changed.
pub(crate) fn apply_update(
    doc: &mut Document,
    update: &Value,
    position: Option<usize>,
) -> Result<bool, EngineError> {
    let ops = update
        .as_object()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| malformed("update must be a non-empty document"))?;

    let mut root = Value::Object(std::mem::take(doc));
    let result = (|| -> Result<bool, EngineError> {
        let mut changed = false;
        for (op, fields) in ops {
            let fields = fields
                .as_object()
                .ok_or_else(|| malformed(format!("{op} expects a document")))?;
            for (path, value) in fields {
                if path == ID_FIELD {
                    return Err(malformed("_id is immutable"));
                }
                let segments = path_segments(path, position)?;
                match op.as_str() {
                    "$set" => changed |= set_path(&mut root, &segments, value.clone())?,
                    "$push" => {
                        push_path(&mut root, &segments, value.clone())?;
                        changed = true;
                    }
                    other => return Err(malformed(format!("unknown update operator {other}"))),
                }
            }
        }
        Ok(changed)
    })();
    if let Value::Object(map) = root {
        *doc = map;
    }
    result
}

// ── Writes ───────────────────────────────────────────────────────

/// `_id` the filter pins by equality, if any.
fn pinned_id(filter: &Value) -> Option<String> {
    let mut terms = Vec::new();
    equality_terms(filter, &mut terms);
    terms.into_iter().find_map(|(k, v)| match (k.as_str(), v) {
        (ID_FIELD, Value::String(id)) => Some(id),
        _ => None,
    })
}

fn generated_id() -> String {
    crate::token::random_token(&mut rand::thread_rng(), GENERATED_ID_LEN)
}

/// A slot just placed in the map whose WAL record is not queued yet.
/// Dropping it takes the slot back out; it is forgotten once the WAL accepts the record.
struct Claim<'a> {
    collection: &'a Collection,
    id: &'a str,
    slot: &'a SharedDocument,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.collection.remove_if(self.id, |_, v| Arc::ptr_eq(v, self.slot));
    }
}

impl Engine {
    /// Candidates in the collection for `filter`: the pinned document or all of them.
    pub(super) fn candidates(&self, collection: &str, filter: &Value) -> Vec<(String, SharedDocument)> {
        match pinned_id(filter) {
            Some(id) => self
                .collection(collection)
                .get(&id)
                .map(|e| vec![(id.clone(), e.value().clone())])
                .unwrap_or_default(),
            None => self.snapshot(collection),
        }
    }

    /// True if `slot` is still the live document for `id` (not deleted or replaced).
    fn is_live(&self, collection: &str, id: &str, slot: &SharedDocument) -> bool {
        self.collection(collection)
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), slot))
    }

    /// Update the first document matching `filter`.
    ///
    /// The filter is evaluated and the update applied while holding the
    /// document's write lock, so no other write to that document can slip in
    /// between. With `upsert`, a miss inserts a document seeded from the
    /// filter's equality terms; if a document with the seeded `_id` already
    /// exists (and did not match), the insert fails with
    /// [`EngineError::DuplicateKey`].
    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        upsert: bool,
    ) -> Result<UpdateResult, EngineError> {
        let mut evaluated: HashSet<String> = HashSet::new();
        let mut retried = false;
        loop {
            for (id, slot) in self.candidates(collection, filter) {
                let mut guard = slot.write().await;
                if !self.is_live(collection, &id, &slot) {
                    continue;
                }
                let mut position = None;
                let as_value = Value::Object(guard.clone());
                if !matches(&as_value, filter, &mut position)? {
                    evaluated.insert(id);
                    continue;
                }
                let mut next = guard.clone();
                let modified = apply_update(&mut next, update, position)?;
                if modified {
                    let queued = self.persist_write(collection, &id, &next).await?;
                    let previous = std::mem::replace(&mut *guard, next);
                    if let Err(e) = queued.flushed().await {
                        *guard = previous;
                        return Err(e);
                    }
                }
                return Ok(UpdateResult {
                    matched: 1,
                    modified: u64::from(modified),
                    upserted_id: None,
                });
            }

            if !upsert {
                return Ok(UpdateResult::default());
            }

            let mut seed = Value::Object(Map::new());
            let mut terms = Vec::new();
            equality_terms(filter, &mut terms);
            for (path, value) in terms {
                set_path(&mut seed, &path_segments(&path, None)?, value)?;
            }
            let Value::Object(mut seed) = seed else {
                return Err(malformed("upsert seed is not a document"));
            };
            let id = match seed.get(ID_FIELD) {
                Some(Value::String(id)) => id.clone(),
                Some(_) => return Err(malformed("_id must be a string")),
                None => {
                    let id = generated_id();
                    seed.insert(ID_FIELD.into(), Value::String(id.clone()));
                    id
                }
            };
            apply_update(&mut seed, update, None)?;

            match self.insert_locked(collection, &id, seed).await {
                Ok(()) => {
                    return Ok(UpdateResult {
                        matched: 0,
                        modified: 0,
                        upserted_id: Some(id),
                    });
                }
                // A racing insert created the document after we looked: evaluate it once.
                Err(EngineError::DuplicateKey { .. }) if !retried && !evaluated.contains(&id) => {
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Insert through the vacant map entry, holding the new document's write
    /// lock until the WAL has it so no reader observes an unpersisted document.
    async fn insert_locked(&self, collection: &str, id: &str, doc: Document) -> Result<(), EngineError> {
        let coll = self.collection(collection);
        let slot: SharedDocument = Arc::new(RwLock::new(doc));
        let guard = slot.write().await;
        match coll.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::DuplicateKey {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
            }
        }
        let claim = Claim {
            collection: &coll,
            id,
            slot: &slot,
        };
        let queued = self.persist_write(collection, id, &guard).await?;
        std::mem::forget(claim);
        if let Err(e) = queued.flushed().await {
            coll.remove_if(id, |_, v| Arc::ptr_eq(v, &slot));
            return Err(e);
        }
        Ok(())
    }

    /// Delete every document matching `filter`. Operational and test use only.
    pub async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64, EngineError> {
        let coll = self.collection(collection);
        let mut deleted = 0;
        for (id, slot) in self.candidates(collection, filter) {
            let guard = slot.write().await;
            if !self.is_live(collection, &id, &slot) {
                continue;
            }
            if !matches(&Value::Object(guard.clone()), filter, &mut None)? {
                continue;
            }
            let queued = self.persist_delete(collection, &id).await?;
            coll.remove_if(&id, |_, v| Arc::ptr_eq(v, &slot));
            deleted += 1;
            if let Err(e) = queued.flushed().await {
                coll.entry(id).or_insert(slot.clone());
                return Err(e);
            }
        }
        Ok(deleted)
    }
}
