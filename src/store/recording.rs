use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::query::{Dialect, Filter, Pipeline, Projection, PseudoDialect, Update};

use super::{Document, DocumentStore, FindOptions, StoreError, UpdateOutcome, Upsert};

/// One call a [`RecordingStore`] received, with the algebra values it was given
/// and their [`PseudoDialect`] rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Find {
        collection: String,
        filter: Filter,
        options: FindOptions,
        rendered: String,
    },
    FindOne {
        collection: String,
        filter: Filter,
        projection: Option<Projection>,
        rendered: String,
    },
    UpdateOne {
        collection: String,
        filter: Filter,
        update: Update,
        upsert: Upsert,
        rendered: String,
    },
    Aggregate {
        collection: String,
        pipeline: Pipeline,
        rendered: String,
    },
}

impl RecordedCall {
    pub fn rendered(&self) -> &str {
        match self {
            RecordedCall::Find { rendered, .. }
            | RecordedCall::FindOne { rendered, .. }
            | RecordedCall::UpdateOne { rendered, .. }
            | RecordedCall::Aggregate { rendered, .. } => rendered,
        }
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<RecordedCall>,
    find: VecDeque<Result<Vec<Document>, StoreError>>,
    find_one: VecDeque<Result<Option<Document>, StoreError>>,
    update_one: VecDeque<Result<UpdateOutcome, StoreError>>,
    aggregate: VecDeque<Result<Vec<Document>, StoreError>>,
}

/// Store that executes nothing. It records every call and answers from
/// per-operation FIFO scripts; with an empty script it returns no documents,
/// or a single-match outcome for updates.
#[derive(Default)]
pub struct RecordingStore {
    dialect: PseudoDialect,
    script: Mutex<Script>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_find(&self, result: Result<Vec<Document>, StoreError>) {
        self.script().find.push_back(result);
    }

    pub fn push_find_one(&self, result: Result<Option<Document>, StoreError>) {
        self.script().find_one.push_back(result);
    }

    pub fn push_update_one(&self, result: Result<UpdateOutcome, StoreError>) {
        self.script().update_one.push_back(result);
    }

    pub fn push_aggregate(&self, result: Result<Vec<Document>, StoreError>) {
        self.script().aggregate.push_back(result);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script().calls.clone()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.script().calls.last().cloned()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let mut parts = vec![self.dialect.render_filter(filter)];
        if let Some(sort) = &options.sort {
            parts.push(self.dialect.render_sort(sort));
        }
        if let Some(projection) = &options.projection {
            parts.push(self.dialect.render_projection(projection));
        }
        if let Some(limit) = options.limit {
            parts.push(format!("limit({limit})"));
        }
        let mut script = self.script();
        script.calls.push(RecordedCall::Find {
            collection: collection.to_string(),
            filter: filter.clone(),
            options: options.clone(),
            rendered: format!("find({collection}, {})", parts.join(", ")),
        });
        script.find.pop_front().unwrap_or(Ok(Vec::new()))
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, StoreError> {
        let mut parts = vec![self.dialect.render_filter(filter)];
        if let Some(projection) = projection {
            parts.push(self.dialect.render_projection(projection));
        }
        let mut script = self.script();
        script.calls.push(RecordedCall::FindOne {
            collection: collection.to_string(),
            filter: filter.clone(),
            projection: projection.cloned(),
            rendered: format!("find_one({collection}, {})", parts.join(", ")),
        });
        script.find_one.pop_front().unwrap_or(Ok(None))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: Upsert,
    ) -> Result<UpdateOutcome, StoreError> {
        let rendered = format!(
            "update_one({collection}, {}, {}{})",
            self.dialect.render_filter(filter),
            self.dialect.render_update(update),
            if upsert == Upsert::Yes { ", upsert" } else { "" },
        );
        let mut script = self.script();
        script.calls.push(RecordedCall::UpdateOne {
            collection: collection.to_string(),
            filter: filter.clone(),
            update: update.clone(),
            upsert,
            rendered,
        });
        script.update_one.pop_front().unwrap_or(Ok(UpdateOutcome {
            matched: 1,
            modified: 1,
            upserted_id: None,
        }))
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        let mut script = self.script();
        script.calls.push(RecordedCall::Aggregate {
            collection: collection.to_string(),
            pipeline: pipeline.clone(),
            rendered: format!("aggregate({collection}, {})", self.dialect.render_pipeline(pipeline)),
        });
        script.aggregate.pop_front().unwrap_or(Ok(Vec::new()))
    }
}
