//! Document store port.
//!
//! The repository speaks only the query algebra; a [`DocumentStore`] renders
//! it for a backend and executes it. [`EngineStore`] runs against the embedded
//! engine, [`RecordingStore`] records the calls and answers from a script.

mod engine_store;
mod recording;

pub use engine_store::EngineStore;
pub use recording::{RecordedCall, RecordingStore};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::query::{Filter, Pipeline, Projection, Sort, Update};

/// A stored document: a JSON object with an `_id`.
pub type Document = Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Sort>,
    pub projection: Option<Projection>,
    /// Zero or `None` returns every match.
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn projected(projection: Projection) -> Self {
        Self {
            projection: Some(projection),
            ..Self::default()
        }
    }
}

/// Whether a conditional update inserts a document when nothing matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Yes,
    No,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Identity of the document the upsert created, if it created one.
    pub upserted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An insert collided with an existing identity. Callers decide what that means.
    DuplicateKey { collection: String, key: String },
    Timeout { operation: &'static str, after: Duration },
    /// The backend could not serve the call (I/O, persistence, shutdown).
    Unavailable(String),
    /// The backend rejected the query itself.
    Query(String),
    /// A returned document did not have the expected shape.
    Decode(String),
    /// A value could not be turned into a document to write.
    Encode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateKey { collection, key } => {
                write!(f, "duplicate key in {collection}: {key}")
            }
            StoreError::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}ms", after.as_millis())
            }
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Query(e) => write!(f, "query rejected: {e}"),
            StoreError::Decode(e) => write!(f, "decode error: {e}"),
            StoreError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, StoreError>;

    /// Update the first document matching `filter`, atomically with the match.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: Upsert,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError>;
}
