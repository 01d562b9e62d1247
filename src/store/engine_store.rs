use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::Config;
use crate::engine::{Engine, EngineError, FindSpec};
use crate::observability::{STORE_ERRORS_TOTAL, STORE_OP_DURATION_SECONDS};
use crate::query::{Dialect, Filter, JsonDialect, Pipeline, Projection, Update};

use super::{Document, DocumentStore, FindOptions, StoreError, UpdateOutcome, Upsert};

/// [`DocumentStore`] backed by the embedded document engine.
pub struct EngineStore {
    engine: Arc<Engine>,
    dialect: JsonDialect,
    timeout: Duration,
}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::DuplicateKey { collection, id } => StoreError::DuplicateKey { collection, key: id },
            EngineError::MalformedQuery(msg) => StoreError::Query(msg),
            EngineError::WalError(msg) => StoreError::Unavailable(msg),
        }
    }
}

impl EngineStore {
    pub fn new(engine: Arc<Engine>, config: &Config) -> Self {
        Self {
            engine,
            dialect: JsonDialect,
            timeout: config.store_timeout,
        }
    }

    /// Open the engine `config` describes: durable under `data_dir`, in memory without one.
    pub fn open(config: &Config) -> io::Result<Self> {
        let engine = match config.wal_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                Engine::open(&path)?
            }
            None => Engine::in_memory(),
        };
        Ok(Self::new(Arc::new(engine), config))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run one engine call on its own task and wait at most the store
    /// timeout for it, recording latency and failures. The task runs to
    /// completion even when the caller stops waiting, so a write that timed
    /// out may still land but is never left half applied.
    async fn timed<T, F>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, tokio::spawn(call)).await {
            Ok(Ok(r)) => r.map_err(StoreError::from),
            Ok(Err(e)) => Err(StoreError::Unavailable(format!("{operation} task failed: {e}"))),
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.timeout,
            }),
        };
        metrics::histogram!(STORE_OP_DURATION_SECONDS, "op" => operation).record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::counter!(STORE_ERRORS_TOTAL, "op" => operation).increment(1);
            match e {
                StoreError::DuplicateKey { .. } => {}
                other => tracing::warn!(op = operation, error = %other, "document store call failed"),
            }
        }
        result
    }
}

#[async_trait]
impl DocumentStore for EngineStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let filter = self.dialect.render_filter(filter);
        let spec = FindSpec {
            sort: options.sort.as_ref().map(|s| self.dialect.render_sort(s)),
            projection: options.projection.as_ref().map(|p| self.dialect.render_projection(p)),
            limit: options.limit,
        };
        let (engine, collection) = (self.engine.clone(), collection.to_string());
        self.timed("find", async move { engine.find(&collection, &filter, &spec).await })
            .await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&Projection>,
    ) -> Result<Option<Document>, StoreError> {
        let filter = self.dialect.render_filter(filter);
        let projection = projection.map(|p| self.dialect.render_projection(p));
        let (engine, collection) = (self.engine.clone(), collection.to_string());
        self.timed("find_one", async move {
            engine.find_one(&collection, &filter, projection.as_ref()).await
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: Upsert,
    ) -> Result<UpdateOutcome, StoreError> {
        let filter = self.dialect.render_filter(filter);
        let update = self.dialect.render_update(update);
        let (engine, collection) = (self.engine.clone(), collection.to_string());
        let upsert = upsert == Upsert::Yes;
        let result = self
            .timed("update_one", async move {
                engine.update_one(&collection, &filter, &update, upsert).await
            })
            .await?;
        Ok(UpdateOutcome {
            matched: result.matched,
            modified: result.modified,
            upserted_id: result.upserted_id,
        })
    }

    async fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        let pipeline = self.dialect.render_pipeline(pipeline);
        let (engine, collection) = (self.engine.clone(), collection.to_string());
        self.timed("aggregate", async move { engine.aggregate(&collection, &pipeline).await })
            .await
    }
}
