//! Embedded document engine.
//!
//! Documents are JSON objects grouped in named collections and keyed by a
//! unique string `_id`. Queries arrive in MongoDB operator syntax (see
//! [`crate::query::JsonDialect`]). Every write to a single document runs
//! under that document's write lock: the filter is evaluated, the update is
//! queued on the WAL, applied, and the lock is released only once the WAL
//! batch is on disk, with no other writer in between.
//!
//! A write whose future is dropped part way stays consistent: before the
//! WAL accepts the record nothing has changed, and after it the change is
//! applied in memory and will reach disk.

mod error;
pub(crate) mod matcher;
mod mutations;
mod pipeline;
mod queries;

pub use error::EngineError;
pub use mutations::UpdateResult;
pub use queries::FindSpec;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::Event;
use crate::wal::Wal;

pub type Document = Map<String, Value>;
pub type SharedDocument = Arc<RwLock<Document>>;
pub(crate) type Collection = DashMap<String, SharedDocument>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(wal.compact_in_place());
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// A WAL record accepted by the writer task.
pub(super) struct Queued(Option<oneshot::Receiver<io::Result<()>>>);

impl Queued {
    /// Wait for the batch holding this record to reach disk.
    pub(super) async fn flushed(self) -> Result<(), EngineError> {
        let Some(rx) = self.0 else {
            return Ok(());
        };
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}

pub struct Engine {
    collections: DashMap<String, Arc<Collection>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    wal_path: Option<PathBuf>,
}

impl Engine {
    /// Engine without persistence. State lives as long as the value.
    pub fn in_memory() -> Self {
        Self {
            collections: DashMap::new(),
            wal_tx: None,
            wal_path: None,
        }
    }

    /// Open a durable engine backed by the WAL at `wal_path`, replaying it first.
    /// Must be called inside a tokio runtime: the WAL writer runs as a task.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            collections: DashMap::new(),
            wal_tx: Some(wal_tx),
            wal_path: Some(wal_path.to_path_buf()),
        };

        // Replay: we are the sole owner of every Arc here, so try_write never contends.
        // Never use blocking_write: this may run inside an async context.
        let mut applied = 0usize;
        for event in events {
            match event {
                Event::DocumentWritten { collection, id, body } => {
                    let doc: Document = serde_json::from_str(&body).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("document {id}: {e}"))
                    })?;
                    let coll = engine.collection(&collection);
                    let existing = coll.get(&id).map(|e| e.value().clone());
                    match existing {
                        Some(slot) => match slot.try_write() {
                            Ok(mut guard) => *guard = doc,
                            Err(_) => return Err(io::Error::other("replay: contended document")),
                        },
                        None => {
                            coll.insert(id, Arc::new(RwLock::new(doc)));
                        }
                    }
                }
                Event::DocumentDeleted { collection, id } => {
                    engine.collection(&collection).remove(&id);
                }
            }
            applied += 1;
        }
        tracing::info!(path = %wal_path.display(), events = applied, "document engine replayed WAL");

        Ok(engine)
    }

    pub fn wal_path(&self) -> Option<&Path> {
        self.wal_path.as_deref()
    }

    pub(crate) fn collection(&self, name: &str) -> Arc<Collection> {
        if let Some(existing) = self.collections.get(name) {
            return existing.value().clone();
        }
        self.collections.entry(name.to_string()).or_default().clone()
    }

    /// Every `(id, document)` pair currently in the collection.
    /// No map guard is held once this returns, so callers may await on the locks.
    pub(crate) fn snapshot(&self, collection: &str) -> Vec<(String, SharedDocument)> {
        self.collection(collection)
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }

    /// Hand `event` to the group-commit writer.
    ///
    /// Once this returns the record is queued and will be written whether or
    /// not the caller keeps waiting; [`Queued::flushed`] reports the outcome.
    /// Cancelling before it returns queues nothing.
    async fn wal_enqueue(&self, event: Event) -> Result<Queued, EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(Queued(None));
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        Ok(Queued(Some(rx)))
    }

    pub(super) async fn persist_write(
        &self,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> Result<Queued, EngineError> {
        if self.wal_tx.is_none() {
            return Ok(Queued(None));
        }
        let body = serde_json::to_string(doc).map_err(|e| EngineError::WalError(e.to_string()))?;
        self.wal_enqueue(Event::DocumentWritten {
            collection: collection.to_string(),
            id: id.to_string(),
            body,
        })
        .await
    }

    pub(super) async fn persist_delete(&self, collection: &str, id: &str) -> Result<Queued, EngineError> {
        self.wal_enqueue(Event::DocumentDeleted {
            collection: collection.to_string(),
            id: id.to_string(),
        })
        .await
    }

    /// Rewrite the WAL with one record per live document.
    ///
    /// The writer task folds its own log, so appends queued behind the
    /// request land after the compacted records and nothing is lost.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
