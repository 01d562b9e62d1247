use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};

/// Compact the engine's WAL if at least `threshold` appends happened since the
/// last compaction. Returns whether it compacted.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that periodically compacts the engine's WAL.
pub async fn run_compactor(engine: Arc<Engine>, every: Duration, threshold: u64) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        // a failed compaction leaves the old log in place; retry next tick
        if let Err(e) = maybe_compact(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn write_n(engine: &Engine, n: i64) {
        for i in 0..n {
            engine
                .update_one("cars", &json!({"_id": "VIN1"}), &json!({"$set": {"n": i}}), true)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(&path).unwrap();
        write_n(&engine, 3).await;

        assert!(!maybe_compact(&engine, 5).await.unwrap());
        assert!(!maybe_compact(&engine, 0).await.unwrap());
        write_n(&engine, 3).await;
        assert!(maybe_compact(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::open(&path).unwrap();
        let doc = engine.find_one("cars", &json!({}), None).await.unwrap().unwrap();
        assert_eq!(doc["n"], json!(2));
    }

    #[tokio::test]
    async fn background_loop_compacts() {
        let path = test_wal_path("loop.wal");
        let engine = Arc::new(Engine::open(&path).unwrap());
        write_n(&engine, 4).await;

        let task = tokio::spawn(run_compactor(engine.clone(), Duration::from_millis(10), 2));
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.wal_appends_since_compact().await == 0 {
                compacted = true;
                break;
            }
        }
        task.abort();
        assert!(compacted);
    }
}
