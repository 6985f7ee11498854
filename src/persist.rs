//! Asynchronous snapshot persistence.
//!
//! Every accepted update schedules a snapshot write. A fixed pool of workers
//! drains a latest-record-per-document map, so a write storm on one document
//! collapses to its newest record instead of queueing a write per update.

use crate::protocol::SnapshotRecord;
use crate::store::RelayStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of concurrent snapshot writers.
const WORKERS: usize = 4;

enum Token {
    Write(String),
    Shutdown,
}

/// Cheap handle for scheduling snapshot writes.
#[derive(Clone)]
pub struct PersistHandle {
    latest: Arc<Mutex<HashMap<String, SnapshotRecord>>>,
    token_tx: mpsc::UnboundedSender<Token>,
}

impl PersistHandle {
    /// Queue a snapshot write, replacing any not-yet-written record for the
    /// same document.
    pub async fn schedule(&self, doc_id: &str, record: SnapshotRecord) {
        let fresh = self
            .latest
            .lock()
            .await
            .insert(doc_id.to_string(), record)
            .is_none();
        if fresh {
            // One wake token per newly-dirty doc; coalescing bounds the queue.
            let _ = self.token_tx.send(Token::Write(doc_id.to_string()));
        }
    }
}

/// The bounded snapshot writer pool.
pub struct Persister {
    handle: PersistHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Persister {
    /// Start the worker pool against a store.
    pub fn spawn(store: Arc<dyn RelayStore>) -> Self {
        let latest = Arc::new(Mutex::new(HashMap::new()));
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let token_rx = Arc::new(Mutex::new(token_rx));

        let mut workers = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let latest = latest.clone();
            let token_rx = token_rx.clone();
            let store = store.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let token = { token_rx.lock().await.recv().await };
                    match token {
                        Some(Token::Write(doc_id)) => {
                            let record = latest.lock().await.remove(&doc_id);
                            if let Some(record) = record {
                                match store.save_snapshot(&doc_id, &record).await {
                                    Ok(()) => {
                                        debug!(
                                            doc_id = %doc_id,
                                            version = record.version,
                                            "snapshot persisted"
                                        );
                                    }
                                    Err(e) => {
                                        // The next accepted update reattempts.
                                        warn!(doc_id = %doc_id, "snapshot persist failed: {}", e);
                                    }
                                }
                            }
                        }
                        Some(Token::Shutdown) | None => break,
                    }
                }
            }));
        }

        Self {
            handle: PersistHandle { latest, token_tx },
            workers,
        }
    }

    pub fn handle(&self) -> PersistHandle {
        self.handle.clone()
    }

    /// Flush the latest pending snapshot per doc and stop the workers.
    /// Shutdown tokens queue behind all pending writes, so every dirty doc
    /// is written before the pool exits.
    pub async fn shutdown(self) {
        for _ in 0..self.workers.len() {
            let _ = self.handle.token_tx.send(Token::Shutdown);
        }
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(text: &str, version: u64) -> SnapshotRecord {
        SnapshotRecord {
            text: text.to_string(),
            version,
        }
    }

    #[tokio::test]
    async fn test_scheduled_snapshot_is_written() {
        let store = MemoryStore::new();
        let persister = Persister::spawn(Arc::new(store.clone()));

        persister.handle().schedule("d1", record("hi", 1)).await;
        persister.shutdown().await;

        assert_eq!(store.snapshot("d1").await, Some(record("hi", 1)));
    }

    #[tokio::test]
    async fn test_rapid_schedules_keep_newest_record() {
        let store = MemoryStore::new();
        let persister = Persister::spawn(Arc::new(store.clone()));
        let handle = persister.handle();

        for version in 1..=50 {
            handle
                .schedule("d1", record(&format!("v{}", version), version))
                .await;
        }
        persister.shutdown().await;

        assert_eq!(store.snapshot("d1").await, Some(record("v50", 50)));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_every_dirty_doc() {
        let store = MemoryStore::new();
        let persister = Persister::spawn(Arc::new(store.clone()));
        let handle = persister.handle();

        for doc in 0..20 {
            handle
                .schedule(&format!("doc-{}", doc), record("x", 1))
                .await;
        }
        persister.shutdown().await;

        for doc in 0..20 {
            assert!(store.snapshot(&format!("doc-{}", doc)).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_write_failure_does_not_stop_the_pool() {
        let store = MemoryStore::new();
        let persister = Persister::spawn(Arc::new(store.clone()));
        let handle = persister.handle();

        store.fail_writes(true);
        handle.schedule("d1", record("lost", 1)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.snapshot("d1").await, None);

        // The next accepted update reattempts and lands.
        store.fail_writes(false);
        handle.schedule("d1", record("second", 2)).await;
        persister.shutdown().await;

        assert_eq!(store.snapshot("d1").await, Some(record("second", 2)));
    }
}
