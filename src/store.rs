//! Snapshot store and ops bus clients.
//!
//! The relay leans on one external key-value store for both of its
//! cross-replica concerns: persisted `{text, version}` snapshots under
//! `doc:<docId>:snapshot`, and the op envelope bus on `doc:<docId>:ops`
//! channels. [`RelayStore`] is the thin seam over that store; [`RedisStore`]
//! is the production client and [`MemoryStore`] the in-process double that
//! tests also use as a shared bus between replicas.

use crate::protocol::{ops_channel, snapshot_key, SnapshotRecord, OPS_PATTERN};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Delay before retrying a failed pub/sub connection.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Errors from store and bus operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message received on the ops bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Seam over the external key-value store and its pub/sub bus.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Read the persisted snapshot for a document, if any.
    async fn load_snapshot(&self, doc_id: &str) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Persist a snapshot, replacing any previous record.
    async fn save_snapshot(&self, doc_id: &str, record: &SnapshotRecord) -> Result<(), StoreError>;

    /// Publish an envelope on the document's ops channel.
    async fn publish(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Receiver for everything arriving on the ops channels.
    fn subscribe_messages(&self) -> broadcast::Receiver<BusMessage>;

    /// Background event loop feeding [`RelayStore::subscribe_messages`].
    /// Spawned once per process.
    async fn run(&self) -> Result<(), StoreError>;
}

/// Redis-backed store: snapshots via GET/SET, bus via PUBLISH/PSUBSCRIBE.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    message_tx: broadcast::Sender<BusMessage>,
}

impl RedisStore {
    /// Connect to Redis and prepare the command connection. The pub/sub
    /// connection is owned by [`RelayStore::run`].
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let (message_tx, _) = broadcast::channel(1024);

        info!(url, "connected to redis");

        Ok(Self {
            client,
            conn,
            message_tx,
        })
    }
}

#[async_trait]
impl RelayStore for RedisStore {
    async fn load_snapshot(&self, doc_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(snapshot_key(doc_id))
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, doc_id: &str, record: &SnapshotRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(snapshot_key(doc_id), json)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    async fn publish(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(ops_channel(doc_id), payload)
            .await
            .map_err(|e| StoreError::Publish(e.to_string()))
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<BusMessage> {
        self.message_tx.subscribe()
    }

    async fn run(&self) -> Result<(), StoreError> {
        loop {
            let mut pubsub = match self.client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    warn!("pub/sub connection failed: {}", e);
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    continue;
                }
            };
            if let Err(e) = pubsub.psubscribe(OPS_PATTERN).await {
                warn!("psubscribe failed: {}", e);
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
            info!(pattern = OPS_PATTERN, "subscribed to ops channels");

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, "undecodable bus payload: {}", e);
                        continue;
                    }
                };
                debug!(channel = %channel, bytes = payload.len(), "bus message");
                // Send errors just mean no subscriber yet.
                let _ = self.message_tx.send(BusMessage { channel, payload });
            }

            warn!("pub/sub stream ended, resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }
}

/// In-memory store and bus.
///
/// Stands in for Redis in tests. Clones share state, so two routers built
/// over one instance behave like two replicas joined by a common bus and
/// snapshot store.
#[derive(Clone)]
pub struct MemoryStore {
    snapshots: Arc<Mutex<HashMap<String, SnapshotRecord>>>,
    message_tx: broadcast::Sender<BusMessage>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (message_tx, _) = broadcast::channel(1024);
        Self {
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            message_tx,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent snapshot reads fail, for exercising the degraded
    /// cold-load path.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent snapshot writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current persisted snapshot, bypassing the failure flag.
    pub async fn snapshot(&self, doc_id: &str) -> Option<SnapshotRecord> {
        self.snapshots.lock().await.get(doc_id).cloned()
    }

    /// Seed a snapshot directly, as if a previous replica had persisted it.
    pub async fn put_snapshot(&self, doc_id: &str, record: SnapshotRecord) {
        self.snapshots
            .lock()
            .await
            .insert(doc_id.to_string(), record);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn load_snapshot(&self, doc_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Read("injected read failure".to_string()));
        }
        Ok(self.snapshots.lock().await.get(doc_id).cloned())
    }

    async fn save_snapshot(&self, doc_id: &str, record: &SnapshotRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("injected write failure".to_string()));
        }
        self.snapshots
            .lock()
            .await
            .insert(doc_id.to_string(), record.clone());
        Ok(())
    }

    async fn publish(&self, doc_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        let _ = self.message_tx.send(BusMessage {
            channel: ops_channel(doc_id),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<BusMessage> {
        self.message_tx.subscribe()
    }

    async fn run(&self) -> Result<(), StoreError> {
        // Publishes feed subscribers directly; nothing to pump.
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_snapshot_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_snapshot("d1").await.unwrap(), None);

        let record = SnapshotRecord {
            text: "hi".to_string(),
            version: 3,
        };
        store.save_snapshot("d1", &record).await.unwrap();
        assert_eq!(store.load_snapshot("d1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_memory_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_messages();

        store.publish("d1", b"payload").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "doc:d1:ops");
        assert_eq!(msg.payload, b"payload");
    }

    #[tokio::test]
    async fn test_memory_clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();

        let record = SnapshotRecord {
            text: "shared".to_string(),
            version: 1,
        };
        store.save_snapshot("d1", &record).await.unwrap();
        assert_eq!(clone.load_snapshot("d1").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_memory_injected_read_failure() {
        let store = MemoryStore::new();
        store.fail_reads(true);
        assert!(store.load_snapshot("d1").await.is_err());

        store.fail_reads(false);
        assert!(store.load_snapshot("d1").await.is_ok());
    }
}
