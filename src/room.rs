//! Per-document rooms: authoritative replica state and local fanout.
//!
//! A [`Room`] holds one document's `(text, version)` and the sessions
//! attached on this replica. One mutex guards every state transition and the
//! session set; fanout copies the session handles under the lock and queues
//! frames outside it, so the guard is never held across socket I/O.

use crate::identity::ReplicaId;
use crate::persist::PersistHandle;
use crate::protocol::{self, SnapshotFrame, SnapshotRecord};
use crate::store::RelayStore;
use crate::ws::connection::{SessionHandle, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

struct RoomState {
    text: String,
    version: u64,
    sessions: HashMap<SessionId, SessionHandle>,
}

/// The version assigned to an accepted client edit: always past the current
/// version, and never behind the version the client claims.
fn next_version(current: u64, incoming: Option<u64>) -> u64 {
    (current + 1).max(incoming.unwrap_or(0))
}

/// In-memory state and local fanout for one document.
pub struct Room {
    doc_id: String,
    replica: ReplicaId,
    state: Mutex<RoomState>,
    persist: PersistHandle,
}

impl Room {
    fn new(
        doc_id: String,
        replica: ReplicaId,
        seed: SnapshotRecord,
        persist: PersistHandle,
    ) -> Self {
        Self {
            doc_id,
            replica,
            state: Mutex::new(RoomState {
                text: seed.text,
                version: seed.version,
                sessions: HashMap::new(),
            }),
            persist,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Add a session and immediately queue a `snapshot` frame for it. The
    /// frame is queued under the guard so it precedes any later fanout.
    pub async fn attach(&self, handle: SessionHandle) {
        let mut state = self.state.lock().await;
        let frame = protocol::encode_frame(&SnapshotFrame::new(
            &self.doc_id,
            state.text.clone(),
            state.version,
            self.replica.as_str(),
        ));
        let delivered = handle.send_text(frame);
        state.sessions.insert(handle.id.clone(), handle);
        if !delivered {
            warn!(doc_id = %self.doc_id, "failed to queue initial snapshot");
        }
    }

    /// Remove a session. The room stays resident so a re-attach is cheap.
    pub async fn detach(&self, session_id: &SessionId) {
        self.state.lock().await.sessions.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Consistent copy of the current `(text, version)`.
    pub async fn snapshot(&self) -> SnapshotRecord {
        let state = self.state.lock().await;
        SnapshotRecord {
            text: state.text.clone(),
            version: state.version,
        }
    }

    /// Current state as a `snapshot` frame, for `snapshot_request` replies.
    pub async fn snapshot_frame(&self) -> String {
        let state = self.state.lock().await;
        protocol::encode_frame(&SnapshotFrame::new(
            &self.doc_id,
            state.text.clone(),
            state.version,
            self.replica.as_str(),
        ))
    }

    /// Apply a client edit and hand back the assigned version. A missing
    /// `text` keeps the current body; a stale claimed version is applied
    /// anyway (last write wins) but surfaced as a warning.
    pub async fn apply_local(&self, text: Option<String>, incoming_version: Option<u64>) -> u64 {
        let mut state = self.state.lock().await;
        let assigned = next_version(state.version, incoming_version);
        if let Some(incoming) = incoming_version {
            if incoming < state.version {
                warn!(
                    doc_id = %self.doc_id,
                    incoming,
                    current = state.version,
                    assigned,
                    "applying stale client op"
                );
            }
        }
        if let Some(text) = text {
            state.text = text;
        }
        state.version = assigned;
        let record = SnapshotRecord {
            text: state.text.clone(),
            version: assigned,
        };
        // Scheduled under the guard so persisted records cannot regress.
        self.persist.schedule(&self.doc_id, record).await;
        assigned
    }

    /// Apply an envelope from another replica and fan the prepared frame out
    /// to every local session. Stale envelopes are dropped.
    pub async fn apply_remote(
        &self,
        server_version: u64,
        text: Option<String>,
        frame: &str,
    ) -> bool {
        let mut state = self.state.lock().await;
        if server_version <= state.version {
            debug!(
                doc_id = %self.doc_id,
                server_version,
                current = state.version,
                "dropping stale remote op"
            );
            return false;
        }
        if let Some(text) = text {
            state.text = text;
        }
        state.version = server_version;
        let record = SnapshotRecord {
            text: state.text.clone(),
            version: server_version,
        };
        self.persist.schedule(&self.doc_id, record).await;
        let targets: Vec<SessionHandle> = state.sessions.values().cloned().collect();
        drop(state);

        for session in targets {
            if !session.send_text(frame) {
                warn!(doc_id = %self.doc_id, session_id = %session.id, "dropping frame, outbound queue unavailable");
            }
        }
        true
    }

    /// Queue a frame for local sessions, optionally skipping one.
    pub async fn fan_out(&self, frame: &str, except: Option<&SessionId>) {
        let targets: Vec<SessionHandle> = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .filter(|handle| except.map_or(true, |id| handle.id != *id))
                .cloned()
                .collect()
        };
        for session in targets {
            if !session.send_text(frame) {
                warn!(doc_id = %self.doc_id, session_id = %session.id, "dropping frame, outbound queue unavailable");
            }
        }
    }
}

/// The docId → [`Room`] registry for one replica.
pub struct RoomRegistry {
    replica: ReplicaId,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: Arc<dyn RelayStore>,
    persist: PersistHandle,
}

impl RoomRegistry {
    pub fn new(replica: ReplicaId, store: Arc<dyn RelayStore>, persist: PersistHandle) -> Self {
        Self {
            replica,
            rooms: RwLock::new(HashMap::new()),
            store,
            persist,
        }
    }

    /// Resident room, or a fresh one seeded from the snapshot store. The
    /// write lock is held across the load so concurrent first-accessors
    /// agree on a single instance.
    pub async fn get_or_load(&self, doc_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }

        let seed = match self.store.load_snapshot(doc_id).await {
            Ok(Some(record)) => {
                debug!(doc_id, version = record.version, "room seeded from snapshot");
                record
            }
            Ok(None) => SnapshotRecord::empty(),
            Err(e) => {
                // The next accepted update re-persists, so an empty seed is safe.
                warn!(doc_id, "snapshot load failed, seeding empty document: {}", e);
                SnapshotRecord::empty()
            }
        };

        let room = Arc::new(Room::new(
            doc_id.to_string(),
            self.replica.clone(),
            seed,
            self.persist.clone(),
        ));
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    /// Drop rooms with no attached sessions. The next open reloads from the
    /// store, so eviction never loses state.
    pub async fn evict_idle(&self) {
        let mut rooms = self.rooms.write().await;
        let mut idle = Vec::new();
        for (doc_id, room) in rooms.iter() {
            if room.session_count().await == 0 {
                idle.push(doc_id.clone());
            }
        }
        for doc_id in idle {
            debug!(doc_id = %doc_id, "evicting idle room");
            rooms.remove(&doc_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::Persister;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn registry(store: &MemoryStore) -> RoomRegistry {
        let store: Arc<dyn RelayStore> = Arc::new(store.clone());
        let persister = Persister::spawn(store.clone());
        RoomRegistry::new(ReplicaId::new("R1"), store, persister.handle())
    }

    fn session() -> (SessionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (SessionHandle::new(tx), rx)
    }

    #[test]
    fn test_next_version_arithmetic() {
        // Fresh doc, client claims the next version.
        assert_eq!(next_version(0, Some(1)), 1);
        // Unversioned edits just advance.
        assert_eq!(next_version(0, None), 1);
        assert_eq!(next_version(4, None), 5);
        // Stale claims never regress the counter.
        assert_eq!(next_version(5, Some(3)), 6);
        // A client ahead of us pulls the counter forward.
        assert_eq!(next_version(2, Some(9)), 9);
    }

    #[tokio::test]
    async fn test_apply_local_assigns_monotonic_versions() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        assert_eq!(room.apply_local(Some("a".to_string()), Some(1)).await, 1);
        assert_eq!(room.apply_local(Some("b".to_string()), Some(2)).await, 2);
        // Stale claim still applies, past the current version.
        assert_eq!(room.apply_local(Some("c".to_string()), Some(1)).await, 3);

        let snap = room.snapshot().await;
        assert_eq!(snap.text, "c");
        assert_eq!(snap.version, 3);
    }

    #[tokio::test]
    async fn test_apply_local_without_text_keeps_body() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        room.apply_local(Some("keep me".to_string()), None).await;
        room.apply_local(None, None).await;

        let snap = room.snapshot().await;
        assert_eq!(snap.text, "keep me");
        assert_eq!(snap.version, 2);
    }

    #[tokio::test]
    async fn test_apply_remote_rejects_stale_versions() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;
        room.apply_local(Some("final".to_string()), Some(7)).await;

        assert!(
            !room
                .apply_remote(5, Some("older".to_string()), "{}")
                .await
        );
        assert!(
            !room
                .apply_remote(7, Some("same".to_string()), "{}")
                .await
        );

        let snap = room.snapshot().await;
        assert_eq!(snap.text, "final");
        assert_eq!(snap.version, 7);
    }

    #[tokio::test]
    async fn test_apply_remote_accepts_newer_and_fans_out() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        let (handle, mut rx) = session();
        room.attach(handle).await;
        let _snapshot = rx.recv().await.unwrap();

        assert!(room.apply_remote(3, Some("remote".to_string()), "frame").await);
        assert_eq!(rx.recv().await.unwrap(), "frame");

        let snap = room.snapshot().await;
        assert_eq!(snap.text, "remote");
        assert_eq!(snap.version, 3);
    }

    #[tokio::test]
    async fn test_attach_pushes_current_snapshot() {
        let store = MemoryStore::new();
        store
            .put_snapshot(
                "d1",
                SnapshotRecord {
                    text: "restored".to_string(),
                    version: 42,
                },
            )
            .await;
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        let (handle, mut rx) = session();
        room.attach(handle).await;

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "snapshot");
        assert_eq!(frame["docId"], "d1");
        assert_eq!(frame["text"], "restored");
        assert_eq!(frame["version"], 42);
        assert_eq!(frame["serverId"], "R1");
    }

    #[tokio::test]
    async fn test_get_or_load_returns_single_instance() {
        let store = MemoryStore::new();
        let registry = registry(&store);

        let first = registry.get_or_load("d1").await;
        let second = registry.get_or_load("d1").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_empty_seed() {
        let store = MemoryStore::new();
        store
            .put_snapshot(
                "d1",
                SnapshotRecord {
                    text: "unreachable".to_string(),
                    version: 9,
                },
            )
            .await;
        store.fail_reads(true);

        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        let snap = room.snapshot().await;
        assert_eq!(snap.text, "");
        assert_eq!(snap.version, 0);
    }

    #[tokio::test]
    async fn test_fan_out_skips_excepted_session() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        let (sender, mut sender_rx) = session();
        let (other, mut other_rx) = session();
        let sender_id = sender.id.clone();
        room.attach(sender).await;
        room.attach(other).await;
        let _ = sender_rx.recv().await;
        let _ = other_rx.recv().await;

        room.fan_out("hello", Some(&sender_id)).await;

        assert_eq!(other_rx.recv().await.unwrap(), "hello");
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_evict_idle_drops_only_empty_rooms() {
        let store = MemoryStore::new();
        let registry = registry(&store);

        let idle = registry.get_or_load("idle").await;
        let busy = registry.get_or_load("busy").await;
        let (handle, _rx) = session();
        busy.attach(handle).await;

        registry.evict_idle().await;

        assert!(!Arc::ptr_eq(&idle, &registry.get_or_load("idle").await));
        assert!(Arc::ptr_eq(&busy, &registry.get_or_load("busy").await));
    }

    #[tokio::test]
    async fn test_detach_then_evict_reloads_from_store() {
        let store = MemoryStore::new();
        let registry = registry(&store);
        let room = registry.get_or_load("d1").await;

        let (handle, _rx) = session();
        let session_id = handle.id.clone();
        room.attach(handle).await;
        room.apply_local(Some("persisted".to_string()), None).await;
        room.detach(&session_id).await;

        // Give the persistence pool a moment to write the snapshot.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        registry.evict_idle().await;

        let reloaded = registry.get_or_load("d1").await;
        assert!(!Arc::ptr_eq(&room, &reloaded));
        assert_eq!(reloaded.snapshot().await.text, "persisted");
    }
}
