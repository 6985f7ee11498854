//! Cross-replica relay: publish local ops, apply remote ones.
//!
//! Each replica runs a single subscriber over the `doc:*:ops` pattern.
//! Envelopes carry the origin replica id, so the subscriber drops the echo
//! of its own publishes; everything else goes through the room's version
//! check and fans out to local sessions.

use crate::identity::ReplicaId;
use crate::protocol::{self, OpEnvelope};
use crate::room::RoomRegistry;
use crate::store::{BusMessage, RelayStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub struct RelayBroker {
    replica: ReplicaId,
    store: Arc<dyn RelayStore>,
    rooms: Arc<RoomRegistry>,
}

impl RelayBroker {
    pub fn new(replica: ReplicaId, store: Arc<dyn RelayStore>, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            replica,
            store,
            rooms,
        }
    }

    /// Publish an envelope on the document's ops channel. Failures are
    /// logged and swallowed: the local fanout already happened and the
    /// snapshot is being persisted, so other replicas reconverge later.
    pub async fn publish(&self, doc_id: &str, envelope: &OpEnvelope) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(doc_id, "failed to serialize envelope: {}", e);
                return;
            }
        };
        match self.store.publish(doc_id, &payload).await {
            Ok(()) => debug!(
                doc_id,
                server_version = envelope.server_version,
                "published op envelope"
            ),
            Err(e) => warn!(doc_id, "bus publish failed: {}", e),
        }
    }

    /// Consume the bus subscription until it closes. Spawned once at
    /// process start.
    pub async fn run(&self) {
        let mut rx = self.store.subscribe_messages();
        loop {
            match rx.recv().await {
                Ok(msg) => self.handle_message(&msg).await,
                Err(RecvError::Lagged(n)) => {
                    warn!("ops subscriber lagged by {} messages", n);
                }
                Err(RecvError::Closed) => {
                    info!("ops bus closed, stopping subscriber");
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, msg: &BusMessage) {
        let envelope: OpEnvelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %msg.channel, "dropping undecodable envelope: {}", e);
                return;
            }
        };

        if envelope.server_id == self.replica.as_str() {
            debug!(channel = %msg.channel, "ignoring own echo");
            return;
        }

        let doc_id = match protocol::doc_id_from_channel(&msg.channel) {
            Some(doc_id) => doc_id.to_string(),
            None if !envelope.doc_id.is_empty() => envelope.doc_id.clone(),
            None => {
                warn!(channel = %msg.channel, "cannot determine doc id for envelope");
                return;
            }
        };

        let text = envelope
            .payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let enhanced = protocol::enhance_op(
            &envelope.payload,
            &envelope.server_id,
            envelope.server_version,
        );
        let frame = protocol::encode_frame(&enhanced);

        let room = self.rooms.get_or_load(&doc_id).await;
        room.apply_remote(envelope.server_version, text, &frame)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::Persister;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn broker_over(store: &MemoryStore, replica: &str) -> (Arc<RelayBroker>, Arc<RoomRegistry>) {
        let store: Arc<dyn RelayStore> = Arc::new(store.clone());
        let persister = Persister::spawn(store.clone());
        let rooms = Arc::new(RoomRegistry::new(
            ReplicaId::new(replica),
            store.clone(),
            persister.handle(),
        ));
        let broker = Arc::new(RelayBroker::new(
            ReplicaId::new(replica),
            store,
            rooms.clone(),
        ));
        (broker, rooms)
    }

    fn spawn_subscriber(broker: &Arc<RelayBroker>) {
        let broker = broker.clone();
        tokio::spawn(async move { broker.run().await });
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_remote_envelope_applies_to_room() {
        let store = MemoryStore::new();
        let (broker, rooms) = broker_over(&store, "R1");
        spawn_subscriber(&broker);
        settle().await;

        let envelope = OpEnvelope::new("R2", "d1", 3, json!({"text":"from R2"}));
        store
            .publish("d1", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
        settle().await;

        let snap = rooms.get_or_load("d1").await.snapshot().await;
        assert_eq!(snap.text, "from R2");
        assert_eq!(snap.version, 3);
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let store = MemoryStore::new();
        let (broker, rooms) = broker_over(&store, "R1");
        spawn_subscriber(&broker);
        settle().await;

        let envelope = OpEnvelope::new("R1", "d1", 9, json!({"text":"echo"}));
        store
            .publish("d1", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
        settle().await;

        let snap = rooms.get_or_load("d1").await.snapshot().await;
        assert_eq!(snap.text, "");
        assert_eq!(snap.version, 0);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_dropped() {
        let store = MemoryStore::new();
        let (broker, rooms) = broker_over(&store, "R1");
        spawn_subscriber(&broker);
        settle().await;

        store.publish("d1", b"not json").await.unwrap();
        // A good envelope after the bad one still lands.
        let envelope = OpEnvelope::new("R2", "d1", 1, json!({"text":"ok"}));
        store
            .publish("d1", &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
        settle().await;

        let snap = rooms.get_or_load("d1").await.snapshot().await;
        assert_eq!(snap.text, "ok");
    }

    #[tokio::test]
    async fn test_doc_id_falls_back_to_envelope() {
        let store = MemoryStore::new();
        let (broker, rooms) = broker_over(&store, "R1");

        // Hand a message with an unparseable channel straight to the broker.
        let envelope = OpEnvelope::new("R2", "d1", 2, json!({"text":"fallback"}));
        broker
            .handle_message(&BusMessage {
                channel: "something-else".to_string(),
                payload: serde_json::to_vec(&envelope).unwrap(),
            })
            .await;

        let snap = rooms.get_or_load("d1").await.snapshot().await;
        assert_eq!(snap.text, "fallback");
        assert_eq!(snap.version, 2);
    }
}
