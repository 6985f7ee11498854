//! docrelay: a horizontally scalable real-time collaborative edit relay.
//!
//! Clients attach to a document over `/ws?docId=<id>` and exchange full-text
//! edit frames. Each replica fans edits out to its local sessions, bridges
//! them to other replicas over the ops bus, and persists a last-write-wins
//! `{text, version}` snapshot that survives restarts. The [`sync`] module is
//! the other side of the wire: the reconnecting, debouncing client loop.

pub mod api;
pub mod broker;
pub mod cli;
pub mod identity;
pub mod persist;
pub mod protocol;
pub mod room;
pub mod store;
pub mod sync;
pub mod ws;

use axum::routing::get;
use axum::Router;
use broker::RelayBroker;
use identity::ReplicaId;
use persist::Persister;
use room::RoomRegistry;
use std::sync::Arc;
use std::time::Duration;
use store::RelayStore;
use tower_http::cors::CorsLayer;
use tracing::error;

/// How often idle rooms are evicted.
const EVICT_INTERVAL: Duration = Duration::from_secs(300);

async fn health_check() -> &'static str {
    "OK"
}

/// One replica's worth of relay state: the room registry, the bus broker and
/// the snapshot persistence pool, wired over a single store.
pub struct Relay {
    replica: ReplicaId,
    store: Arc<dyn RelayStore>,
    rooms: Arc<RoomRegistry>,
    broker: Arc<RelayBroker>,
    persister: Persister,
}

impl Relay {
    pub fn new(replica: ReplicaId, store: Arc<dyn RelayStore>) -> Self {
        let persister = Persister::spawn(store.clone());
        let rooms = Arc::new(RoomRegistry::new(
            replica.clone(),
            store.clone(),
            persister.handle(),
        ));
        let broker = Arc::new(RelayBroker::new(
            replica.clone(),
            store.clone(),
            rooms.clone(),
        ));
        Self {
            replica,
            store,
            rooms,
            broker,
            persister,
        }
    }

    /// Start the background halves: the store's bus event loop, the
    /// subscriber applying remote ops, and the idle-room eviction timer.
    pub fn spawn_background(&self) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.run().await {
                error!("store event loop failed: {}", e);
            }
        });

        let broker = self.broker.clone();
        tokio::spawn(async move { broker.run().await });

        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICT_INTERVAL);
            loop {
                tick.tick().await;
                rooms.evict_idle().await;
            }
        });
    }

    /// Build the serving router: `/ws`, `/api/:doc_id` and `/health`.
    pub fn router(&self) -> Router {
        let ws_state = ws::WsState {
            replica: self.replica.clone(),
            rooms: self.rooms.clone(),
            broker: self.broker.clone(),
        };
        Router::new()
            .route("/health", get(health_check))
            .merge(ws::router(ws_state))
            .merge(api::router(self.store.clone()))
            .layer(CorsLayer::permissive())
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Drain pending snapshot writes. Call after the listener stops.
    pub async fn shutdown(self) {
        self.persister.shutdown().await;
    }
}

/// Build a ready-to-serve router for one replica. The persistence pool
/// outlives the router; binaries that want a drain on shutdown hold a
/// [`Relay`] instead.
pub fn create_router(replica: ReplicaId, store: Arc<dyn RelayStore>) -> Router {
    let relay = Relay::new(replica, store);
    relay.spawn_background();
    relay.router()
}
