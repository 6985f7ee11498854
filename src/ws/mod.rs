//! WebSocket endpoint for the live edit channel.
//!
//! One route, `/ws?docId=<id>`: the query parameter pins the session to a
//! document for its whole lifetime. Connections without a docId are closed
//! with a rejection status before they ever touch a room.

pub mod connection;
pub mod handler;

use crate::broker::RelayBroker;
use crate::identity::ReplicaId;
use crate::room::RoomRegistry;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

/// Shared state for the WebSocket handlers.
#[derive(Clone)]
pub struct WsState {
    pub replica: ReplicaId,
    pub rooms: Arc<RoomRegistry>,
    pub broker: Arc<RelayBroker>,
}

/// Create the WebSocket router.
pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(handler::ws_handler))
        .with_state(state)
}
