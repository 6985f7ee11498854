//! WebSocket session handling: upgrade, inbound dispatch, outbound
//! serialization.

use super::connection::{SessionHandle, OUTBOUND_QUEUE};
use super::WsState;
use crate::protocol::{self, Inbound, OpEnvelope, PongFrame};
use crate::room::Room;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::Uri;
use axum::response::IntoResponse;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle the WebSocket upgrade request.
///
/// The docId comes from the query extractor, falling back to a manual parse
/// of the raw query string for requests the extractor rejects.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    params: Option<Query<HashMap<String, String>>>,
    uri: Uri,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let doc_id = params
        .as_ref()
        .and_then(|Query(map)| map.get("docId"))
        .filter(|id| !id.is_empty())
        .cloned()
        .or_else(|| uri.query().and_then(doc_id_from_query));

    ws.on_upgrade(move |socket| handle_socket(socket, state, doc_id))
}

/// Pull a URL-decoded `docId` out of a raw query string.
fn doc_id_from_query(query: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "docId" {
                if let Ok(decoded) = urlencoding::decode(value) {
                    if !decoded.is_empty() {
                        return Some(decoded.into_owned());
                    }
                }
            }
        }
    }
    None
}

/// Drive one established socket until it closes or a write fails.
async fn handle_socket(mut socket: WebSocket, state: WsState, doc_id: Option<String>) {
    let Some(doc_id) = doc_id else {
        warn!("websocket connect without docId, rejecting");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::UNSUPPORTED,
                reason: "missing docId".into(),
            })))
            .await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let handle = SessionHandle::new(tx);
    let session_id = handle.id.clone();

    let room = state.rooms.get_or_load(&doc_id).await;
    // Attach queues the initial snapshot frame ahead of any fanout.
    room.attach(handle.clone()).await;
    info!(
        session_id = %session_id,
        doc_id = %doc_id,
        replica = %state.replica,
        "session attached"
    );

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    // A failed write is terminal for the session.
                    debug!(session_id = %session_id, "websocket send failed: {}", e);
                    break;
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&state, &room, &handle, &doc_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(session_id = %session_id, "client closed connection");
                        break;
                    }
                    // Protocol-level ping/pong is answered by axum.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, "websocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    room.detach(&session_id).await;
    info!(session_id = %session_id, doc_id = %doc_id, "session closed");
}

/// Dispatch one inbound text frame.
async fn dispatch(
    state: &WsState,
    room: &Arc<Room>,
    handle: &SessionHandle,
    doc_id: &str,
    text: &str,
) {
    let inbound = match protocol::parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(session_id = %handle.id, "dropping malformed frame: {}", e);
            return;
        }
    };

    match inbound {
        Inbound::Edit(op) => {
            let assigned = room.apply_local(op.text.clone(), op.version).await;
            let payload = Value::Object(op.raw);

            // Publish before the local fanout so bus order matches apply order.
            let envelope =
                OpEnvelope::new(state.replica.as_str(), doc_id, assigned, payload.clone());
            state.broker.publish(doc_id, &envelope).await;

            // Every local session gets the enhanced copy; the sender's copy
            // is its confirmation echo.
            let enhanced = protocol::enhance_op(&payload, state.replica.as_str(), assigned);
            room.fan_out(&protocol::encode_frame(&enhanced), None).await;
        }
        Inbound::Ping => {
            let pong = protocol::encode_frame(&PongFrame::new(state.replica.as_str()));
            if !handle.send_text(pong) {
                warn!(session_id = %handle.id, "failed to queue pong");
            }
        }
        Inbound::SnapshotRequest => {
            let frame = room.snapshot_frame().await;
            if !handle.send_text(frame) {
                warn!(session_id = %handle.id, "failed to queue snapshot reply");
            }
        }
        Inbound::Other(_) => {
            // Extension point: unknown types go verbatim to the doc's other
            // sessions, carrying no server semantics.
            room.fan_out(text, Some(&handle.id)).await;
        }
    }
}
