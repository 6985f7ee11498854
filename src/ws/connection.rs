//! Per-session state for WebSocket sessions.

use tokio::sync::mpsc;

/// Unique session id (server-generated UUID).
pub type SessionId = String;

/// Depth of each session's outbound frame queue.
pub const OUTBOUND_QUEUE: usize = 256;

/// Handle to one live session: its id plus the sender half of the bounded
/// outbound queue. The session's own socket loop drains the queue, so
/// writes to one socket are serialized by construction.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    sender: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
        }
    }

    /// Queue a text frame without blocking. Returns false when the queue is
    /// full or the session is gone; the caller drops the frame either way.
    pub fn send_text(&self, frame: impl Into<String>) -> bool {
        self.sender.try_send(frame.into()).is_ok()
    }
}
