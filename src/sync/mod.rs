//! Client-side sync loop.
//!
//! Convergence depends on both sides of the wire, so the client loop is part
//! of the core: snapshot-on-open, debounced full-buffer sends, pending-op
//! replay, and reconnect with capped exponential backoff.

pub mod client;
pub mod pending;

pub use client::SyncClient;
pub use pending::PendingOps;

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync loop stopped")]
    Stopped,
}

/// Configuration for one sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Relay base URL, e.g. `ws://localhost:3000`.
    pub server_url: String,
    pub doc_id: String,
    /// Quiet period after the last local edit before a frame goes out.
    pub debounce: Duration,
    pub ping_interval: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_cap: Duration,
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id: doc_id.into(),
            debounce: Duration::from_millis(300),
            ping_interval: Duration::from_secs(20),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Socket opened and the snapshot request sent.
    Connected,
    /// Socket closed; the loop is backing off toward a reconnect.
    Disconnected,
    /// A snapshot replaced the local buffer.
    SnapshotApplied {
        text: String,
        version: u64,
        server_id: String,
    },
    /// A remote edit replaced the local buffer.
    RemoteEdit { text: String, version: u64 },
    /// The server echoed one of our ops.
    Acked { op_id: String, version: u64 },
}
