//! The sync loop proper: connection lifecycle, debounced sends, snapshot
//! handling, reconnect with capped exponential backoff.
//!
//! One spawned task owns the socket end to end. The application talks to it
//! through [`SyncClient`]: `edit` replaces the local buffer, and server-side
//! changes come back as [`SyncEvent`]s.

use super::pending::PendingOps;
use super::{SyncConfig, SyncError, SyncEvent};
use crate::protocol::unix_millis;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

enum Command {
    Edit(String),
    RequestSnapshot,
    Shutdown,
}

#[derive(PartialEq)]
enum SessionEnd {
    Closed,
    Shutdown,
}

struct SendFailed;

/// Handle to a running sync loop for one document.
pub struct SyncClient {
    cmd_tx: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    task: JoinHandle<()>,
}

impl SyncClient {
    /// Spawn the loop. One socket at a time; a different document means a
    /// fresh client.
    pub fn spawn(config: SyncConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let task = tokio::spawn(run(config, cmd_rx, event_tx));
        Self {
            cmd_tx,
            event_rx: Some(event_rx),
            task,
        }
    }

    /// Replace the whole local buffer, as an editor does after a keystroke.
    /// The outbound send is debounced.
    pub async fn edit(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.cmd_tx
            .send(Command::Edit(text.into()))
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Ask the server for a fresh snapshot.
    pub async fn request_snapshot(&self) -> Result<(), SyncError> {
        self.cmd_tx
            .send(Command::RequestSnapshot)
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Take the event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Close the socket and stop the loop.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
    }
}

struct ClientState {
    buffer: String,
    server_version: u64,
    applying_remote: bool,
    pending: PendingOps,
    last_sent_op_id: Option<String>,
    sequence: u64,
    send_deadline: Option<Instant>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            server_version: 0,
            applying_remote: false,
            pending: PendingOps::new(),
            last_sent_op_id: None,
            sequence: 0,
            send_deadline: None,
        }
    }

    /// Replace the buffer. A local edit arms the debounce timer; an
    /// assignment under the applying-remote flag does not.
    fn set_text(&mut self, text: String, debounce: Duration) {
        self.buffer = text;
        if !self.applying_remote {
            self.send_deadline = Some(Instant::now() + debounce);
        }
    }

    fn apply_remote_text(&mut self, text: String, debounce: Duration) {
        self.applying_remote = true;
        self.set_text(text, debounce);
        self.applying_remote = false;
    }

    /// Build the next edit frame from the current buffer, recording it as
    /// last-sent and pending.
    fn build_edit_frame(&mut self, doc_id: &str) -> String {
        self.sequence += 1;
        let op_id = uuid::Uuid::new_v4().to_string();
        let frame = json!({
            "type": "edit",
            "opId": op_id,
            "docId": doc_id,
            "text": self.buffer,
            "version": self.server_version + 1,
            "timestamp": unix_millis(),
            "sequence": self.sequence,
        })
        .to_string();
        self.pending.push(op_id.clone(), frame.clone());
        self.last_sent_op_id = Some(op_id);
        frame
    }
}

fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let doublings = attempt.min(16);
    config
        .backoff_base
        .saturating_mul(1u32 << doublings)
        .min(config.backoff_cap)
}

fn snapshot_request_frame() -> String {
    json!({
        "type": "snapshot_request",
        "reqId": uuid::Uuid::new_v4().to_string(),
    })
    .to_string()
}

async fn run(
    config: SyncConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SyncEvent>,
) {
    let url = format!(
        "{}/ws?docId={}",
        config.server_url.trim_end_matches('/'),
        urlencoding::encode(&config.doc_id)
    );
    let mut state = ClientState::new();
    let mut attempt: u32 = 0;

    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                attempt = 0;
                info!(doc_id = %config.doc_id, "connected");
                let _ = event_tx.send(SyncEvent::Connected).await;
                let end = session(socket, &config, &mut state, &mut cmd_rx, &event_tx).await;
                let _ = event_tx.send(SyncEvent::Disconnected).await;
                if end == SessionEnd::Shutdown {
                    return;
                }
            }
            Err(e) => {
                debug!(doc_id = %config.doc_id, attempt, "connect failed: {}", e);
            }
        }

        let delay = backoff_delay(&config, attempt);
        attempt = attempt.saturating_add(1);
        debug!(?delay, "waiting before reconnect");
        if offline_wait(delay, &config, &mut state, &mut cmd_rx).await {
            return;
        }
    }
}

/// Drive one open socket until it closes or the client shuts down.
async fn session(
    socket: WsStream,
    config: &SyncConfig,
    state: &mut ClientState,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<SyncEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    if sink
        .send(Message::Text(snapshot_request_frame()))
        .await
        .is_err()
    {
        return SessionEnd::Closed;
    }

    let mut ping = interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // the first tick completes immediately

    // Pending ops replay only after the post-open snapshot is processed.
    let mut synced = false;

    loop {
        let debounce_armed = state.send_deadline.is_some();
        let debounce_at = state.send_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            _ = ping.tick() => {
                let frame = json!({"type": "ping", "ts": unix_millis()}).to_string();
                if sink.send(Message::Text(frame)).await.is_err() {
                    return SessionEnd::Closed;
                }
            }

            _ = sleep_until(debounce_at), if debounce_armed => {
                state.send_deadline = None;
                let frame = state.build_edit_frame(&config.doc_id);
                if sink.send(Message::Text(frame)).await.is_err() {
                    return SessionEnd::Closed;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Edit(text)) => state.set_text(text, config.debounce),
                Some(Command::RequestSnapshot) => {
                    if sink.send(Message::Text(snapshot_request_frame())).await.is_err() {
                        return SessionEnd::Closed;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },

            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(&text, config, state, event_tx, &mut synced, &mut sink)
                        .await
                        .is_err()
                    {
                        return SessionEnd::Closed;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(doc_id = %config.doc_id, "server closed connection");
                    return SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error: {}", e);
                    return SessionEnd::Closed;
                }
            },
        }
    }
}

/// Handle one inbound server frame.
async fn handle_frame(
    text: &str,
    config: &SyncConfig,
    state: &mut ClientState,
    event_tx: &mpsc::Sender<SyncEvent>,
    synced: &mut bool,
    sink: &mut WsSink,
) -> Result<(), SendFailed> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("dropping undecodable frame: {}", e);
            return Ok(());
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("op");

    match kind {
        "snapshot" => {
            let body = value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
            let server_id = value
                .get("serverId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            state.apply_remote_text(body.clone(), config.debounce);
            state.server_version = version;
            let _ = event_tx
                .send(SyncEvent::SnapshotApplied {
                    text: body,
                    version,
                    server_id,
                })
                .await;

            if !*synced {
                *synced = true;
                let frames: Vec<String> = state.pending.frames().map(str::to_owned).collect();
                if !frames.is_empty() {
                    info!(count = frames.len(), "replaying pending ops");
                }
                for frame in frames {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        return Err(SendFailed);
                    }
                }
            }
        }

        "op" | "edit" => {
            let op_id = value.get("opId").and_then(Value::as_str);
            let server_version = value
                .get("serverVersion")
                .and_then(Value::as_u64)
                .or_else(|| value.get("version").and_then(Value::as_u64));

            if let Some(op_id) = op_id {
                if state.pending.ack(op_id) {
                    // Confirmation echo: adopt the version, keep the buffer.
                    if let Some(version) = server_version {
                        state.server_version = state.server_version.max(version);
                    }
                    let _ = event_tx
                        .send(SyncEvent::Acked {
                            op_id: op_id.to_string(),
                            version: state.server_version,
                        })
                        .await;
                    return Ok(());
                }
            }

            match server_version {
                Some(version) if version > state.server_version => {
                    if let Some(body) = value.get("text").and_then(Value::as_str) {
                        state.apply_remote_text(body.to_string(), config.debounce);
                    }
                    state.server_version = version;
                    let _ = event_tx
                        .send(SyncEvent::RemoteEdit {
                            text: state.buffer.clone(),
                            version,
                        })
                        .await;
                }
                _ => debug!("ignoring op frame at or below local version"),
            }
        }

        "pong" => debug!("pong received"),

        other => debug!(kind = other, "ignoring frame"),
    }

    Ok(())
}

/// Wait out a backoff window while still absorbing local edits; frames that
/// debounce here stay in the pending queue for replay. Returns true on
/// shutdown.
async fn offline_wait(
    delay: Duration,
    config: &SyncConfig,
    state: &mut ClientState,
    cmd_rx: &mut mpsc::Receiver<Command>,
) -> bool {
    let reconnect_at = Instant::now() + delay;
    loop {
        let debounce_armed = state.send_deadline.is_some();
        let debounce_at = state.send_deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            _ = sleep_until(reconnect_at) => return false,

            _ = sleep_until(debounce_at), if debounce_armed => {
                state.send_deadline = None;
                // Not connected: the frame just joins the pending queue.
                let _ = state.build_edit_frame(&config.doc_id);
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Edit(text)) => state.set_text(text, config.debounce),
                Some(Command::RequestSnapshot) => {}
                Some(Command::Shutdown) | None => return true,
            },
        }
    }
}
