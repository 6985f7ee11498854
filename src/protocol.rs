//! Wire protocol for the edit relay.
//!
//! Every frame is a UTF-8 JSON object. Frames the server merely relays are
//! kept as raw JSON maps so unknown fields survive the trip unchanged; frames
//! the server authors itself are typed structs.
//!
//! Also defines the store key and bus channel naming shared by every replica:
//! - `doc:<docId>:snapshot` holds the persisted `{text, version}` record
//! - `doc:<docId>:ops` carries op envelopes between replicas
//! - subscribers use the pattern `doc:*:ops`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Subscribe pattern covering every document's ops channel.
pub const OPS_PATTERN: &str = "doc:*:ops";

/// Pub/sub channel carrying op envelopes for one document.
pub fn ops_channel(doc_id: &str) -> String {
    format!("doc:{}:ops", doc_id)
}

/// Store key holding the persisted snapshot for one document.
pub fn snapshot_key(doc_id: &str) -> String {
    format!("doc:{}:snapshot", doc_id)
}

/// Derive the document id from an ops channel name.
pub fn doc_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("doc:")
        .and_then(|rest| rest.strip_suffix(":ops"))
        .filter(|doc_id| !doc_id.is_empty())
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Errors from parsing inbound frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted form of a document, and the body of `snapshot` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub text: String,
    pub version: u64,
}

impl SnapshotRecord {
    /// State of a document nobody has written yet.
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            version: 0,
        }
    }
}

/// `snapshot` frame pushed to a session on attach and on `snapshot_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub doc_id: String,
    pub text: String,
    pub version: u64,
    pub server_id: String,
}

impl SnapshotFrame {
    pub fn new(
        doc_id: impl Into<String>,
        text: impl Into<String>,
        version: u64,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: "snapshot".to_string(),
            doc_id: doc_id.into(),
            text: text.into(),
            version,
            server_id: server_id.into(),
        }
    }
}

/// `pong` reply to a client-originated `ping`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub server_id: String,
    pub timestamp: u64,
}

impl PongFrame {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            kind: "pong".to_string(),
            server_id: server_id.into(),
            timestamp: unix_millis(),
        }
    }
}

/// The unit published on the ops bus: the client's op verbatim, wrapped with
/// the origin replica and the server-assigned version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpEnvelope {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub doc_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub server_version: u64,
    pub payload: Value,
}

impl OpEnvelope {
    pub fn new(
        server_id: impl Into<String>,
        doc_id: impl Into<String>,
        server_version: u64,
        payload: Value,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            doc_id: doc_id.into(),
            kind: "op".to_string(),
            server_version,
            payload,
        }
    }
}

/// A parsed client op (`type` of `op` or `edit`).
///
/// `raw` is the whole inbound object; it travels verbatim in the envelope
/// payload and in the enhanced local fanout copy.
#[derive(Debug, Clone)]
pub struct EditOp {
    pub op_id: Option<String>,
    pub text: Option<String>,
    /// Client's claimed next version; absent or negative means unversioned.
    pub version: Option<u64>,
    pub raw: Map<String, Value>,
}

/// An inbound client frame, dispatched on its `type` field (default `op`).
#[derive(Debug)]
pub enum Inbound {
    Edit(EditOp),
    Ping,
    SnapshotRequest,
    /// Unrecognized type; rebroadcast verbatim to the doc's other sessions.
    Other(Map<String, Value>),
}

/// Parse an inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    let kind = map.get("type").and_then(Value::as_str).unwrap_or("op");
    match kind {
        "op" | "edit" => {
            let op_id = map.get("opId").and_then(Value::as_str).map(str::to_owned);
            let text = map.get("text").and_then(Value::as_str).map(str::to_owned);
            let version = map
                .get("version")
                .and_then(Value::as_i64)
                .filter(|v| *v >= 0)
                .map(|v| v as u64);
            Ok(Inbound::Edit(EditOp {
                op_id,
                text,
                version,
                raw: map,
            }))
        }
        "ping" => Ok(Inbound::Ping),
        "snapshot_request" => Ok(Inbound::SnapshotRequest),
        _ => Ok(Inbound::Other(map)),
    }
}

/// Copy of a client op enhanced for fanout: the authoritative `serverId` and
/// `serverVersion` overwrite any client-supplied fields of the same name.
pub fn enhance_op(payload: &Value, server_id: &str, server_version: u64) -> Value {
    let mut map = payload.as_object().cloned().unwrap_or_default();
    map.insert("serverId".to_string(), Value::String(server_id.to_owned()));
    map.insert(
        "serverVersion".to_string(),
        Value::Number(server_version.into()),
    );
    Value::Object(map)
}

/// Serialize a server-authored frame to its wire form. Our frame types have
/// no fallible fields, so serialization errors collapse to an empty string
/// rather than a panic.
pub fn encode_frame<T: Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_and_key_names() {
        assert_eq!(ops_channel("d1"), "doc:d1:ops");
        assert_eq!(snapshot_key("d1"), "doc:d1:snapshot");
    }

    #[test]
    fn test_doc_id_from_channel() {
        assert_eq!(doc_id_from_channel("doc:d1:ops"), Some("d1"));
        assert_eq!(doc_id_from_channel("doc:a:b:ops"), Some("a:b"));
        assert_eq!(doc_id_from_channel("doc::ops"), None);
        assert_eq!(doc_id_from_channel("other:d1:ops"), None);
        assert_eq!(doc_id_from_channel("doc:d1:snapshot"), None);
    }

    #[test]
    fn test_parse_edit() {
        let frame = r#"{"type":"edit","opId":"o1","docId":"d1","text":"hi","version":3}"#;
        match parse_inbound(frame).unwrap() {
            Inbound::Edit(op) => {
                assert_eq!(op.op_id.as_deref(), Some("o1"));
                assert_eq!(op.text.as_deref(), Some("hi"));
                assert_eq!(op.version, Some(3));
                assert_eq!(op.raw.get("docId"), Some(&json!("d1")));
            }
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_defaults_to_op() {
        let frame = r#"{"text":"hi"}"#;
        assert!(matches!(parse_inbound(frame).unwrap(), Inbound::Edit(_)));
    }

    #[test]
    fn test_parse_negative_version_is_unversioned() {
        let frame = r#"{"type":"op","text":"hi","version":-1}"#;
        match parse_inbound(frame).unwrap() {
            Inbound::Edit(op) => assert_eq!(op.version, None),
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_and_snapshot_request() {
        assert!(matches!(
            parse_inbound(r#"{"type":"ping","ts":1}"#).unwrap(),
            Inbound::Ping
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":"snapshot_request","reqId":"r1"}"#).unwrap(),
            Inbound::SnapshotRequest
        ));
    }

    #[test]
    fn test_parse_unknown_type() {
        match parse_inbound(r#"{"type":"cursor","x":5}"#).unwrap() {
            Inbound::Other(map) => assert_eq!(map.get("x"), Some(&json!(5))),
            other => panic!("expected other, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse_inbound("[1,2]").is_err());
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn test_enhance_overwrites_client_fields() {
        let payload = json!({"type":"edit","text":"hi","serverId":"spoofed","serverVersion":99});
        let enhanced = enhance_op(&payload, "R1", 7);
        assert_eq!(enhanced["serverId"], json!("R1"));
        assert_eq!(enhanced["serverVersion"], json!(7));
        assert_eq!(enhanced["text"], json!("hi"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = OpEnvelope::new("R1", "d1", 4, json!({"text":"hi","custom":true}));
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let parsed: OpEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.server_id, "R1");
        assert_eq!(parsed.doc_id, "d1");
        assert_eq!(parsed.kind, "op");
        assert_eq!(parsed.server_version, 4);
        assert_eq!(parsed.payload["custom"], json!(true));
    }

    #[test]
    fn test_snapshot_frame_wire_names() {
        let frame = SnapshotFrame::new("d1", "hi", 2, "R1");
        let value: Value = serde_json::from_str(&encode_frame(&frame)).unwrap();
        assert_eq!(value["type"], json!("snapshot"));
        assert_eq!(value["docId"], json!("d1"));
        assert_eq!(value["serverId"], json!("R1"));
        assert_eq!(value["version"], json!(2));
    }
}
