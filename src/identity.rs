//! Stable per-process replica identifier.

use std::fmt;

/// Identifier for this server replica.
///
/// Carried in every envelope published on the ops bus so the subscriber can
/// drop its own echoes, and in `snapshot`/`pong` frames so clients can see
/// which replica served them. Read once at startup and passed in as a
/// construction-time dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Read the replica id from the `SERVER_ID` environment variable,
    /// defaulting to `"local"`.
    pub fn from_env() -> Self {
        let id = std::env::var("SERVER_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "local".to_string());
        Self(id)
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_display() {
        let id = ReplicaId::new("R1");
        assert_eq!(id.as_str(), "R1");
        assert_eq!(id.to_string(), "R1");
    }

    #[test]
    fn test_replica_id_equality() {
        assert_eq!(ReplicaId::new("R1"), ReplicaId::new("R1"));
        assert_ne!(ReplicaId::new("R1"), ReplicaId::new("R2"));
    }
}
