use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one backend connection streaming rows into a merge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source:{}", self.0)
    }
}

/// Identifies one participant (backend shard node) of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant:{}", self.0)
    }
}

/// Backend connection thread id, as reported by the server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionThreadId(pub u64);

impl fmt::Display for ConnectionThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread:{}", self.0)
    }
}

/// Global distributed transaction id.
///
/// The per-participant branch id sent to a backend is derived from it with
/// [`Xid::branch`], so every participant sees a distinct but traceable xid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid(String);

impl Xid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build an xid from a coordinator prefix and a local sequence number.
    pub fn generate(prefix: &str, seq: u64) -> Self {
        Self(format!("{prefix}.{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Branch xid literal for one participant, quoted for an `XA ...` command.
    pub fn branch(&self, participant: ParticipantId) -> String {
        format!("'{}','{}'", self.0, participant.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
