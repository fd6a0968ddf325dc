//! Durable transaction records and their key/value encoding.

use serde::{Deserialize, Serialize};

use shardgate_common::types::{ParticipantId, Xid};

use crate::state::{TxStage, XaSubState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub participant: ParticipantId,
    pub sub_state: XaSubState,
}

/// Recovery anchor for one distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub xid: Xid,
    pub stage: TxStage,
    /// Opened by an explicit client `BEGIN`/`XA START` rather than autocommit.
    pub explicit: bool,
    pub participants: Vec<ParticipantState>,
    pub updated_at_ms: u64,
}

impl TransactionRecord {
    pub fn sub_state(&self, participant: ParticipantId) -> Option<XaSubState> {
        self.participants
            .iter()
            .find(|p| p.participant == participant)
            .map(|p| p.sub_state)
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Store key layout: one coordinator key per xid, one key per branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogKey {
    Coordinator(Xid),
    Participant(Xid, ParticipantId),
}

impl LogKey {
    pub(crate) fn encode(&self) -> String {
        match self {
            LogKey::Coordinator(xid) => format!("c/{xid}"),
            LogKey::Participant(xid, p) => format!("p/{xid}#{}", p.0),
        }
    }

    pub(crate) fn decode(key: &str) -> Option<Self> {
        if let Some(xid) = key.strip_prefix("c/") {
            return Some(LogKey::Coordinator(Xid::new(xid)));
        }
        let rest = key.strip_prefix("p/")?;
        let (xid, p) = rest.rsplit_once('#')?;
        let p = p.parse::<u64>().ok()?;
        Some(LogKey::Participant(Xid::new(xid), ParticipantId(p)))
    }
}

/// Value stored under a [`LogKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum LogValue {
    Coordinator {
        stage: TxStage,
        explicit: bool,
        participants: Vec<ParticipantId>,
        updated_at_ms: u64,
    },
    Participant {
        sub_state: XaSubState,
        updated_at_ms: u64,
    },
}
