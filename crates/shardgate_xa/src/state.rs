use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-participant XA branch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaSubState {
    Initialize,
    /// Branch is active on the backend (XA START issued upstream).
    Started,
    Ended,
    Prepared,
    /// Connection dropped while XA PREPARE was in flight; outcome unknown.
    PrepareUnconnected,
    Committed,
    CommitFailed,
    RolledBack,
    RollbackFailed,
    /// Connection closed before the branch was prepared; the backend
    /// discarded it.
    ConnQuit,
}

impl XaSubState {
    /// Position along the branch lifecycle. Failed states sit one step
    /// below the state they were trying to reach.
    pub fn progress(self) -> u8 {
        match self {
            XaSubState::Initialize => 0,
            XaSubState::Started => 1,
            XaSubState::Ended => 2,
            XaSubState::Prepared | XaSubState::PrepareUnconnected => 3,
            XaSubState::CommitFailed | XaSubState::RollbackFailed => 4,
            XaSubState::Committed | XaSubState::RolledBack | XaSubState::ConnQuit => 5,
        }
    }

    /// Nothing is left to roll back on the backend.
    pub fn is_rollback_resolved(self) -> bool {
        matches!(
            self,
            XaSubState::RolledBack | XaSubState::ConnQuit | XaSubState::Initialize
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XaSubState::Initialize => "INITIALIZE",
            XaSubState::Started => "STARTED",
            XaSubState::Ended => "ENDED",
            XaSubState::Prepared => "PREPARED",
            XaSubState::PrepareUnconnected => "PREPARE_UNCONNECTED",
            XaSubState::Committed => "COMMITTED",
            XaSubState::CommitFailed => "COMMIT_FAILED",
            XaSubState::RolledBack => "ROLLBACKED",
            XaSubState::RollbackFailed => "ROLLBACK_FAILED",
            XaSubState::ConnQuit => "CONN_QUIT",
        }
    }
}

impl fmt::Display for XaSubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction-level stage, as durably logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStage {
    Initialize,
    End,
    Prepare,
    Commit,
    CommitFail,
    Rollback,
    RollbackFail,
    Committed,
    RolledBack,
}

impl TxStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStage::Committed | TxStage::RolledBack)
    }

    /// Legal stage graph. Re-entering Commit or Rollback is allowed so a
    /// restarted coordinator can re-drive the logged stage.
    pub fn can_advance_to(self, next: TxStage) -> bool {
        use TxStage::*;
        matches!(
            (self, next),
            (Initialize, End)
                | (Initialize, Rollback)
                | (End, Prepare)
                | (End, Rollback)
                | (Prepare, Commit)
                | (Prepare, Rollback)
                | (Commit, Commit)
                | (Commit, CommitFail)
                | (Commit, Committed)
                | (CommitFail, Commit)
                | (Rollback, Rollback)
                | (Rollback, RollbackFail)
                | (Rollback, RolledBack)
                | (RollbackFail, Rollback)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStage::Initialize => "INITIALIZE",
            TxStage::End => "END",
            TxStage::Prepare => "PREPARE",
            TxStage::Commit => "COMMIT",
            TxStage::CommitFail => "COMMIT_FAIL",
            TxStage::Rollback => "ROLLBACK",
            TxStage::RollbackFail => "ROLLBACK_FAIL",
            TxStage::Committed => "COMMITTED",
            TxStage::RolledBack => "ROLLBACKED",
        }
    }
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client asked for when the transaction left `Initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Commit,
    Rollback,
}

/// How a transaction's drive ended (for now).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaOutcome {
    Committed,
    RolledBack,
    /// XA END failed inside an explicit client transaction; the client
    /// must issue ROLLBACK.
    Frozen { code: u16, message: String },
    /// Commit retries exhausted; left to the recovery sweeper.
    CommitPending,
    /// Rollback retries exhausted; left to the recovery sweeper.
    RollbackPending,
    /// The log refused a write; no further commands are sent.
    LogFailure(String),
}

impl XaOutcome {
    pub fn is_final(&self) -> bool {
        matches!(self, XaOutcome::Committed | XaOutcome::RolledBack)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, XaOutcome::CommitPending | XaOutcome::RollbackPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            XaOutcome::Committed => "committed",
            XaOutcome::RolledBack => "rolled_back",
            XaOutcome::Frozen { .. } => "frozen",
            XaOutcome::CommitPending => "commit_pending",
            XaOutcome::RollbackPending => "rollback_pending",
            XaOutcome::LogFailure(_) => "log_failure",
        }
    }
}

impl fmt::Display for XaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XaOutcome::Frozen { code, message } => write!(f, "frozen ({code}: {message})"),
            XaOutcome::LogFailure(reason) => write!(f, "log_failure ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}
