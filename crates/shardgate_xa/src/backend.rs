use shardgate_common::types::{ConnectionThreadId, ParticipantId, Xid};

/// Commands the XA coordinator issues to participant connections.
///
/// `exec_cmd` is fire-and-forget: the backend reports the reply later
/// through [`crate::XaCoordinator`]'s `on_connection_*` callbacks. An `Err`
/// means the command never left, and is handled like a connect error.
pub trait XaBackend: Send + Sync {
    fn exec_cmd(&self, xid: &Xid, participant: ParticipantId, command: &str) -> Result<(), String>;

    /// Open a new connection for this branch, replacing any previous one.
    fn fresh_connection(&self, xid: &Xid, participant: ParticipantId) -> Result<ConnectionThreadId, String>;

    /// Server thread id of the current connection, if one is open.
    fn connection_thread(&self, xid: &Xid, participant: ParticipantId) -> Option<ConnectionThreadId>;

    fn close_connection(&self, xid: &Xid, participant: ParticipantId, reason: &str);

    /// `XA RECOVER` on the participant: global ids of prepared branches.
    fn recover_xids(&self, participant: ParticipantId) -> Result<Vec<String>, String>;
}
