use shardgate_common::row::{FieldDescriptor, Row};
use shardgate_common::types::SourceId;

/// Downstream consumer of a merged result (the client session).
///
/// Calls for one session are serialized. `forward_row` may block; that is
/// how client backpressure reaches the source queues.
pub trait ResultSink: Send + Sync {
    fn forward_fields(&self, fields: &[FieldDescriptor]) -> Result<(), String>;
    fn forward_row(&self, row: Row) -> Result<(), String>;
    fn forward_end(&self) -> Result<(), String>;
    fn forward_error(&self, code: u16, message: &str);
}

/// Returns backend connections to their pool once a session is done with them.
pub trait ConnectionReleaser: Send + Sync {
    /// `reusable == false` asks the pool to close the connection instead of
    /// recycling it (it may still have unread packets).
    fn release(&self, source: SourceId, reusable: bool);
}
