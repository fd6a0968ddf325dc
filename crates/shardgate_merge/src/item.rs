use shardgate_common::row::Row;
use shardgate_common::types::SourceId;

/// One queued element of a source stream: a row, or the end-of-stream
/// sentinel for that source.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapItem {
    row: Option<Row>,
    source: SourceId,
}

impl HeapItem {
    pub fn row(source: SourceId, row: Row) -> Self {
        Self {
            row: Some(row),
            source,
        }
    }

    pub fn eof(source: SourceId) -> Self {
        Self { row: None, source }
    }

    pub fn is_eof(&self) -> bool {
        self.row.is_none()
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn as_row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    pub fn into_row(self) -> Option<Row> {
        self.row
    }
}
