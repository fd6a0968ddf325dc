//! Streaming k-way merge of sharded, pre-sorted result sets under a global
//! ORDER BY and LIMIT/OFFSET.

pub mod coordinator;
pub mod cursor;
pub mod heap;
pub mod item;
pub mod limit;
pub mod order;
pub mod queue;
pub mod sink;

pub use coordinator::{MergePhase, MergePlan, MergeSession, MergeStats};
pub use cursor::MergeCursor;
pub use heap::KWayMergeHeap;
pub use item::HeapItem;
pub use limit::{Admit, LimitWindow};
pub use order::{OrderByComparator, RowComparator, SortKey};
pub use queue::BoundedRowQueue;
pub use sink::{ConnectionReleaser, ResultSink};
