//! Drain-side iteration over the per-source queues through the merge heap.

use std::collections::HashMap;
use std::sync::Arc;

use shardgate_common::error::MergeError;
use shardgate_common::types::SourceId;

use crate::heap::KWayMergeHeap;
use crate::item::HeapItem;
use crate::order::RowComparator;
use crate::queue::BoundedRowQueue;

/// Pulls globally ordered rows out of a set of source queues.
///
/// Owned by exactly one thread. After [`prime`](Self::prime) the heap holds
/// one entry per source whose end-of-stream has not yet been consumed.
pub struct MergeCursor<'a> {
    heap: KWayMergeHeap<'a>,
    queues: &'a HashMap<SourceId, Arc<BoundedRowQueue>>,
    sources: &'a [SourceId],
    exhausted: usize,
    discarded: u64,
}

impl<'a> MergeCursor<'a> {
    pub fn new(
        cmp: &'a dyn RowComparator,
        sources: &'a [SourceId],
        queues: &'a HashMap<SourceId, Arc<BoundedRowQueue>>,
    ) -> Self {
        Self {
            heap: KWayMergeHeap::new(cmp),
            queues,
            sources,
            exhausted: 0,
            discarded: 0,
        }
    }

    fn take_from(&self, source: SourceId) -> Result<HeapItem, MergeError> {
        match self.queues.get(&source) {
            Some(q) => q.take(),
            // No queue means nothing will ever arrive.
            None => Ok(HeapItem::eof(source)),
        }
    }

    /// Block until every source has produced its first item (row or EOF).
    pub fn prime(&mut self) -> Result<(), MergeError> {
        for &source in self.sources {
            let item = self.take_from(source)?;
            self.heap.push(item);
        }
        Ok(())
    }

    /// Next row in global order, or `None` once every source is exhausted.
    pub fn next_row(&mut self) -> Result<Option<HeapItem>, MergeError> {
        loop {
            let (source, eof) = match self.heap.peek_min() {
                Some(top) => (top.source(), top.is_eof()),
                None => return Ok(None),
            };
            if eof {
                self.heap.remove_min();
                self.exhausted += 1;
                tracing::trace!(%source, live = self.heap.len(), "source exhausted");
                continue;
            }
            let next = self.take_from(source)?;
            return Ok(self.heap.replace_min(next));
        }
    }

    /// Consume and drop everything still queued until each live source
    /// reaches EOF. Returns how many rows were thrown away.
    pub fn discard_remaining(&mut self) -> Result<u64, MergeError> {
        while let Some(head) = self.heap.remove_min() {
            if !head.is_eof() {
                self.discarded += 1;
                loop {
                    let item = self.take_from(head.source())?;
                    if item.is_eof() {
                        break;
                    }
                    self.discarded += 1;
                }
            }
            self.exhausted += 1;
        }
        Ok(self.discarded)
    }

    /// Sources whose EOF has not been consumed yet.
    pub fn live_sources(&self) -> usize {
        self.sources.len() - self.exhausted
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
