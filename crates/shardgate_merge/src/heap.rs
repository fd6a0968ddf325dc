//! Min-heap over the current head item of every live source.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use shardgate_common::types::SourceId;

use crate::item::HeapItem;
use crate::order::RowComparator;

/// Heap order: EOF sentinels first (so the drain loop retires an exhausted
/// source as soon as it surfaces), then rows by the comparator, then by the
/// ordinal of the source's first insertion.
pub struct KWayMergeHeap<'c> {
    heap: BinaryHeap<HeapEntry<'c>>,
    cmp: &'c dyn RowComparator,
    ordinals: HashMap<SourceId, usize>,
}

struct HeapEntry<'c> {
    item: HeapItem,
    ordinal: usize,
    cmp: &'c dyn RowComparator,
}

impl HeapEntry<'_> {
    fn ascending(&self, other: &Self) -> Ordering {
        let by_row = match (self.item.as_row(), other.item.as_row()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => self.cmp.compare(a, b),
        };
        by_row.then(self.ordinal.cmp(&other.ordinal))
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ascending(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for min-heap behavior
        other.ascending(self)
    }
}

impl<'c> KWayMergeHeap<'c> {
    pub fn new(cmp: &'c dyn RowComparator) -> Self {
        Self {
            heap: BinaryHeap::new(),
            cmp,
            ordinals: HashMap::new(),
        }
    }

    fn ordinal_of(&mut self, source: SourceId) -> usize {
        let next = self.ordinals.len();
        *self.ordinals.entry(source).or_insert(next)
    }

    /// Add the head item of a source. A source should have at most one
    /// entry in the heap at a time.
    pub fn push(&mut self, item: HeapItem) {
        let ordinal = self.ordinal_of(item.source());
        self.heap.push(HeapEntry {
            item,
            ordinal,
            cmp: self.cmp,
        });
    }

    pub fn peek_min(&self) -> Option<&HeapItem> {
        self.heap.peek().map(|e| &e.item)
    }

    /// Swap the minimum for `item` and restore heap order in one sift.
    /// Returns the previous minimum, or `None` (and pushes `item`) if the
    /// heap was empty.
    pub fn replace_min(&mut self, item: HeapItem) -> Option<HeapItem> {
        if self.heap.is_empty() {
            self.push(item);
            return None;
        }
        let ordinal = self.ordinal_of(item.source());
        let mut top = self.heap.peek_mut()?;
        top.ordinal = ordinal;
        let old = std::mem::replace(&mut top.item, item);
        Some(old)
    }

    pub fn remove_min(&mut self) -> Option<HeapItem> {
        self.heap.pop().map(|e| e.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
