use std::cmp::Ordering;

use shardgate_common::row::{cmp_datum, Datum, Row};

/// Ordering capability supplied by the planner for ORDER BY / GROUP BY merges.
pub trait RowComparator: Send + Sync {
    fn compare(&self, a: &Row, b: &Row) -> Ordering;
}

impl<F> RowComparator for F
where
    F: Fn(&Row, &Row) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        self(a, b)
    }
}

/// One ORDER BY key: column position and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub asc: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self { column, asc: true }
    }

    pub fn desc(column: usize) -> Self {
        Self { column, asc: false }
    }
}

/// Lexicographic comparator over a list of sort keys. Missing columns
/// compare as NULL, and NULL sorts first in ascending order.
#[derive(Debug, Clone)]
pub struct OrderByComparator {
    keys: Vec<SortKey>,
}

impl OrderByComparator {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }
}

impl RowComparator for OrderByComparator {
    fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for key in &self.keys {
            let av = a.get(key.column).unwrap_or(&Datum::Null);
            let bv = b.get(key.column).unwrap_or(&Datum::Null);
            let ord = if key.asc { cmp_datum(av, bv) } else { cmp_datum(bv, av) };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
