/// Global LIMIT/OFFSET accounting over the merged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitWindow {
    /// Rows to skip (OFFSET).
    pub start: u64,
    /// Rows to forward after the offset (LIMIT); `None` is unbounded.
    pub count: Option<u64>,
}

/// What to do with the next merged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Still inside the offset: count it, do not forward.
    Skip,
    /// Inside the window: forward it.
    Forward,
    /// Past the window: stop forwarding.
    Exhausted,
}

impl LimitWindow {
    pub fn unbounded() -> Self {
        Self {
            start: 0,
            count: None,
        }
    }

    pub fn new(start: u64, count: u64) -> Self {
        Self {
            start,
            count: Some(count),
        }
    }

    /// Decide for the `emitted`-th merged row (1-based).
    pub fn admit(&self, emitted: u64) -> Admit {
        if emitted <= self.start {
            return Admit::Skip;
        }
        match self.count {
            Some(count) if emitted > self.start.saturating_add(count) => Admit::Exhausted,
            _ => Admit::Forward,
        }
    }

    /// True once `emitted` rows fill the window, so no later row can be forwarded.
    pub fn is_full(&self, emitted: u64) -> bool {
        match self.count {
            Some(count) => emitted >= self.start.saturating_add(count),
            None => false,
        }
    }
}

impl Default for LimitWindow {
    fn default() -> Self {
        Self::unbounded()
    }
}
