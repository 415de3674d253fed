use crate::source::{RecordSource, SourceFactory};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Recycles record-source handles and hands out pending units of work.
///
/// Handles with unread data sit in `active`; exhausted handles that have been
/// reset sit in `inactive` waiting to be rebound to the next pending unit.
pub struct HandlePool<F: SourceFactory> {
    factory: F,
    pending: SegQueue<String>,
    remaining: AtomicUsize,
    active: SegQueue<F::Source>,
    inactive: SegQueue<F::Source>,
}

impl<F: SourceFactory> HandlePool<F> {
    pub fn new(factory: F, units: impl IntoIterator<Item = String>) -> Self {
        let pending = SegQueue::new();
        let mut count = 0;
        for unit in units {
            pending.push(unit);
            count += 1;
        }
        Self {
            factory,
            pending,
            remaining: AtomicUsize::new(count),
            active: SegQueue::new(),
            inactive: SegQueue::new(),
        }
    }

    /// Next handle with data: an active one, else a recycled or brand-new one
    /// bound to the next pending unit. `None` once no unit is left anywhere.
    pub fn acquire(&self) -> Option<F::Source> {
        let recycled = self.active.pop().or_else(|| self.inactive.pop());
        let mut handle = match recycled {
            Some(handle) if handle.has_more() => return Some(handle),
            other => other,
        };

        let Some(unit) = self.pending.pop() else {
            if let Some(idle) = handle.take() {
                self.inactive.push(idle);
            }
            return None;
        };

        let mut handle = handle.take().unwrap_or_else(|| self.factory.create());
        handle.bind(&unit);
        Some(handle)
    }

    /// Park a handle that still has data.
    pub fn park_active(&self, handle: F::Source) {
        self.active.push(handle);
    }

    /// Park an exhausted handle after resetting it.
    pub fn park_inactive(&self, mut handle: F::Source) {
        handle.reset();
        self.inactive.push(handle);
    }

    /// Count one unit as finished. Returns the number still outstanding.
    pub fn retire(&self) -> usize {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Units not yet retired, including those currently being read.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// True when every unit has been handed out and retired.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.remaining() == 0
    }
}
