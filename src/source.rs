use crate::record::Record;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::warn;

/// A rebindable reader of records for one unit of work at a time.
///
/// Any failure inside an implementation is reported as exhaustion: the handle
/// stops having data and is retired by the pipeline, never retried.
pub trait RecordSource: Send + 'static {
    /// Point the handle at a unit of work. On failure the handle is left
    /// exhausted.
    fn bind(&mut self, unit: &str);

    fn has_more(&self) -> bool;

    /// Read up to `max` records. A short (or empty) batch means the handle is
    /// now exhausted.
    fn next_batch(&mut self, max: usize) -> Vec<Record>;

    /// Records handed out since the last `bind`.
    fn lines_consumed(&self) -> u64;

    /// Forget the current unit so the handle can be bound again.
    fn reset(&mut self);

    /// Unit currently bound, for logging.
    fn unit(&self) -> Option<&str>;
}

/// Creates fresh handles when the pool has none to recycle.
pub trait SourceFactory: Send + Sync + 'static {
    type Source: RecordSource;

    fn create(&self) -> Self::Source;
}

/// Serves units of work from memory. Used by tests, benches and embedders
/// that already hold their records.
pub struct MemorySource {
    units: Arc<FxHashMap<String, Vec<Record>>>,
    unit: Option<String>,
    position: usize,
    active: bool,
    consumed: u64,
}

impl RecordSource for MemorySource {
    fn bind(&mut self, unit: &str) {
        self.unit = Some(unit.to_string());
        self.position = 0;
        self.consumed = 0;
        self.active = self.units.contains_key(unit);
        if !self.active {
            warn!(unit, "unknown unit of work, treating as exhausted");
        }
    }

    fn has_more(&self) -> bool {
        self.active
    }

    fn next_batch(&mut self, max: usize) -> Vec<Record> {
        if !self.active {
            return Vec::new();
        }
        let units = Arc::clone(&self.units);
        let records = match self.unit.as_deref().and_then(|u| units.get(u)) {
            Some(records) => records,
            None => {
                self.active = false;
                return Vec::new();
            }
        };

        let end = usize::min(self.position + max, records.len());
        let batch = records[self.position..end].to_vec();
        self.position = end;
        if batch.len() < max {
            self.active = false;
        }
        self.consumed += batch.len() as u64;
        batch
    }

    fn lines_consumed(&self) -> u64 {
        self.consumed
    }

    fn reset(&mut self) {
        self.unit = None;
        self.position = 0;
        self.active = false;
        self.consumed = 0;
    }

    fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }
}

#[derive(Clone, Default)]
pub struct MemorySourceFactory {
    units: Arc<FxHashMap<String, Vec<Record>>>,
}

impl MemorySourceFactory {
    pub fn new(units: impl IntoIterator<Item = (String, Vec<Record>)>) -> Self {
        Self {
            units: Arc::new(units.into_iter().collect()),
        }
    }

    /// Unit ids in a stable order, ready to hand to the scheduler.
    pub fn unit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.units.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl SourceFactory for MemorySourceFactory {
    type Source = MemorySource;

    fn create(&self) -> MemorySource {
        MemorySource {
            units: Arc::clone(&self.units),
            unit: None,
            position: 0,
            active: false,
            consumed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> MemorySourceFactory {
        let records = (1..=5)
            .map(|p| Record::new(1, format!("r{}", p), "new", "ok", p as f32))
            .collect();
        MemorySourceFactory::new(vec![("a".to_string(), records)])
    }

    #[test]
    fn test_short_batch_exhausts() {
        let mut source = factory().create();
        source.bind("a");
        assert!(source.has_more());
        assert_eq!(source.next_batch(3).len(), 3);
        assert!(source.has_more());
        assert_eq!(source.next_batch(3).len(), 2);
        assert!(!source.has_more());
        assert_eq!(source.lines_consumed(), 5);
    }

    #[test]
    fn test_exact_multiple_needs_empty_batch_to_exhaust() {
        let mut source = factory().create();
        source.bind("a");
        assert_eq!(source.next_batch(5).len(), 5);
        assert!(source.has_more());
        assert!(source.next_batch(5).is_empty());
        assert!(!source.has_more());
    }

    #[test]
    fn test_unknown_unit_is_exhausted() {
        let mut source = factory().create();
        source.bind("missing");
        assert!(!source.has_more());
        assert!(source.next_batch(10).is_empty());
    }

    #[test]
    fn test_reset_allows_rebinding() {
        let mut source = factory().create();
        source.bind("a");
        source.next_batch(10);
        source.reset();
        assert_eq!(source.lines_consumed(), 0);
        assert!(source.unit().is_none());
        source.bind("a");
        assert_eq!(source.next_batch(10).len(), 5);
    }
}
