use crate::PriceListError;
use crate::config::PipelineConfig;
use crate::record::Record;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Caps and cadence of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub per_key_cap: usize,
    pub global_cap: usize,
    pub shrink_interval: u64,
    pub progress_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            per_key_cap: 20,
            global_cap: 1000,
            shrink_interval: 1000,
            progress_interval: 10_000,
        }
    }
}

impl From<&PipelineConfig> for StoreConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            per_key_cap: config.per_key_cap,
            global_cap: config.global_cap,
            shrink_interval: config.shrink_interval,
            progress_interval: config.progress_interval,
        }
    }
}

/// Records evicted by one shrink pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    pub per_key_evicted: usize,
    pub global_evicted: usize,
}

/// Ordered, duplicate-free records of one identifier.
///
/// `approximate_size` trails the set by at most the operations in flight on
/// other threads; it is what the shrink signal and the per-key pass look at.
struct Bucket {
    records: Mutex<BTreeSet<Record>>,
    approximate_size: AtomicUsize,
}

impl Bucket {
    fn new() -> Self {
        Self {
            records: Mutex::new(BTreeSet::new()),
            approximate_size: AtomicUsize::new(0),
        }
    }

    /// Size after the insertion, or `None` for a duplicate.
    fn insert(&self, record: Record) -> Option<usize> {
        let mut records = self.records.lock();
        if records.insert(record) {
            Some(self.approximate_size.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            None
        }
    }

    fn remove(&self, record: &Record) -> bool {
        let mut records = self.records.lock();
        let removed = records.remove(record);
        if removed {
            self.approximate_size.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Drop the most expensive records until at most `cap` remain.
    fn trim_to(&self, cap: usize) -> SmallVec<[Record; 4]> {
        let mut evicted = SmallVec::new();
        let mut records = self.records.lock();
        while self.approximate_size.load(Ordering::SeqCst) > cap {
            match records.pop_last() {
                Some(record) => {
                    self.approximate_size.fetch_sub(1, Ordering::SeqCst);
                    evicted.push(record);
                }
                None => break,
            }
        }
        evicted
    }

    fn contains(&self, record: &Record) -> bool {
        self.records.lock().contains(record)
    }

    fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn size(&self) -> usize {
        self.approximate_size.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Record> {
        self.records.lock().iter().cloned().collect()
    }

    fn reset(&self) {
        let mut records = self.records.lock();
        records.clear();
        self.approximate_size.store(0, Ordering::SeqCst);
    }
}

/// Free list of empty buckets.
#[derive(Default)]
struct BucketPool {
    free: SegQueue<Arc<Bucket>>,
}

impl BucketPool {
    fn acquire(&self) -> Arc<Bucket> {
        self.free.pop().unwrap_or_else(|| Arc::new(Bucket::new()))
    }

    /// Recycle a bucket nobody else can reach any more. Buckets still shared
    /// with an in-flight insert are left to be dropped by their last holder.
    fn release(&self, bucket: Arc<Bucket>) {
        if Arc::strong_count(&bucket) == 1 {
            bucket.reset();
            self.free.push(bucket);
        }
    }

    fn len(&self) -> usize {
        self.free.len()
    }

    fn clear(&self) {
        while self.free.pop().is_some() {}
    }
}

enum Registration {
    Registered,
    Existing(Arc<Bucket>),
}

/// Concurrent store keeping the cheapest records per identifier and overall.
///
/// Caps are enforced lazily: a shrink pass runs once every `shrink_interval`
/// global admissions (on whichever thread wins the in-progress flag) and
/// whenever a snapshot is requested.
pub struct TopKStore {
    config: StoreConfig,
    buckets: DashMap<i64, Arc<Bucket>, FxBuildHasher>,
    bucket_pool: BucketPool,
    shrink_candidates: SegQueue<i64>,
    global: Mutex<BTreeSet<Record>>,
    global_size: AtomicUsize,
    operations: AtomicU64,
    shrinking: AtomicBool,
    read_total: AtomicU64,
    processed_total: AtomicU64,
    stopped: AtomicBool,
    ready: AtomicBool,
}

impl Default for TopKStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl TopKStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            buckets: DashMap::with_hasher(FxBuildHasher::default()),
            bucket_pool: BucketPool::default(),
            shrink_candidates: SegQueue::new(),
            global: Mutex::new(BTreeSet::new()),
            global_size: AtomicUsize::new(0),
            operations: AtomicU64::new(0),
            shrinking: AtomicBool::new(false),
            read_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Offer one record. Returns true if it was newly admitted to the global
    /// store; duplicates of a record already held for its identifier are
    /// rejected. Every call counts towards readiness.
    pub fn submit(&self, record: Record) -> bool {
        let admitted = self.admit_to_bucket(&record) && self.admit_globally(record);

        let processed = self.processed_total.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.progress_interval > 0 && processed % self.config.progress_interval == 0 {
            debug!(processed, "records processed");
        }
        self.check_ready();
        admitted
    }

    fn admit_to_bucket(&self, record: &Record) -> bool {
        let id = record.id();
        let mut bucket = match self.bucket(id) {
            Some(existing) => existing,
            None => {
                let speculative = self.bucket_pool.acquire();
                match self.register_if_absent(id, &speculative) {
                    Registration::Registered => speculative,
                    Registration::Existing(winner) => {
                        self.bucket_pool.release(speculative);
                        winner
                    }
                }
            }
        };

        // The bucket may be removed or replaced while we insert into it.
        loop {
            let added = self.insert_into(&bucket, record.clone());
            match self.register_if_absent(id, &bucket) {
                Registration::Registered => return added,
                Registration::Existing(current) if Arc::ptr_eq(&current, &bucket) => return added,
                Registration::Existing(current) => bucket = current,
            }
        }
    }

    fn register_if_absent(&self, id: i64, candidate: &Arc<Bucket>) -> Registration {
        match self.buckets.entry(id) {
            Entry::Occupied(entry) => Registration::Existing(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(candidate));
                Registration::Registered
            }
        }
    }

    fn insert_into(&self, bucket: &Bucket, record: Record) -> bool {
        let id = record.id();
        match bucket.insert(record) {
            Some(size) => {
                if size == self.config.per_key_cap + 1 {
                    self.shrink_candidates.push(id);
                }
                true
            }
            None => false,
        }
    }

    fn admit_globally(&self, record: Record) -> bool {
        let inserted = {
            let mut global = self.global.lock();
            let inserted = global.insert(record.clone());
            if inserted {
                self.global_size.fetch_add(1, Ordering::SeqCst);
            }
            inserted
        };
        if !inserted {
            debug!(id = record.id(), "record already held globally");
            return false;
        }

        // A per-key pass may have evicted the record between the two inserts.
        if !self.bucket_contains(&record) {
            self.remove_from_global(std::slice::from_ref(&record));
            return false;
        }

        let operations = self.operations.fetch_add(1, Ordering::SeqCst) + 1;
        let due = self.config.shrink_interval > 0 && operations % self.config.shrink_interval == 0;
        if due && self.try_begin_shrink() {
            self.shrink_pass();
            self.end_shrink();
        }
        true
    }

    fn bucket(&self, id: i64) -> Option<Arc<Bucket>> {
        self.buckets.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn bucket_contains(&self, record: &Record) -> bool {
        self.bucket(record.id())
            .is_some_and(|bucket| bucket.contains(record))
    }

    fn try_begin_shrink(&self) -> bool {
        self.shrinking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_shrink(&self) {
        self.shrinking.store(false, Ordering::SeqCst);
    }

    /// Run a shrink pass now, waiting for a background pass to finish first.
    pub fn shrink(&self) -> ShrinkReport {
        while !self.try_begin_shrink() {
            std::thread::yield_now();
        }
        let report = self.shrink_pass();
        self.end_shrink();
        report
    }

    fn shrink_pass(&self) -> ShrinkReport {
        let per_key_evicted = self.shrink_buckets();
        let global_evicted = self.shrink_global();
        debug!(
            per_key_evicted,
            global_evicted,
            global_size = self.len(),
            buckets = self.buckets.len(),
            "shrink pass finished"
        );
        ShrinkReport {
            per_key_evicted,
            global_evicted,
        }
    }

    fn shrink_buckets(&self) -> usize {
        let mut evicted: Vec<Record> = Vec::new();
        while let Some(id) = self.shrink_candidates.pop() {
            if let Some(bucket) = self.bucket(id) {
                evicted.extend(bucket.trim_to(self.config.per_key_cap));
            }
        }
        if evicted.is_empty() {
            return 0;
        }

        // Records that never reached the global store are not an error here:
        // their submitter withdraws them on its own.
        let removed = self.remove_from_global(&evicted);
        debug!(evicted = evicted.len(), removed, "per-key shrink");
        evicted.len()
    }

    fn shrink_global(&self) -> usize {
        let mut evicted = Vec::new();
        while self.global_size.load(Ordering::SeqCst) > self.config.global_cap {
            let popped = {
                let mut global = self.global.lock();
                let popped = global.pop_last();
                if popped.is_some() {
                    self.global_size.fetch_sub(1, Ordering::SeqCst);
                }
                popped
            };
            match popped {
                Some(record) => evicted.push(record),
                None => break,
            }
        }
        if evicted.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for record in &evicted {
            let Some(bucket) = self.bucket(record.id()) else {
                continue;
            };
            if bucket.remove(record) {
                removed += 1;
                if bucket.is_empty() {
                    self.retire_bucket(record.id(), bucket);
                }
            }
        }
        if removed != evicted.len() {
            warn!(
                evicted = evicted.len(),
                removed,
                "global shrink removed a different number of records from buckets"
            );
        }
        evicted.len()
    }

    fn retire_bucket(&self, id: i64, bucket: Arc<Bucket>) {
        let detached = self
            .buckets
            .remove_if(&id, |_, current| Arc::ptr_eq(current, &bucket) && current.is_empty());
        drop(bucket);
        if let Some((_, detached)) = detached {
            self.bucket_pool.release(detached);
        }
    }

    fn remove_from_global(&self, records: &[Record]) -> usize {
        let mut global = self.global.lock();
        let mut removed = 0;
        for record in records {
            if global.remove(record) {
                removed += 1;
            }
        }
        self.global_size.fetch_sub(removed, Ordering::SeqCst);
        removed
    }

    /// Final ordered snapshot. Only valid once the store is ready.
    pub fn get_result(&self) -> Result<Vec<Record>, PriceListError> {
        if !self.is_ready() {
            return Err(PriceListError::NotReady(format!(
                "processed {} of {} read records (stopped: {})",
                self.processed_total(),
                self.read_total(),
                self.is_stopped()
            )));
        }
        debug!("collecting result");
        self.shrink();
        Ok(self.global.lock().iter().cloned().collect())
    }

    /// Contents of one identifier's bucket after a forced shrink.
    pub fn bucket_snapshot(&self, id: i64) -> Vec<Record> {
        self.shrink();
        self.bucket(id).map(|b| b.snapshot()).unwrap_or_default()
    }

    /// Account for `read` more records coming from producers. Ignored once
    /// stopped.
    pub fn add_read(&self, read: u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let total = self.read_total.fetch_add(read, Ordering::SeqCst) + read;
        info!(total, "records read so far");
        self.check_ready();
    }

    /// No more records will be read.
    pub fn set_stopped(&self) {
        info!(read = self.read_total(), "all records read");
        self.stopped.store(true, Ordering::SeqCst);
        self.check_ready();
    }

    /// Count records that were read but will never be submitted.
    pub fn discard(&self, count: u64) {
        self.processed_total.fetch_add(count, Ordering::SeqCst);
        self.check_ready();
    }

    fn check_ready(&self) {
        if self.ready.load(Ordering::SeqCst) || !self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let processed = self.processed_total.load(Ordering::SeqCst);
        if processed >= self.read_total.load(Ordering::SeqCst)
            && self
                .ready
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(processed, "last record processed, store ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn read_total(&self) -> u64 {
        self.read_total.load(Ordering::SeqCst)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::SeqCst)
    }

    /// Approximate number of records in the global store.
    pub fn len(&self) -> usize {
        self.global_size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn pooled_buckets(&self) -> usize {
        self.bucket_pool.len()
    }

    /// Drop every record and pooled bucket. Counters and flags are kept.
    pub fn clear(&self) {
        while self.shrink_candidates.pop().is_some() {}
        self.buckets.clear();
        self.bucket_pool.clear();
        let mut global = self.global.lock();
        global.clear();
        self.global_size.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, price: f32) -> Record {
        Record::new(id, format!("item-{}-{}", id, price), "new", "ok", price)
    }

    fn small_store(per_key_cap: usize, global_cap: usize) -> TopKStore {
        TopKStore::new(StoreConfig {
            per_key_cap,
            global_cap,
            shrink_interval: 1000,
            progress_interval: 0,
        })
    }

    fn finish(store: &TopKStore) {
        store.add_read(store.processed_total());
        store.set_stopped();
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let store = TopKStore::default();
        assert!(store.submit(record(1, 5.0)));
        assert!(!store.submit(record(1, 5.0)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.processed_total(), 2);
    }

    #[test]
    fn test_same_values_different_id_are_distinct() {
        let store = TopKStore::default();
        assert!(store.submit(Record::new(1, "x", "new", "ok", 1.0)));
        assert!(store.submit(Record::new(2, "x", "new", "ok", 1.0)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_bucket_trimmed_to_cheapest() {
        let store = small_store(3, 100);
        for price in [5.0, 1.0, 4.0, 2.0, 3.0] {
            store.submit(record(7, price));
        }
        let prices: Vec<f32> = store.bucket_snapshot(7).iter().map(|r| r.price()).collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_shrink_signal_fires_once_per_crossing() {
        let store = small_store(2, 100);
        for price in 1..=5 {
            store.submit(record(1, price as f32));
        }
        assert_eq!(store.shrink_candidates.len(), 1);

        let report = store.shrink();
        assert_eq!(report.per_key_evicted, 3);
        assert_eq!(store.shrink_candidates.len(), 0);

        // Back at the cap: the next cheaper insert crosses again.
        store.submit(record(1, 0.5));
        assert_eq!(store.shrink_candidates.len(), 1);
        let prices: Vec<f32> = store.bucket_snapshot(1).iter().map(|r| r.price()).collect();
        assert_eq!(prices, vec![0.5, 1.0]);
    }

    #[test]
    fn test_global_cap_keeps_cheapest_and_prunes_buckets() {
        let store = small_store(10, 3);
        for id in 1..=3 {
            for price in 1..=2 {
                store.submit(record(id, (id * 10 + price) as f32));
            }
        }
        let report = store.shrink();
        assert_eq!(report.global_evicted, 3);
        assert_eq!(store.len(), 3);

        // id 3 lost both records and its bucket went back to the pool.
        assert!(store.bucket_snapshot(3).is_empty());
        assert_eq!(store.bucket_count(), 2);
        assert_eq!(store.bucket_snapshot(2).len(), 1);
        assert_eq!(store.pooled_buckets(), 1);
    }

    #[test]
    fn test_automatic_shrink_every_interval() {
        let store = TopKStore::new(StoreConfig {
            per_key_cap: 20,
            global_cap: 5,
            shrink_interval: 10,
            progress_interval: 0,
        });
        for i in 0..10 {
            store.submit(record(i, i as f32));
        }
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_result_before_ready_is_an_error() {
        let store = TopKStore::default();
        store.submit(record(1, 1.0));
        assert!(matches!(store.get_result(), Err(PriceListError::NotReady(_))));
    }

    #[test]
    fn test_readiness_when_processed_catches_up() {
        let store = TopKStore::default();
        store.add_read(2);
        store.set_stopped();
        assert!(!store.is_ready());
        store.submit(record(1, 1.0));
        assert!(!store.is_ready());
        store.submit(record(1, 1.0));
        assert!(store.is_ready());
        store.add_read(5);
        assert_eq!(store.read_total(), 2);
        assert!(store.is_ready());
    }

    #[test]
    fn test_readiness_when_stop_comes_last() {
        let store = TopKStore::default();
        store.add_read(1);
        store.submit(record(1, 1.0));
        assert!(!store.is_ready());
        store.set_stopped();
        assert!(store.is_ready());
    }

    #[test]
    fn test_discarded_records_count_towards_readiness() {
        let store = TopKStore::default();
        store.add_read(3);
        store.set_stopped();
        store.submit(record(1, 1.0));
        store.discard(2);
        assert!(store.is_ready());
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let store = small_store(2, 4);
        for id in 1..=4 {
            for price in 1..=4 {
                store.submit(record(id, (price * id) as f32));
            }
        }
        finish(&store);
        let first = store.get_result().unwrap();
        let second = store.get_result().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_clear_empties_everything() {
        let store = TopKStore::default();
        for i in 0..30 {
            store.submit(record(1, i as f32));
        }
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.bucket_count(), 0);
        assert_eq!(store.shrink().per_key_evicted, 0);
    }
}
