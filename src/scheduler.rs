use crate::PriceListError;
use crate::channel::BoundedChannel;
use crate::config::PipelineConfig;
use crate::handle_pool::HandlePool;
use crate::record::Record;
use crate::source::{RecordSource, SourceFactory};
use crate::top_k::{StoreConfig, TopKStore};
use crate::worker::{Coordinator, Role, run_consumer, run_producer};
use crate::worker_pool::WorkerPool;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Worker counts and batch size of one role.
struct RoleState {
    required: AtomicUsize,
    actual: AtomicUsize,
    batch_size: AtomicUsize,
    max_batch: usize,
    step: usize,
}

impl RoleState {
    fn new(required: usize, batch_size: usize, max_batch: usize, step: usize) -> Self {
        Self {
            required: AtomicUsize::new(required),
            actual: AtomicUsize::new(0),
            batch_size: AtomicUsize::new(batch_size),
            max_batch,
            step,
        }
    }

    /// Lower `required` by one unless it is already 1. Returns the new value
    /// when it changed.
    fn step_down(&self) -> Option<usize> {
        self.required
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 1).then(|| n - 1))
            .ok()
            .map(|previous| previous - 1)
    }

    fn grow_batch(&self) -> usize {
        let previous = self
            .batch_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                Some(usize::min(size + self.step, self.max_batch))
            })
            .unwrap_or(self.max_batch);
        usize::min(previous + self.step, self.max_batch)
    }

    fn snapshot(&self) -> RoleSnapshot {
        RoleSnapshot {
            required: self.required.load(Ordering::SeqCst),
            actual: self.actual.load(Ordering::SeqCst),
            batch_size: self.batch_size.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub required: usize,
    pub actual: usize,
    pub batch_size: usize,
}

/// Runs producers and consumers over a set of units of work and feeds the
/// top-K store.
///
/// When `adaptive` is on, a full channel moves a worker slot from producers to
/// consumers and an empty drain moves one back. Workers leave voluntarily when
/// their role has more workers than required or their phase is complete; the
/// last one to observe completion shuts the pool down.
pub struct Scheduler<F: SourceFactory> {
    me: Weak<Scheduler<F>>,
    config: PipelineConfig,
    handles: HandlePool<F>,
    channel: BoundedChannel,
    store: Arc<TopKStore>,
    producers: RoleState,
    consumers: RoleState,
    pool: WorkerPool,
    shutdown_latch: AtomicBool,
    queue_full_events: AtomicU64,
    dropped: AtomicU64,
}

impl<F: SourceFactory> Scheduler<F> {
    pub fn new(
        config: PipelineConfig,
        factory: F,
        units: impl IntoIterator<Item = String>,
    ) -> Result<Arc<Self>, PriceListError> {
        config.validate()?;
        let initial = config.initial_workers();
        let lane_threads = config.role_limit();
        let store = Arc::new(TopKStore::new(StoreConfig::from(&config)));

        let scheduler = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            handles: HandlePool::new(factory, units),
            channel: BoundedChannel::new(config.channel_capacity),
            store,
            producers: RoleState::new(
                initial,
                config.initial_produce_batch,
                config.max_produce_batch,
                config.produce_batch_step,
            ),
            consumers: RoleState::new(
                initial,
                config.initial_consume_batch,
                config.max_consume_batch,
                config.consume_batch_step,
            ),
            pool: WorkerPool::new(
                "pricelist",
                &[
                    (Role::Producer.as_str(), lane_threads),
                    (Role::Consumer.as_str(), lane_threads),
                ],
            ),
            shutdown_latch: AtomicBool::new(false),
            queue_full_events: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        });

        if scheduler.handles.remaining() == 0 {
            info!("no units of work, nothing to read");
            scheduler.store.set_stopped();
        }
        Ok(scheduler)
    }

    /// Launch the initial producers and consumers.
    pub fn start(&self) {
        let initial = self.config.initial_workers();
        info!(
            units = self.handles.remaining(),
            producers = initial,
            consumers = initial,
            "starting pipeline"
        );
        for _ in 0..initial {
            self.spawn_worker(Role::Producer);
            self.spawn_worker(Role::Consumer);
        }
        self.update_processing_state();
    }

    fn role_state(&self, role: Role) -> &RoleState {
        match role {
            Role::Producer => &self.producers,
            Role::Consumer => &self.consumers,
        }
    }

    fn spawn_worker(&self, role: Role) -> bool {
        let state = self.role_state(role);
        state.actual.fetch_add(1, Ordering::SeqCst);

        let spawned = match self.me.upgrade() {
            Some(me) => self.pool.submit(role.as_str(), move || match role {
                Role::Producer => run_producer(&*me),
                Role::Consumer => run_consumer(&*me),
            }),
            None => false,
        };
        if !spawned {
            state.actual.fetch_sub(1, Ordering::SeqCst);
            debug!(%role, "worker not started");
        }
        spawned
    }

    pub fn producing_complete(&self) -> bool {
        self.handles.is_drained()
    }

    pub fn consuming_complete(&self) -> bool {
        self.producing_complete() && self.channel.is_empty()
    }

    fn phase_complete(&self, role: Role) -> bool {
        match role {
            Role::Producer => self.producing_complete(),
            Role::Consumer => self.consuming_complete(),
        }
    }

    /// Move one worker slot from the other role to `role`.
    ///
    /// The other role is stepped down towards a single worker; the step that
    /// reaches one also enlarges `role`'s batch. `role` then gains a worker if
    /// that stays within the role limit.
    fn rebalance_toward(&self, role: Role) {
        if self.phase_complete(role) {
            return;
        }
        let state = self.role_state(role);
        let other = self.role_state(role.other());

        if other.step_down() == Some(1) {
            let batch_size = state.grow_batch();
            debug!(%role, batch_size, "batch size increased");
        }

        let required = state.required.fetch_add(1, Ordering::SeqCst) + 1;
        if required > self.config.role_limit() {
            state.required.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if self.spawn_worker(role) {
            debug!(%role, required, "worker added");
        }
    }

    fn note_channel_full(&self) {
        let events = self.queue_full_events.fetch_add(1, Ordering::SeqCst);
        let interval = self.config.queue_full_warning_interval;
        if interval > 0 && events % interval == 0 {
            warn!(
                events = events + 1,
                capacity = self.channel.capacity(),
                "channel full, producers waiting"
            );
        }
        if self.config.adaptive {
            self.rebalance_toward(Role::Consumer);
        }
    }

    fn update_processing_state(&self) {
        if !self.consuming_complete() || !self.store.is_ready() {
            return;
        }
        if self
            .shutdown_latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(
                read = self.store.read_total(),
                processed = self.store.processed_total(),
                dropped = self.dropped.load(Ordering::SeqCst),
                "processing complete"
            );
            self.pool.shutdown();
        }
    }

    /// Block until every worker has finished. Returns false on timeout.
    pub fn await_termination(&self) -> bool {
        let finished = self
            .pool
            .await_termination(Duration::from_secs(self.config.await_timeout_secs));
        if !finished {
            error!(
                timeout_secs = self.config.await_timeout_secs,
                "timed out waiting for workers"
            );
        }
        finished
    }

    /// Final result, or an empty list if processing has not finished.
    pub fn result(&self) -> Vec<Record> {
        match self.store.get_result() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "result requested before processing finished");
                Vec::new()
            }
        }
    }

    pub fn store(&self) -> &Arc<TopKStore> {
        &self.store
    }

    pub fn role_snapshot(&self, role: Role) -> RoleSnapshot {
        self.role_state(role).snapshot()
    }

    /// Records lost because the channel refused them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl<F: SourceFactory> Coordinator for Scheduler<F> {
    type Source = F::Source;

    fn acquire_source(&self) -> Option<F::Source> {
        self.handles.acquire()
    }

    fn release_source(&self, source: F::Source) {
        if source.has_more() {
            self.handles.park_active(source);
            return;
        }

        // Reads are accounted before the unit is retired, so the last
        // retirement sees every unit's count.
        self.store.add_read(source.lines_consumed());
        let remaining = self.handles.retire();
        info!(unit = source.unit().unwrap_or("?"), remaining, "unit finished");
        if remaining == 0 {
            self.store.set_stopped();
        } else {
            self.handles.park_inactive(source);
        }
    }

    fn batch_size(&self, role: Role) -> usize {
        self.role_state(role).batch_size.load(Ordering::SeqCst)
    }

    fn enqueue(&self, batch: Vec<Record>) {
        for record in batch {
            if let Err(record) = self.channel.put(record, || self.note_channel_full()) {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                error!(id = record.id(), "could not enqueue record, dropping it");
                self.store.discard(1);
            }
        }
    }

    fn channel_full(&self) -> bool {
        self.channel.is_full()
    }

    fn dequeue(&self) -> Vec<Record> {
        let batch = self.channel.drain(self.batch_size(Role::Consumer));
        if batch.is_empty() && self.config.adaptive {
            self.rebalance_toward(Role::Producer);
        }
        batch
    }

    fn submit(&self, record: Record) {
        self.store.submit(record);
    }

    fn role_required(&self, role: Role) -> bool {
        let state = self.role_state(role);
        let complete = self.phase_complete(role);
        let left = state
            .actual
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |actual| {
                let surplus = actual > state.required.load(Ordering::SeqCst);
                (complete || surplus).then(|| actual.saturating_sub(1))
            })
            .is_ok();
        !left
    }

    fn role_stopped(&self, role: Role) {
        let snapshot = self.role_snapshot(role);
        debug!(%role, remaining = snapshot.actual, required = snapshot.required, "worker stopped");
        self.update_processing_state();
    }

    fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.config.idle_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySourceFactory;

    fn config(parallelism: usize) -> PipelineConfig {
        let mut config = PipelineConfig::with_capacity(1000);
        config.parallelism = parallelism;
        config.max_produce_batch = 400;
        config.max_consume_batch = 200;
        config.produce_batch_step = 40;
        config.consume_batch_step = 20;
        config.await_timeout_secs = 30;
        config
    }

    fn factory(units: usize, per_unit: usize) -> MemorySourceFactory {
        MemorySourceFactory::new((0..units).map(|u| {
            let records = (0..per_unit)
                .map(|i| {
                    Record::new(i as i64 % 7, format!("u{}-{}", u, i), "new", "ok", i as f32)
                })
                .collect();
            (format!("unit-{}", u), records)
        }))
    }

    fn scheduler(
        parallelism: usize,
        units: usize,
    ) -> Arc<Scheduler<MemorySourceFactory>> {
        let factory = factory(units, 10);
        let ids = factory.unit_ids();
        Scheduler::new(config(parallelism), factory, ids).unwrap()
    }

    #[test]
    fn test_zero_units_is_ready_immediately() {
        let scheduler = scheduler(4, 0);
        assert!(scheduler.store().is_ready());
        assert!(scheduler.producing_complete());
        assert!(scheduler.consuming_complete());
        scheduler.start();
        assert!(scheduler.await_termination());
        assert!(scheduler.result().is_empty());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut bad = config(4);
        bad.channel_capacity = 0;
        let factory = factory(1, 1);
        assert!(Scheduler::new(bad, factory, vec!["unit-0".to_string()]).is_err());
    }

    #[test]
    fn test_full_channel_moves_slot_to_consumers() {
        let scheduler = scheduler(4, 2);
        // Keep the test single-threaded: spawns are refused.
        scheduler.pool.shutdown();

        let before = scheduler.role_snapshot(Role::Consumer);
        assert_eq!(before.required, 2);

        scheduler.rebalance_toward(Role::Consumer);
        let producers = scheduler.role_snapshot(Role::Producer);
        let consumers = scheduler.role_snapshot(Role::Consumer);
        assert_eq!(producers.required, 1);
        assert_eq!(consumers.batch_size, before.batch_size + scheduler.consumers.step);
        // The slot is kept but the refused worker is not counted.
        assert_eq!(consumers.required, 3);
        assert_eq!(consumers.actual, 0);

        // Producers never go below one, the batch grows only on the
        // transition and consumers stay at the role limit.
        scheduler.rebalance_toward(Role::Consumer);
        let consumers = scheduler.role_snapshot(Role::Consumer);
        assert_eq!(scheduler.role_snapshot(Role::Producer).required, 1);
        assert_eq!(consumers.batch_size, before.batch_size + scheduler.consumers.step);
        assert_eq!(consumers.required, 3);
    }

    #[test]
    fn test_empty_drain_moves_slot_to_producers() {
        let scheduler = scheduler(4, 2);
        scheduler.pool.shutdown();
        let before = scheduler.role_snapshot(Role::Producer);
        assert_eq!(before.required, 2);

        assert!(scheduler.dequeue().is_empty());
        let producers = scheduler.role_snapshot(Role::Producer);
        let consumers = scheduler.role_snapshot(Role::Consumer);
        assert_eq!(consumers.required, 1);
        assert_eq!(producers.batch_size, before.batch_size + scheduler.producers.step);
        assert_eq!(producers.required, 3);
        assert_eq!(producers.actual, 0);
    }

    #[test]
    fn test_empty_drain_without_adaptive_changes_nothing() {
        let mut fixed = config(4);
        fixed.adaptive = false;
        let factory = factory(2, 10);
        let ids = factory.unit_ids();
        let scheduler = Scheduler::new(fixed, factory, ids).unwrap();
        scheduler.pool.shutdown();

        assert!(scheduler.dequeue().is_empty());
        assert_eq!(scheduler.role_snapshot(Role::Producer).required, 2);
        assert_eq!(scheduler.role_snapshot(Role::Consumer).required, 2);
    }

    #[test]
    fn test_rebalance_rolls_back_at_role_limit() {
        let scheduler = scheduler(4, 2);
        let limit = scheduler.config.role_limit();
        scheduler.consumers.required.store(limit, Ordering::SeqCst);
        let submitted = scheduler.pool.submitted();

        scheduler.rebalance_toward(Role::Consumer);
        let consumers = scheduler.role_snapshot(Role::Consumer);
        assert_eq!(consumers.required, limit);
        assert_eq!(consumers.actual, 0);
        assert_eq!(scheduler.pool.submitted(), submitted);
        scheduler.pool.shutdown();
    }

    #[test]
    fn test_rebalance_skipped_when_phase_complete() {
        let scheduler = scheduler(4, 0);
        scheduler.pool.shutdown();
        let producers = scheduler.role_snapshot(Role::Producer);
        let consumers = scheduler.role_snapshot(Role::Consumer);

        scheduler.rebalance_toward(Role::Consumer);
        scheduler.rebalance_toward(Role::Producer);
        assert_eq!(scheduler.role_snapshot(Role::Producer), producers);
        assert_eq!(scheduler.role_snapshot(Role::Consumer), consumers);
    }

    #[test]
    fn test_thread_count_stays_fixed_under_backpressure() {
        let mut small = config(4);
        small.channel_capacity = 64;
        let factory = factory(12, 2000);
        let ids = factory.unit_ids();
        let scheduler = Scheduler::new(small, factory, ids).unwrap();
        let threads = 2 * scheduler.config.role_limit();
        assert_eq!(scheduler.pool.threads(), threads);

        scheduler.start();
        assert_eq!(scheduler.pool.threads(), threads);
        assert!(scheduler.await_termination());

        let store = scheduler.store();
        assert_eq!(store.read_total(), 24_000);
        assert_eq!(store.processed_total(), 24_000);
        assert_eq!(scheduler.dropped(), 0);
    }

    #[test]
    fn test_batch_growth_is_capped() {
        let state = RoleState::new(1, 90, 100, 25);
        assert_eq!(state.grow_batch(), 100);
        assert_eq!(state.grow_batch(), 100);
        assert_eq!(state.batch_size.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_step_down_stops_at_one() {
        let state = RoleState::new(3, 1, 1, 1);
        assert_eq!(state.step_down(), Some(2));
        assert_eq!(state.step_down(), Some(1));
        assert_eq!(state.step_down(), None);
    }

    #[test]
    fn test_role_required_releases_surplus_only() {
        let scheduler = scheduler(4, 1);
        scheduler.consumers.actual.store(3, Ordering::SeqCst);
        scheduler.consumers.required.store(2, Ordering::SeqCst);

        assert!(!scheduler.role_required(Role::Consumer));
        assert_eq!(scheduler.consumers.actual.load(Ordering::SeqCst), 2);
        assert!(scheduler.role_required(Role::Consumer));
        assert_eq!(scheduler.consumers.actual.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_role_required_releases_everyone_once_complete() {
        let scheduler = scheduler(4, 0);
        scheduler.producers.actual.store(2, Ordering::SeqCst);
        assert!(!scheduler.role_required(Role::Producer));
        assert!(!scheduler.role_required(Role::Producer));
        assert_eq!(scheduler.producers.actual.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runs_to_completion() {
        let scheduler = scheduler(4, 5);
        scheduler.start();
        assert!(scheduler.await_termination());

        let store = scheduler.store();
        assert_eq!(store.read_total(), 50);
        assert_eq!(store.processed_total(), 50);
        assert_eq!(scheduler.result().len(), 50);
        assert_eq!(scheduler.dropped(), 0);
    }
}
