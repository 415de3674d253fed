use crate::record::Record;
use crate::source::RecordSource;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Producer => Role::Consumer,
            Role::Consumer => Role::Producer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a worker loop may ask of the pipeline.
///
/// Workers never touch scheduler state directly, which lets tests drive the
/// loops with a scripted coordinator.
pub trait Coordinator: Send + Sync {
    type Source: RecordSource;

    fn acquire_source(&self) -> Option<Self::Source>;
    fn release_source(&self, source: Self::Source);
    fn batch_size(&self, role: Role) -> usize;
    fn enqueue(&self, batch: Vec<Record>);
    fn channel_full(&self) -> bool;
    fn dequeue(&self) -> Vec<Record>;
    fn submit(&self, record: Record);
    /// Whether the calling worker should keep running. A `false` answer
    /// already accounts for the worker leaving its role.
    fn role_required(&self, role: Role) -> bool;
    fn role_stopped(&self, role: Role);
    fn idle_backoff(&self) -> Duration {
        Duration::from_millis(1)
    }
}

/// Pull batches from sources into the channel until producers are no longer
/// needed.
pub fn run_producer<C: Coordinator + ?Sized>(coordinator: &C) {
    loop {
        let mut idle = true;
        'units: while let Some(mut source) = coordinator.acquire_source() {
            idle = false;
            while source.has_more() {
                let batch = source.next_batch(coordinator.batch_size(Role::Producer));
                if !batch.is_empty() {
                    coordinator.enqueue(batch);
                }
                if coordinator.channel_full() {
                    coordinator.release_source(source);
                    break 'units;
                }
            }
            coordinator.release_source(source);
        }

        if !coordinator.role_required(Role::Producer) {
            break;
        }
        // Other producers still hold the remaining units.
        if idle {
            std::thread::sleep(coordinator.idle_backoff());
        }
    }
    coordinator.role_stopped(Role::Producer);
}

/// Drain the channel into the store until consumers are no longer needed.
pub fn run_consumer<C: Coordinator + ?Sized>(coordinator: &C) {
    loop {
        loop {
            let batch = coordinator.dequeue();
            if batch.is_empty() {
                break;
            }
            for record in batch {
                coordinator.submit(record);
            }
        }

        if !coordinator.role_required(Role::Consumer) {
            break;
        }
        std::thread::sleep(coordinator.idle_backoff());
    }
    coordinator.role_stopped(Role::Consumer);
}
