use crate::record::Record;
use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Fixed-capacity FIFO of records between producers and consumers.
///
/// Both ends live in the same struct, so the channel never disconnects while
/// it is alive.
pub struct BoundedChannel {
    sender: Sender<Record>,
    receiver: Receiver<Record>,
    capacity: usize,
}

impl BoundedChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Non-blocking enqueue. Hands the record back when the channel is full.
    pub fn offer(&self, record: Record) -> Result<(), Record> {
        match self.sender.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(r)) | Err(TrySendError::Disconnected(r)) => Err(r),
        }
    }

    /// Enqueue, blocking while full. `on_full` runs once, before blocking,
    /// if the first attempt finds no room. Returns the record if it could not
    /// be delivered at all.
    pub fn put<F: FnOnce()>(&self, record: Record, on_full: F) -> Result<(), Record> {
        let record = match self.offer(record) {
            Ok(()) => return Ok(()),
            Err(record) => record,
        };
        on_full();
        self.sender.send(record).map_err(|e| e.into_inner())
    }

    /// Remove up to `max` records without blocking.
    pub fn drain(&self, max: usize) -> Vec<Record> {
        self.receiver.try_iter().take(max).collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
