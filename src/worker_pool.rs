use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named job queue served by its own fixed set of threads.
struct Lane {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
}

/// Fixed set of persistent threads running pipeline workers.
///
/// Threads are grouped into lanes, one job queue per lane, so a lane whose
/// jobs block cannot starve the others. `shutdown` is a one-way latch: it
/// closes every queue, threads finish what is already queued and exit, and
/// `await_termination` joins them.
pub struct WorkerPool {
    name: String,
    lanes: Vec<Lane>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: Mutex<bool>,
    shutdown_signal: Condvar,
    accepting: AtomicBool,
    submitted: AtomicUsize,
}

impl WorkerPool {
    /// Start `threads` threads for each `(lane, threads)` pair.
    pub fn new(name: &str, lanes: &[(&'static str, usize)]) -> Self {
        let mut handles = Vec::new();
        let lanes = lanes
            .iter()
            .map(|&(lane, threads)| {
                let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
                for index in 0..threads {
                    if let Some(handle) = start_thread(name, lane, index, receiver.clone()) {
                        handles.push(handle);
                    }
                }
                Lane {
                    name: lane,
                    sender: Mutex::new(Some(sender)),
                }
            })
            .collect();
        debug!(pool = name, threads = handles.len(), "worker pool started");

        Self {
            name: name.to_string(),
            lanes,
            handles: Mutex::new(handles),
            shut_down: Mutex::new(false),
            shutdown_signal: Condvar::new(),
            accepting: AtomicBool::new(true),
            submitted: AtomicUsize::new(0),
        }
    }

    /// Queue `task` on `lane`. Returns false if the pool is shut down or the
    /// lane does not exist.
    pub fn submit<T>(&self, lane: &str, task: T) -> bool
    where
        T: FnOnce() + Send + 'static,
    {
        let Some(target) = self.lanes.iter().find(|l| l.name == lane) else {
            error!(lane, "no such lane");
            return false;
        };
        let sender = target.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        if !self.accepting.load(Ordering::SeqCst) || sender.send(Box::new(task)).is_err() {
            return false;
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Stop accepting jobs, close every lane and wake anyone waiting for
    /// termination.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        for lane in &self.lanes {
            lane.sender.lock().take();
        }
        let mut shut_down = self.shut_down.lock();
        *shut_down = true;
        self.shutdown_signal.notify_all();
        info!(pool = %self.name, "worker pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Wait for `shutdown`, then join every thread. Returns false if the
    /// timeout elapsed first.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        {
            let mut shut_down = self.shut_down.lock();
            while !*shut_down {
                match deadline {
                    Some(deadline) => {
                        if self.shutdown_signal.wait_until(&mut shut_down, deadline).timed_out() {
                            return false;
                        }
                    }
                    None => self.shutdown_signal.wait(&mut shut_down),
                }
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                error!(thread = ?name, "pool thread panicked");
            }
        }
        true
    }

    /// Threads started when the pool was created and not yet joined.
    pub fn threads(&self) -> usize {
        self.handles.lock().len()
    }

    /// Jobs accepted over the pool's lifetime.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

fn start_thread(
    pool: &str,
    lane: &'static str,
    index: usize,
    jobs: Receiver<Job>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name(format!("{}-{}-{}", pool, lane, index))
        .spawn(move || {
            for job in jobs.iter() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(lane, "worker job panicked");
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(lane, error = %e, "failed to start pool thread");
            None
        }
    }
}
