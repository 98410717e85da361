//! Worker pool for chunk-conversion jobs, ordered by a shared priority heap:
//! priority rank first, then coverage significance, then submit order (FIFO
//! for background priorities, LIFO for interactive ones, so the chunk the
//! user is looking at right now wins over stale pans).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::error;

use crate::model::ChunkPriority;

type JobFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct QueuedJob {
    rank: i32,
    lifo: bool,
    significance: usize,
    seq: u64,
    run: JobFn,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &QueuedJob) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &QueuedJob) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    /// Greater runs first. Jobs of equal rank share a lifo flag, so using
    /// `self.lifo` for the submit-order tie-break is well defined.
    fn cmp(&self, other: &QueuedJob) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.significance.cmp(&self.significance))
            .then_with(|| {
                if self.lifo {
                    self.seq.cmp(&other.seq)
                } else {
                    other.seq.cmp(&self.seq)
                }
            })
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    shutdown: bool,
}

struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// A fixed pool of worker threads draining the job heap. Dropping the
/// scheduler finishes every queued job before the workers exit.
pub struct ChunkJobScheduler {
    queue: Arc<JobQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl ChunkJobScheduler {
    pub fn new(thread_name_prefix: &str, num_threads: usize) -> Result<ChunkJobScheduler> {
        let queue = Arc::new(JobQueue {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(num_threads.max(1));
        for i in 0..num_threads.max(1) {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", thread_name_prefix, i))
                .spawn(move || worker_loop(&queue))
                .context("failed to spawn conversion worker")?;
            workers.push(handle);
        }

        Ok(ChunkJobScheduler { queue, workers })
    }

    pub fn submit<F>(&self, priority: ChunkPriority, significance: usize, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = match self.queue.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedJob {
            rank: priority.rank(),
            lifo: priority.lifo(),
            significance,
            seq,
            run: Box::new(job),
        });
        drop(state);
        self.queue.available.notify_one();
    }
}

impl Drop for ChunkJobScheduler {
    fn drop(&mut self) {
        {
            let mut state = match self.queue.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.shutdown = true;
        }
        self.queue.available.notify_all();
        // Queued jobs can hold the last handle to the cache that owns this
        // scheduler, so the drop can run on a worker thread. A worker must
        // not join itself.
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: &JobQueue) {
    loop {
        let job = {
            let mut state = match queue.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                if let Some(job) = state.heap.pop() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = match queue.available.wait(state) {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };

        if let Err(e) = (job.run)() {
            error!("Chunk-conversion job failed: {:#}", e);
        }
    }
}

/// Counting semaphore bounding how many chunk conversions are in flight at
/// once during bulk conversion.
pub struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = match self.permits.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *permits == 0 {
            permits = match self.released.wait(permits) {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *permits -= 1;
    }

    pub fn release(&self) {
        let mut permits = match self.permits.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        *permits += 1;
        drop(permits);
        self.released.notify_one();
    }
}
