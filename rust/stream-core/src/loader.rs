// rust/stream-core/src/loader.rs

//! Multi-worker loading.
//!
//! [`WorkerPoolLoader`] runs one background thread per worker. Each thread
//! iterates its own copy of the dataset restricted to the worker's shards
//! (see [`IterableDataset::iter_worker`]) and prefetches records into a
//! bounded queue. The consumer takes one record from each worker in turn,
//! skipping workers that are done, so the output order is deterministic.
//!
//! Every record travels with the snapshot of its worker right after it was
//! produced. [`WorkerPoolLoader::state_dict`] collects the snapshots of the
//! records handed out so far, which is what a resumed loader starts from.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stream_core::dataset::IterableDataset;
//! use stream_core::loader::{LoaderConfig, WorkerPoolLoader};
//!
//! let rows = (0..8).map(|i| json!({"a": i}).as_object().unwrap().clone()).collect();
//! let ds = IterableDataset::from_rows(rows, 4).unwrap();
//! let loader = WorkerPoolLoader::new(&ds, LoaderConfig { num_workers: 2, ..Default::default() }).unwrap();
//! assert_eq!(loader.count(), 8);
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::IterableDataset;
use crate::error::{Result, StreamError};
use crate::records::Record;
use crate::state::DatasetState;

/// Wait between two polls of an empty queue.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Records buffered per worker.
    pub prefetch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            prefetch_size: 16,
        }
    }
}

/// Snapshot of a loader: one dataset snapshot per worker and the worker
/// the next record is taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderState {
    pub worker_states: Vec<DatasetState>,
    pub next_worker: usize,
}

struct WorkerItem {
    record: Result<Record>,
    state: Option<DatasetState>,
}

struct Worker {
    queue: Arc<ArrayQueue<WorkerItem>>,
    handle: Option<JoinHandle<()>>,
    // Snapshot after the latest record taken from this worker.
    state: DatasetState,
    finished: bool,
}

impl Worker {
    /// Waits for the next item. `None` once the thread is done and the
    /// queue is drained. A panicked thread yields one task error first.
    fn pop_blocking(&mut self, worker_id: usize) -> Option<WorkerItem> {
        loop {
            if let Some(item) = self.queue.pop() {
                return Some(item);
            }
            let done = self.handle.as_ref().map_or(true, JoinHandle::is_finished);
            if done {
                // The last push may land between the pop and the check.
                if let Some(item) = self.queue.pop() {
                    return Some(item);
                }
                let handle = self.handle.take()?;
                return match handle.join() {
                    Ok(()) => None,
                    Err(payload) => Some(WorkerItem {
                        record: Err(StreamError::task(format!(
                            "worker {worker_id} panicked: {}",
                            panic_message(payload.as_ref())
                        ))),
                        state: None,
                    }),
                };
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Pushes `item`, waiting for room. Returns false if the loader stopped.
fn push_blocking(queue: &ArrayQueue<WorkerItem>, stop_flag: &AtomicBool, mut item: WorkerItem) -> bool {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return false;
        }
        match queue.push(item) {
            Ok(()) => return true,
            Err(back) => {
                item = back;
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn run_worker(
    mut dataset: IterableDataset,
    num_workers: usize,
    worker_id: usize,
    queue: Arc<ArrayQueue<WorkerItem>>,
    stop_flag: Arc<AtomicBool>,
) {
    let mut iter = match dataset.iter_worker(num_workers, worker_id) {
        Ok(iter) => iter,
        Err(e) => {
            let item = WorkerItem {
                record: Err(e),
                state: None,
            };
            push_blocking(&queue, &stop_flag, item);
            return;
        }
    };
    let mut num_records = 0usize;
    while let Some(record) = iter.next() {
        let failed = record.is_err();
        let item = WorkerItem {
            record,
            state: Some(iter.state_dict()),
        };
        if !push_blocking(&queue, &stop_flag, item) {
            debug!(worker_id, num_records, "Worker stopped");
            return;
        }
        if failed {
            return;
        }
        num_records += 1;
    }
    debug!(worker_id, num_records, "Worker finished");
}

/// Loads a dataset with a pool of worker threads.
pub struct WorkerPoolLoader {
    workers: Vec<Worker>,
    stop_flag: Arc<AtomicBool>,
    next_worker: usize,
}

impl WorkerPoolLoader {
    /// Starts the workers from the beginning of the dataset.
    ///
    /// # Errors
    ///
    /// Returns a config error for zero workers or a zero prefetch size.
    pub fn new(dataset: &IterableDataset, config: LoaderConfig) -> Result<Self> {
        Self::start(dataset, config, None)
    }

    /// Starts the workers from a loader snapshot.
    ///
    /// # Errors
    ///
    /// Returns a config error if `state` was taken with another number of
    /// workers, or a state error if a snapshot does not fit the dataset.
    pub fn resume(dataset: &IterableDataset, config: LoaderConfig, state: LoaderState) -> Result<Self> {
        if state.worker_states.len() != config.num_workers {
            return Err(StreamError::config(format!(
                "loader snapshot has {} workers, the loader has {}",
                state.worker_states.len(),
                config.num_workers
            )));
        }
        Self::start(dataset, config, Some(state))
    }

    fn start(dataset: &IterableDataset, config: LoaderConfig, state: Option<LoaderState>) -> Result<Self> {
        let LoaderConfig {
            num_workers,
            prefetch_size,
        } = config;
        if num_workers == 0 || prefetch_size == 0 {
            return Err(StreamError::config(
                "the loader needs at least one worker and a positive prefetch size",
            ));
        }
        let (worker_states, next_worker): (Vec<Option<DatasetState>>, usize) = match state {
            Some(state) => (
                state.worker_states.into_iter().map(Some).collect(),
                state.next_worker % num_workers,
            ),
            None => (vec![None; num_workers], 0),
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(num_workers);
        for (worker_id, worker_state) in worker_states.into_iter().enumerate() {
            let mut dataset = dataset.clone();
            if let Some(worker_state) = worker_state {
                dataset.load_state_dict(worker_state);
            }
            // Fails early on a bad snapshot, and gives the starting point.
            let initial_state = dataset.iter_worker(num_workers, worker_id)?.state_dict();

            let queue = Arc::new(ArrayQueue::new(prefetch_size));
            let handle = {
                let queue = Arc::clone(&queue);
                let stop_flag = Arc::clone(&stop_flag);
                thread::Builder::new()
                    .name(format!("stream-worker-{worker_id}"))
                    .spawn(move || run_worker(dataset, num_workers, worker_id, queue, stop_flag))
                    .map_err(|e| StreamError::task(format!("failed to spawn worker {worker_id}: {e}")))?
            };
            debug!(worker_id, num_workers, "Worker started");
            workers.push(Worker {
                queue,
                handle: Some(handle),
                state: initial_state,
                finished: false,
            });
        }

        Ok(Self {
            workers,
            stop_flag,
            next_worker,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot after the latest record handed out.
    pub fn state_dict(&self) -> LoaderState {
        LoaderState {
            worker_states: self.workers.iter().map(|w| w.state.clone()).collect(),
            next_worker: self.next_worker,
        }
    }

    /// Takes the next record, from the next worker that is not done.
    ///
    /// # Errors
    ///
    /// Returns the error a worker hit; that worker yields nothing more.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        let num_workers = self.workers.len();
        let mut idle = 0;
        while idle < num_workers {
            let idx = self.next_worker;
            self.next_worker = (idx + 1) % num_workers;
            let worker = &mut self.workers[idx];
            if worker.finished {
                idle += 1;
                continue;
            }
            match worker.pop_blocking(idx) {
                Some(WorkerItem { record, state }) => {
                    if record.is_err() {
                        worker.finished = true;
                    } else if let Some(state) = state {
                        worker.state = state;
                    }
                    return record.map(Some);
                }
                None => {
                    worker.finished = true;
                    idle += 1;
                }
            }
        }
        Ok(None)
    }

    /// Stops the workers and waits for them.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        for (worker_id, worker) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = worker.handle.take() {
                if let Err(payload) = handle.join() {
                    warn!(worker_id, message = panic_message(payload.as_ref()), "Worker panicked");
                }
            }
        }
    }
}

impl Iterator for WorkerPoolLoader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for WorkerPoolLoader {
    fn drop(&mut self) {
        self.stop();
    }
}
