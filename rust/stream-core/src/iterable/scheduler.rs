// rust/stream-core/src/iterable/scheduler.rs

//! Bounded, order-preserving task pool for asynchronous transforms.
//!
//! Tasks run on a private single-threaded tokio runtime owned by the pool.
//! They only make progress while the pool blocks on the runtime (while
//! throttling or waiting for the head task), and results are released strictly
//! in submission order even when tasks complete out of order.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stream_core::iterable::scheduler::OrderedTaskPool;
//!
//! let mut pool = OrderedTaskPool::new(4).unwrap();
//! pool.submit(async {
//!     tokio::time::sleep(Duration::from_millis(20)).await;
//!     Ok(1)
//! })
//! .unwrap();
//! pool.submit(async { Ok(2) }).unwrap();
//! assert_eq!(pool.wait_for_head().unwrap(), Some(1));
//! assert_eq!(pool.wait_for_head().unwrap(), Some(2));
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Result, StreamError};

/// Submission stops once this many times `max_concurrency` tasks are
/// waiting to be drained.
const HARD_LIMIT_FACTOR: usize = 10;

pub struct OrderedTaskPool<T> {
    runtime: Runtime,
    tasks: JoinSet<(u64, Result<T>)>,
    // Task ids in submission order, until drained.
    order: VecDeque<u64>,
    completed: HashMap<u64, Result<T>>,
    next_id: u64,
    max_concurrency: usize,
}

impl<T: Send + 'static> OrderedTaskPool<T> {
    /// # Errors
    ///
    /// Returns a task error if the runtime cannot be built.
    pub fn new(max_concurrency: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| StreamError::task(format!("failed to start async map runtime: {e}")))?;
        Ok(Self {
            runtime,
            tasks: JoinSet::new(),
            order: VecDeque::new(),
            completed: HashMap::new(),
            next_id: 0,
            max_concurrency: max_concurrency.max(1),
        })
    }

    /// Tasks submitted and not yet drained.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Spawns `future`, then blocks until fewer than `max_concurrency` tasks
    /// are running. Once the undrained backlog reaches the hard limit it also
    /// waits for the head task to finish.
    ///
    /// # Errors
    ///
    /// Returns a task error if a task panicked while throttling.
    pub fn submit<F>(&mut self, future: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks
            .spawn_on(async move { (id, future.await) }, self.runtime.handle());
        self.order.push_back(id);

        while self.tasks.len() >= self.max_concurrency {
            self.join_one()?;
        }
        if self.order.len() >= HARD_LIMIT_FACTOR * self.max_concurrency {
            self.block_on_head()?;
        }
        Ok(())
    }

    fn join_one(&mut self) -> Result<bool> {
        match self.runtime.block_on(self.tasks.join_next()) {
            Some(Ok((id, result))) => {
                self.completed.insert(id, result);
                Ok(true)
            }
            Some(Err(e)) => Err(StreamError::task(format!("async map task failed: {e}"))),
            None => Ok(false),
        }
    }

    fn collect_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok((id, result)) => {
                    self.completed.insert(id, result);
                }
                Err(e) => return Err(StreamError::task(format!("async map task failed: {e}"))),
            }
        }
        Ok(())
    }

    fn block_on_head(&mut self) -> Result<()> {
        while let Some(head) = self.order.front() {
            if self.completed.contains_key(head) {
                break;
            }
            if !self.join_one()? {
                break;
            }
        }
        Ok(())
    }

    fn take_head(&mut self) -> Option<Result<T>> {
        let head = *self.order.front()?;
        let result = self.completed.remove(&head)?;
        self.order.pop_front();
        Some(result)
    }

    /// Result of the oldest task if it has already finished.
    ///
    /// # Errors
    ///
    /// Returns the task's own error, or a task error if it panicked.
    pub fn pop_ready(&mut self) -> Result<Option<T>> {
        self.collect_finished()?;
        self.take_head().transpose()
    }

    /// Blocks until the oldest task finishes and returns its result, or
    /// `None` when no task is left.
    pub fn wait_for_head(&mut self) -> Result<Option<T>> {
        self.block_on_head()?;
        self.take_head().transpose()
    }

    /// Aborts every outstanding task and waits for them to wind down.
    pub fn cancel(&mut self) {
        if self.order.is_empty() {
            return;
        }
        debug!(tasks = self.order.len(), "Canceling async tasks");
        self.tasks.abort_all();
        let tasks = &mut self.tasks;
        self.runtime.block_on(async move { while tasks.join_next().await.is_some() {} });
        self.order.clear();
        self.completed.clear();
        debug!("Tasks canceled");
    }
}
