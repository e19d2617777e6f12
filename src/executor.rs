use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ExecutorError, Result};

/// Identifies the worker thread a job runs on.
pub type WorkerId = usize;

type Job = Box<dyn FnOnce(WorkerId) + Send>;

/// A pool of blocking worker threads for request dispatch.
///
/// The pool has the following behavior:
/// - It grows up to a maximum number of workers, one per concurrent job
/// - Workers exit after `keep_alive` without work
/// - Every job learns the id of the worker running it
/// - A panicking job is logged and does not take its worker down
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

/// Internal state shared between the executor and its worker threads
struct Inner {
    /// Duration a worker thread will wait for new jobs before shutting down
    keep_alive: Duration,
    /// Shared state protected by a mutex
    shared: Mutex<Shared>,
    /// Maximum number of worker threads allowed
    max_workers: usize,
    /// Condition variable for worker thread synchronization
    condvar: Condvar,
    next_worker_id: AtomicUsize,
}

/// Shared state for the thread pool
struct Shared {
    /// Queue of pending jobs
    queue: VecDeque<Job>,
    /// Current number of worker threads
    workers: usize,
    /// Number of idle worker threads
    idle: usize,
    /// Number of workers that have been notified of new work
    notified: usize,
}

impl Executor {
    /// Creates a new executor with the specified configuration.
    ///
    /// # Arguments
    /// * `max_workers` - Optional maximum number of worker threads. Defaults to 15 * CPU cores
    /// * `keep_alive` - Optional duration workers will wait for new jobs. Defaults to 6 seconds
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Queues a job, waking an idle worker or spawning a new one if needed.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned or a worker thread cannot be spawned.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(Box::new(job));

        if shared.idle == 0 && shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(e) = self.spawn_worker(self.inner.clone()) {
                shared.workers -= 1;
                return Err(e);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    /// Runs a job on the pool and waits for its result without blocking the caller's thread.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Canceled`] if the job panicked before replying.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(WorkerId) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |worker| {
            let _ = tx.send(job(worker));
        })?;
        rx.await.map_err(|_| ExecutorError::Canceled)
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.workers)
            .unwrap_or(0)
    }

    /// Spawns a new worker thread that will process jobs from the queue.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    fn spawn_worker(&self, inner: Arc<Inner>) -> Result<()> {
        let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("sheath-worker-{id}"))
            .spawn(move || {
                if let Err(e) = inner.run(id) {
                    log::error!("Worker thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl Inner {
    /// Main worker thread loop.
    ///
    /// The worker will:
    /// 1. Process all available jobs in the queue
    /// 2. Wait for new jobs using a condition variable
    /// 3. Exit if no jobs arrive within the keep-alive duration
    ///
    /// # Errors
    /// Returns an error if mutex operations fail
    fn run(&self, id: WorkerId) -> Result<()> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(job) = shared.queue.pop_front() {
                drop(shared);
                if panic::catch_unwind(AssertUnwindSafe(|| job(id))).is_err() {
                    log::error!("Job panicked on worker {}", id);
                }
                shared = self
                    .shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let result = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;

                shared = result.0;
                let timeout = result.1;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        log::debug!("Worker {} exiting after {:?} idle", id, self.keep_alive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::Instant;

    /// Tests that an executor is created with the correct configuration parameters.
    ///
    /// Verifies that:
    /// - The maximum number of workers is set correctly
    /// - The keep-alive duration is set correctly
    #[test]
    fn test_executor_creation() {
        let executor = Executor::new(Some(4), Some(Duration::from_secs(10)));
        assert_eq!(executor.inner.max_workers, 4);
        assert_eq!(executor.inner.keep_alive, Duration::from_secs(10));
        assert_eq!(executor.workers(), 0);
    }

    /// Tests that submitted jobs run and learn their worker id.
    #[test]
    fn test_job_execution() {
        let executor = Executor::new(Some(2), None);
        let (tx, rx) = mpsc::channel();

        for n in 0..10 {
            let tx = tx.clone();
            executor
                .execute(move |worker| {
                    tx.send((n, worker)).unwrap();
                })
                .unwrap();
        }

        let results: Vec<(i32, WorkerId)> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        let jobs: HashSet<i32> = results.iter().map(|(n, _)| *n).collect();
        let workers: HashSet<WorkerId> = results.iter().map(|(_, w)| *w).collect();
        assert_eq!(jobs.len(), 10);
        assert!(workers.len() <= 2);
    }

    /// Tests that a panicking job is contained and the worker keeps serving.
    #[test]
    fn test_panicking_job() {
        let executor = Executor::new(Some(1), None);
        executor.execute(|_| panic!("boom")).unwrap();

        let (tx, rx) = mpsc::channel();
        executor.execute(move |_| tx.send("after").unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    }

    /// Tests awaiting a job result from async code, and cancellation on panic.
    #[test]
    fn test_run_async() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let executor = Executor::new(Some(2), None);

        let value = runtime.block_on(executor.run(|_| 6 * 7)).unwrap();
        assert_eq!(value, 42);

        let canceled = runtime.block_on(executor.run(|_| -> i32 { panic!("no reply") }));
        assert!(matches!(canceled, Err(ExecutorError::Canceled)));
    }

    /// Tests that idle workers exit once the keep-alive elapses.
    #[test]
    fn test_keep_alive_expiry() {
        let executor = Executor::new(Some(2), Some(Duration::from_millis(50)));
        let (tx, rx) = mpsc::channel();
        executor.execute(move |_| tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(executor.workers() <= 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.workers() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(executor.workers(), 0);
    }
}
