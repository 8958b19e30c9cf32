//! Background query execution
//!
//! Views never query the store on the caller's thread: they hand a supplier
//! to the [`TaskRunner`] and get the result back through a callback.

use crate::error::{Result, TraceError};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use workerpool::thunk::{Thunk, ThunkWorker};
use workerpool::Pool;

static NEXT_RUNNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Runner whose job is executing on this thread, if any
    static CURRENT_RUNNER: Cell<Option<u64>> = const { Cell::new(None) };
}

pub struct TaskRunner {
    id: u64,
    pool: Mutex<Pool<ThunkWorker<()>>>,
    workers: usize,
}

impl TaskRunner {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            id: NEXT_RUNNER.fetch_add(1, Ordering::Relaxed),
            pool: Mutex::new(Pool::<ThunkWorker<()>>::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `supplier` on a worker, then pass its value to `on_ok` or its
    /// error to `on_err`, both on that same worker
    pub fn compute_or_fail<T, S, K, E>(&self, supplier: S, on_ok: K, on_err: E)
    where
        T: 'static,
        S: FnOnce() -> Result<T> + Send + 'static,
        K: FnOnce(T) + Send + 'static,
        E: FnOnce(TraceError) + Send + 'static,
    {
        self.execute(move || match supplier() {
            Ok(value) => on_ok(value),
            Err(e) => {
                log::debug!("Background task failed: {}", e);
                on_err(e)
            }
        });
    }

    /// Run `job` on a worker
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.id;
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.execute(Thunk::of(move || {
            CURRENT_RUNNER.with(|current| current.set(Some(id)));
            job();
            CURRENT_RUNNER.with(|current| current.set(None));
        }));
    }

    /// True when called from one of this runner's own jobs
    pub fn on_worker(&self) -> bool {
        CURRENT_RUNNER.with(|current| current.get() == Some(self.id))
    }

    /// Block until every queued task has run
    ///
    /// From inside one of this runner's jobs it returns at once: the pool
    /// can never drain while the caller occupies a worker.
    pub fn join(&self) {
        if self.on_worker() {
            log::debug!("Not joining task pool from one of its own workers");
            return;
        }
        // Clone so that other threads can keep submitting while we wait
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).clone();
        pool.join();
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("id", &self.id)
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_success_goes_to_on_ok() {
        let runner = TaskRunner::new(2);
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        runner.compute_or_fail(
            || Ok(21 * 2),
            move |v| tx.send(Ok(v)).unwrap(),
            move |e| err_tx.send(Err(e.to_string())).unwrap(),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(42));
    }

    #[test]
    fn test_failure_goes_to_on_err() {
        let runner = TaskRunner::new(1);
        let (tx, rx) = mpsc::channel();
        let ok_tx = tx.clone();
        runner.compute_or_fail(
            || Err::<u32, _>(TraceError::NotFound(9)),
            move |_| ok_tx.send(None).unwrap(),
            move |e| tx.send(Some(e.is_recoverable())).unwrap(),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(true));
    }

    #[test]
    fn test_join_waits_for_all_tasks() {
        let runner = TaskRunner::new(0);
        assert_eq!(runner.workers(), 1);
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            runner.execute(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        runner.join();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 10);
    }

    #[test]
    fn test_join_from_own_worker_returns() {
        let runner = std::sync::Arc::new(TaskRunner::new(1));
        let other = TaskRunner::new(1);
        assert!(!runner.on_worker());

        let (tx, rx) = mpsc::channel();
        let inner = runner.clone();
        runner.execute(move || {
            let on_worker = inner.on_worker();
            inner.join();
            tx.send(on_worker).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(!other.on_worker());
        runner.join();
    }
}
