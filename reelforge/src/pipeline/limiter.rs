//! Bounded-parallelism admission gate for job executions.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Error, Result};

/// Snapshot of limiter occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub max: usize,
    pub running: usize,
    pub queued: usize,
}

/// Admits at most `max` tasks at a time.
///
/// Waiters are woken in arrival order: tokio's semaphore is fair, and every
/// finished task returns exactly one permit.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    running: AtomicUsize,
    queued: AtomicUsize,
}

/// Decrements a counter when dropped, so cancelled tasks are accounted for.
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting `max` concurrent tasks. A zero `max` is
    /// treated as one.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Run `task` once a slot is free, returning its result unchanged.
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = {
            let _waiting = CountGuard::enter(&self.queued);
            self.semaphore
                .acquire()
                .await
                .map_err(|_| Error::Other("concurrency limiter closed".to_string()))?
        };

        let _running = CountGuard::enter(&self.running);
        trace!(running = self.running(), max = self.max, "Task admitted");
        let result = task.await;
        drop(permit);
        result
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            max: self.max,
            running: self.running(),
            queued: self.queued(),
        }
    }
}
