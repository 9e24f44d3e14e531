//! Bounded task dispatcher for execute and resume work.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

/// Runs engine work on the tokio runtime with a concurrency limit.
///
/// Tracks in-flight tasks so callers can wait until the engine is idle,
/// i.e. every instance is terminal or suspended on external work.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements the in-flight count when a task ends, including on panic.
struct InFlight {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl Dispatcher {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Spawn a task once a slot is free.
    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        };
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::error!(task, "Dispatcher closed, task dropped");
                return;
            };
            tracing::trace!(task, "Task started");
            future.await;
        });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no task is running or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_after_tasks() {
        let dispatcher = Dispatcher::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            dispatcher.spawn("test", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_nested_spawn_counted() {
        let dispatcher = Dispatcher::new(1);
        let done = Arc::new(AtomicUsize::new(0));
        let inner = dispatcher.clone();
        let counter = done.clone();
        dispatcher.spawn("outer", async move {
            let counter = counter.clone();
            inner.spawn("inner", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        dispatcher.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_immediately() {
        Dispatcher::new(4).wait_idle().await;
    }
}
