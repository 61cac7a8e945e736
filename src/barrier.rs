//! Completion barrier for flow workers.
//!
//! Every worker holds a `WorkerGuard` for its whole life. The guard is taken
//! before the worker is spawned and released when it is dropped, so a worker
//! that exits early, panics, or never starts is still accounted for.

#[cfg(test)]
use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
#[cfg(test)]
use std::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct CompletionBarrier {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

#[derive(Debug)]
pub(crate) struct WorkerGuard<'a> {
    barrier: &'a CompletionBarrier,
}

impl CompletionBarrier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self) -> WorkerGuard<'_> {
        *self.lock() += 1;
        WorkerGuard { barrier: self }
    }

    pub(crate) fn outstanding(&self) -> usize {
        *self.lock()
    }

    /// Block until every registered worker has released its guard
    pub(crate) fn wait(&self) {
        let mut outstanding = self.lock();
        while *outstanding > 0 {
            outstanding = self
                .idle
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `wait`, giving up after `timeout`. Returns whether the barrier drained.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.lock();
        while *outstanding > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            outstanding = self
                .idle
                .wait_timeout(outstanding, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let mut outstanding = self.barrier.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.barrier.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_after_all_guards_drop() {
        let barrier = CompletionBarrier::new();
        thread::scope(|s| {
            for i in 0..4u64 {
                let guard = barrier.register();
                s.spawn(move || {
                    thread::sleep(Duration::from_millis(10 * i));
                    drop(guard);
                });
            }
            assert!(barrier.outstanding() <= 4);
            barrier.wait();
            assert_eq!(barrier.outstanding(), 0);
        });
    }

    #[test]
    fn test_guard_released_on_panic() {
        let barrier = CompletionBarrier::new();
        let guard = barrier.register();
        let result = thread::scope(|s| {
            s.spawn(move || {
                let _guard = guard;
                panic!("worker failed");
            })
            .join()
        });
        assert!(result.is_err());
        assert_eq!(barrier.outstanding(), 0);
    }

    #[test]
    fn test_wait_timeout_with_outstanding_worker() {
        let barrier = CompletionBarrier::new();
        let guard = barrier.register();
        assert!(!barrier.wait_timeout(Duration::from_millis(20)));
        drop(guard);
        assert!(barrier.wait_timeout(Duration::from_millis(20)));
    }
}
