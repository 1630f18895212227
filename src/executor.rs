//! Dispatcher contract between the bridge and its embedder.
//!
//! The bridge never runs an event loop. Work that must reach the
//! context-owning thread (thread-safe function calls and their teardown) is
//! handed to an [`Executor`] supplied by the embedder, which decides when it
//! runs. Dropping the executor releases whatever context it holds.

use crate::error::fatal_error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, trace};

/// A unit of work bound for the context-owning thread
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Embedder-supplied dispatcher.
///
/// Implementations must run dispatched work on the thread that owns the
/// engine context, one unit at a time, in submission order.
pub trait Executor: Send + Sync {
    /// Abort if the caller is not on the context-owning thread
    fn assert_current(&self);

    /// Schedule `work` to run later on the context-owning thread
    fn dispatch_async(&self, work: Work);
}

/// Queue-backed executor bound to the thread that created it.
///
/// Work submitted from any thread is buffered in an unbounded channel and
/// runs when the owner drains it with [`QueueExecutor::run_pending`] or
/// [`QueueExecutor::run_until`].
pub struct QueueExecutor {
    owner: ThreadId,
    sender: mpsc::UnboundedSender<Work>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Work>>,
    pending: AtomicUsize,
    executed: AtomicU64,
}

impl QueueExecutor {
    /// Create an executor owned by the current thread
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            owner: thread::current().id(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            pending: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
        }
    }

    /// Number of dispatched units not yet run
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Total units run so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Run every queued unit, including units queued while draining.
    ///
    /// Returns the number of units run.
    pub fn run_pending(&self) -> usize {
        self.assert_current();
        let mut ran = 0;
        loop {
            let next = match self.receiver.try_lock() {
                Ok(mut receiver) => receiver.try_recv(),
                // Re-entrant drain from inside a running unit
                Err(_) => break,
            };
            match next {
                Ok(work) => {
                    self.run_one(work);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if ran > 0 {
            trace!(ran, "Drained executor queue");
        }
        ran
    }

    /// Wait for and run exactly `count` units
    pub async fn run_until(&self, count: usize) -> usize {
        self.assert_current();
        let mut ran = 0;
        while ran < count {
            let work = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            match work {
                Some(work) => {
                    self.run_one(work);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    fn run_one(&self, work: Work) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        work();
        self.executed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for QueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for QueueExecutor {
    fn assert_current(&self) {
        if thread::current().id() != self.owner {
            fatal_error(
                "QueueExecutor::assert_current",
                "called off the context-owning thread",
            );
        }
    }

    fn dispatch_async(&self, work: Work) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(work).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!("Executor queue closed, dropping work");
        }
    }
}

impl Drop for QueueExecutor {
    fn drop(&mut self) {
        debug!(
            pending = self.pending(),
            executed = self.executed(),
            "Releasing executor"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_run_pending_in_order() {
        let executor = QueueExecutor::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = Arc::clone(&seen);
            executor.dispatch_async(Box::new(move || seen.lock().push(i)));
        }

        assert_eq!(executor.pending(), 3);
        assert_eq!(executor.run_pending(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(executor.pending(), 0);
        assert_eq!(executor.executed(), 3);
    }

    #[test]
    fn test_dispatch_from_other_thread() {
        let executor = Arc::new(QueueExecutor::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let remote = Arc::clone(&executor);
        let remote_hits = Arc::clone(&hits);
        thread::spawn(move || {
            remote.dispatch_async(Box::new(move || {
                remote_hits.fetch_add(1, Ordering::SeqCst);
            }));
        })
        .join()
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        executor.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_assert_current_off_thread() {
        let executor = Arc::new(QueueExecutor::new());
        executor.assert_current();

        let remote = Arc::clone(&executor);
        let result = thread::spawn(move || remote.assert_current()).join();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_until_waits_for_work() {
        let executor = Arc::new(QueueExecutor::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let remote = Arc::clone(&executor);
        let remote_hits = Arc::clone(&hits);
        let producer = thread::spawn(move || {
            for _ in 0..2 {
                let hits = Arc::clone(&remote_hits);
                remote.dispatch_async(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
        });

        assert_eq!(executor.run_until(2).await, 2);
        producer.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
