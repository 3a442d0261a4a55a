//! Serial work queues
//!
//! A `SerialQueue` is a named OS thread that runs submitted closures one
//! at a time in submission order. The Kit owns two: `commits`, which
//! totally orders state mutations, and `main`, on which every
//! subscriber-visible delivery happens.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    thread: ThreadId,
}

/// Handle to a serial queue; clones submit to the same thread
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<Inner>,
}

impl SerialQueue {
    /// Spawn the worker thread backing a new queue.
    ///
    /// The thread exits once every handle has been dropped and the queue
    /// has drained.
    pub fn new(name: &str) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job();
                }
            })
            .with_context(|| format!("Failed to spawn queue thread '{name}'"))?;

        debug!(queue = name, "Started serial queue");
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                sender,
                thread: handle.thread().id(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this queue's worker
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Enqueue `job` to run after everything already submitted
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.sender.send(Box::new(job)).is_err() {
            warn!(queue = %self.inner.name, "Queue stopped, dropping job");
        }
    }

    /// Run `job` inline when already on this queue, otherwise enqueue it
    pub fn ensure(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            job();
        } else {
            self.dispatch(job);
        }
    }

    /// Run `job` on the queue and wait for its result.
    ///
    /// Returns `None` if the queue has stopped. Called from the queue
    /// itself, the job runs inline instead of deadlocking.
    pub fn sync<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> Option<R> {
        if self.is_current() {
            return Some(job());
        }
        let (tx, rx) = std_mpsc::channel();
        self.dispatch(move || {
            let _ = tx.send(job());
        });
        rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_jobs_run_in_order() {
        let queue = SerialQueue::new("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().unwrap().push(i));
        }
        queue.sync(|| ()).unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_is_current_only_on_worker() {
        let queue = SerialQueue::new("test-current").unwrap();
        assert!(!queue.is_current());

        let inner = queue.clone();
        assert_eq!(queue.sync(move || inner.is_current()), Some(true));
        assert_eq!(queue.name(), "test-current");
    }

    #[test]
    fn test_ensure_runs_inline_on_queue() {
        let queue = SerialQueue::new("test-ensure").unwrap();
        let inner = queue.clone();

        let ran_inline = queue.sync(move || {
            let flag = Arc::new(Mutex::new(false));
            let set = Arc::clone(&flag);
            inner.ensure(move || *set.lock().unwrap() = true);
            let value = *flag.lock().unwrap();
            value
        });

        assert_eq!(ran_inline, Some(true));
    }

    #[test]
    fn test_sync_from_queue_does_not_deadlock() {
        let queue = SerialQueue::new("test-reentrant").unwrap();
        let inner = queue.clone();
        let value = queue.sync(move || inner.sync(|| 42));
        assert_eq!(value, Some(Some(42)));
    }
}
