//! Event-loop pools.
//!
//! A [`LoopPool`] owns `n` event loops. Each loop is one named OS thread
//! running a single-threaded compio runtime whose root task drains a job
//! queue; that parked dispatcher is what keeps an otherwise idle loop
//! alive. Posted jobs run on the loop thread and may spawn detached
//! async tasks onto its runtime (socket pumps, accept loops, sweeps).
//!
//! Loop handout is round-robin: the call order of
//! [`next_loop`](LoopPool::next_loop) defines the accept/I-O/worker
//! assignment, and binding a session's decode work to exactly one loop is
//! what serializes its pipeline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{EngineError, Result};

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// Cheap, cloneable reference to one event loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: flume::Sender<Job>,
    index: usize,
}

impl LoopHandle {
    /// Queue a job onto this loop's thread. Returns `false` once the
    /// pool has stopped.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Job::Run(Box::new(job))).is_ok()
    }

    /// Position of this loop within its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A fixed set of event loops with round-robin handout.
pub struct LoopPool {
    name: String,
    handles: Vec<LoopHandle>,
    receivers: Mutex<Vec<flume::Receiver<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Create `size` loops named `{name}-{index}`.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyPool`] when `size` is zero.
    pub fn new(size: usize, name: impl Into<String>) -> Result<Self> {
        if size == 0 {
            return Err(EngineError::EmptyPool);
        }
        let mut handles = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = flume::unbounded();
            handles.push(LoopHandle { tx, index });
            receivers.push(rx);
        }
        Ok(Self {
            name: name.into(),
            handles,
            receivers: Mutex::new(receivers),
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Spawn one thread per loop. Calling `run` twice is a no-op.
    pub fn run(&self) {
        let receivers = std::mem::take(&mut *self.receivers.lock());
        let mut threads = self.threads.lock();
        for (index, rx) in receivers.into_iter().enumerate() {
            let thread_name = format!("{}-{}", self.name, index);
            let spawned = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_loop(&rx));
            match spawned {
                Ok(handle) => {
                    debug!(thread = %thread_name, "event loop started");
                    threads.push(handle);
                }
                Err(e) => error!(thread = %thread_name, error = %e, "failed to spawn event loop"),
            }
        }
    }

    /// Stop every loop, then join its thread. Jobs posted after this are
    /// dropped.
    pub fn stop(&self) {
        for handle in &self.handles {
            let _ = handle.tx.send(Job::Shutdown);
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
    }

    /// Round-robin handout of the next loop.
    #[must_use]
    pub fn next_loop(&self) -> LoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[index].clone()
    }
}

/// One loop thread: a compio runtime whose root future drains the job
/// queue until shutdown. Dropping the runtime cancels any async tasks
/// jobs left behind.
fn run_loop(rx: &flume::Receiver<Job>) {
    let runtime = match compio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build loop runtime");
            return;
        }
    };
    runtime.block_on(async {
        while let Ok(job) = rx.recv_async().await {
            match job {
                Job::Run(job) => job(),
                Job::Shutdown => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn rejects_zero_size() {
        assert!(matches!(
            LoopPool::new(0, "empty"),
            Err(EngineError::EmptyPool)
        ));
    }

    #[test]
    fn round_robin_wraps() {
        let pool = LoopPool::new(3, "rr").unwrap();
        let order: Vec<usize> = (0..7).map(|_| pool.next_loop().index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn jobs_run_and_may_spawn_async_work() {
        let pool = LoopPool::new(2, "jobs").unwrap();
        pool.run();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            assert!(pool.next_loop().post(move || {
                let counter = Arc::clone(&counter);
                compio::runtime::spawn(async move {
                    compio::time::sleep(Duration::from_millis(1)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 4 {
            assert!(std::time::Instant::now() < deadline, "jobs never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.stop();
        assert!(!pool.next_loop().post(|| {}), "stopped pool refuses jobs");
    }
}
