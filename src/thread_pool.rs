//! A fixed or cached pool of worker threads for CPU-bound offload.
//!
//! Ported from `angel::thread_pool` (`original_source/include/angel/thread_pool.h`,
//! header-only in the original). The original guards a single task queue
//! and worker count behind one `std::mutex`/`std::condition_variable` pair;
//! rather than split that into several locks (which would only add
//! lock-ordering hazards for no benefit) this keeps the same single-mutex
//! shape, with `crossbeam_channel` standing in for the hand-rolled
//! `std::queue` + condvar — the same crate `examples/ryanseipp-rask-old`
//! already reaches for to hand connections between threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A unit of CPU-bound work submitted to a [`ThreadPool`]. Matches
/// `thread_pool::task_callback_t`.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sizing policy, matching `thread_pool::policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Always exactly `n` workers.
    Fixed,
    /// Starts at `n` workers and grows by one whenever a submission finds
    /// every worker already busy, up to one worker per queued task. Never
    /// shrinks back down, matching the original's comment that a cached
    /// pool "only grows".
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    /// Workers drain the remaining queue, then exit.
    Shutdown,
    /// Workers abandon the queue and exit immediately.
    Stop,
}

enum WorkItem {
    Task(Task),
    Stop,
}

/// A pool of worker threads draining one shared task queue.
pub struct ThreadPool {
    policy: Policy,
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    state: Mutex<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: AtomicUsize,
    queued: AtomicUsize,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("policy", &self.policy)
            .field("workers", &self.worker_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadPool {
    /// Starts `n` workers under `policy`. `n == 0` is rejected by spawning
    /// exactly one worker instead, matching the original's "at least one
    /// thread" behavior for a pool that is actually started.
    pub fn new(n: usize, policy: Policy) -> Arc<Self> {
        let n = n.max(1);
        let (tx, rx) = unbounded();
        let pool = Arc::new(Self {
            policy,
            tx,
            rx,
            state: Mutex::new(PoolState::Running),
            workers: Mutex::new(Vec::with_capacity(n)),
            worker_count: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        });
        for _ in 0..n {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(self: &Arc<Self>) {
        let pool = self.clone();
        let handle = std::thread::Builder::new()
            .name("reactor-pool".into())
            .spawn(move || worker_loop(pool))
            .expect("failed to spawn pool worker");
        self.workers.lock().unwrap().push(handle);
        self.worker_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Submits `task`. Under [`Policy::Cached`], grows the pool by one
    /// worker if every existing worker already has a task in flight,
    /// matching the original's `qtask.size() == workers.size()` check.
    pub fn executor<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if *self.state.lock().unwrap() != PoolState::Running {
            tracing::warn!("task submitted to a shut-down thread pool, ignored");
            return;
        }
        let pending = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.policy == Policy::Cached && pending >= self.worker_count.load(Ordering::SeqCst) {
            self.spawn_worker();
        }
        let _ = self.tx.send(WorkItem::Task(Box::new(task)));
    }

    /// Lets queued work finish, then joins every worker. Matches
    /// `thread_pool::shutdown`.
    pub fn shutdown(&self) {
        self.stop_with(PoolState::Shutdown);
    }

    /// Abandons any queued work and joins every worker immediately. Matches
    /// `thread_pool::stop`.
    pub fn stop(&self) {
        self.stop_with(PoolState::Stop);
    }

    fn stop_with(&self, target: PoolState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != PoolState::Running {
                return;
            }
            *state = target;
        }
        let n = self.worker_count.load(Ordering::SeqCst);
        for _ in 0..n {
            let _ = self.tx.send(WorkItem::Stop);
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for w in workers {
            let _ = w.join();
        }
    }
}

fn worker_loop(pool: Arc<ThreadPool>) {
    loop {
        let item = match pool.rx.recv() {
            Ok(item) => item,
            Err(_) => break,
        };
        match item {
            WorkItem::Stop => {
                let stop_immediately = *pool.state.lock().unwrap() == PoolState::Stop;
                if stop_immediately || pool.rx.is_empty() {
                    break;
                }
                // Queue still has work and this is a shutdown (drain, not
                // abandon): put the exit request back so it's retried once
                // the remaining tasks have been picked up, rather than
                // being silently lost to one worker's premature check.
                let _ = pool.tx.send(WorkItem::Stop);
            }
            WorkItem::Task(task) => {
                pool.queued.fetch_sub(1, Ordering::SeqCst);
                task();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fixed_pool_runs_submitted_tasks() {
        let pool = ThreadPool::new(2, Policy::Fixed);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let d = done.clone();
            pool.executor(move || {
                d.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(100));
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn cached_pool_grows_under_load() {
        let pool = ThreadPool::new(1, Policy::Cached);
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let s = started.clone();
            pool.executor(move || {
                s.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
            });
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(pool.worker_count.load(Ordering::SeqCst) >= 1);
        pool.shutdown();
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stop_abandons_unstarted_tasks() {
        let pool = ThreadPool::new(1, Policy::Fixed);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let r = ran.clone();
            pool.executor(move || {
                r.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
            });
        }
        pool.stop();
        assert!(ran.load(Ordering::SeqCst) < 50);
    }
}
