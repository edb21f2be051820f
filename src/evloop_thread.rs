//! One event loop per dedicated OS thread, plus a round-robin group of them.
//!
//! Ported from `angel::evloop_thread`/`evloop_thread_pool`
//! (`original_source/include/angel/evloop_thread.h`). The original spawns a
//! `std::thread`, builds an `evloop` *on that thread's stack*, and blocks
//! the constructor on a `std::promise`/`std::future` pair until the child
//! signals the loop is ready — this matters because `evloop`'s raw-pointer
//! `run_in_loop` plumbing requires the loop to exist before anyone can post
//! to it. Here [`std::sync::mpsc::sync_channel`] plays the same barrier
//! role: the spawned thread sends the loop's [`EventLoopHandle`] back the
//! moment [`EventLoop::new`] succeeds, and [`LoopThread::new`] blocks on
//! the receive before returning.

use std::sync::mpsc::sync_channel;
use std::thread::JoinHandle;

use crate::evloop::{EventLoop, EventLoopHandle};
use crate::error::ReactorResult;

/// Owns a background thread running exactly one [`EventLoop`] for its
/// entire life. Matches `angel::evloop_thread`.
pub struct LoopThread {
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread").finish()
    }
}

impl LoopThread {
    /// Spawns the thread and blocks until its loop is constructed and ready
    /// to receive submissions.
    pub fn new() -> ReactorResult<Self> {
        let (tx, rx) = sync_channel(0);
        let join = std::thread::Builder::new()
            .name("reactor-io".into())
            .spawn(move || {
                let mut evloop = match EventLoop::new() {
                    Ok(evloop) => evloop,
                    Err(e) => {
                        tracing::error!(error = %e, "loop thread failed to construct its EventLoop");
                        return;
                    }
                };
                let handle = evloop.handle();
                if tx.send(handle).is_err() {
                    return;
                }
                evloop.run();
            })
            .expect("failed to spawn loop thread");

        let handle = rx.recv().map_err(|_| {
            crate::error::ReactorError::UnsupportedBackend("loop thread exited before signaling readiness")
        })?;

        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    /// A cloneable handle to the loop running on this thread.
    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Requests the loop to quit and waits for its thread to exit. Safe to
    /// call more than once (subsequent calls are no-ops). Matches
    /// `evloop_thread::join`.
    pub fn join(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.join();
    }
}

/// A fixed-size, round-robin pool of [`LoopThread`]s, handed out to spread
/// connections across several I/O loops. Matches `angel::evloop_thread_pool`.
#[derive(Debug)]
pub struct LoopGroup {
    threads: Vec<LoopThread>,
    next: std::sync::atomic::AtomicUsize,
}

impl LoopGroup {
    /// Spawns `n` loop threads. `n == 0` is a valid (empty) group; callers
    /// fall back to the main loop in that case.
    pub fn new(n: usize) -> ReactorResult<Self> {
        let mut threads = Vec::with_capacity(n);
        for _ in 0..n {
            threads.push(LoopThread::new()?);
        }
        Ok(Self {
            threads,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Number of loop threads in the group.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Returns the next loop's handle in round-robin order. Panics if the
    /// group is empty; callers should check [`LoopGroup::is_empty`] first
    /// (matching `get_next_loop`'s "only called when `io_loop_group` is
    /// non-empty" precondition).
    pub fn next_loop(&self) -> EventLoopHandle {
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.threads.len();
        self.threads[i].handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn loop_thread_runs_submitted_work() {
        let mut lt = LoopThread::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        lt.handle().queue_in_loop(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        lt.join();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loop_group_cycles_without_panicking() {
        let group = LoopGroup::new(3).unwrap();
        assert_eq!(group.len(), 3);
        for _ in 0..7 {
            let _ = group.next_loop();
        }
    }
}
