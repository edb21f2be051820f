//! The reactor core: one dispatcher, one timer wheel, a channel table, and
//! a cross-thread task queue woken via a self-pipe.
//!
//! Ported from `angel::evloop` (`original_source/include/angel/evloop.h`,
//! `src/evloop.cc`). The original threads a raw `evloop*` through every
//! closure that needs to reach back into the loop (`channel::add()` does
//! `loop->run_in_loop([this]{ loop->add_channel(this); })`); Rust can't
//! alias a `&mut EventLoop` across threads that way, so [`EventLoopHandle`]
//! plays the role of that raw pointer for *cross-thread* submissions (it
//! queues a `Box<dyn FnOnce(&mut EventLoop)>` and wakes the self-pipe), while
//! still special-casing the same-thread path into a direct call the way the
//! original's `run_in_loop` does, using a thread-confined raw pointer that
//! is only ever non-null while [`EventLoop::run`] is executing on its own
//! thread (mirroring the original's `thread_local evloop *this_thread_loop`
//! one-loop-per-thread guard).
//!
//! The wake pipe and (if installed) the [`crate::signaler::Signaler`] are
//! dispatched directly inside [`EventLoop::run`]'s event loop rather than
//! through the generic [`Channel`] abstraction: both are entirely internal
//! to the loop and need no user-facing handler plumbing, and keeping them
//! out of the channel table sidesteps exactly the self-reference problem
//! [`EventLoopHandle`] exists to solve for everyone else.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use mio::Token;
use socket2::Socket;

use crate::channel::Channel;
use crate::dispatcher::{Dispatcher, MioDispatcher};
use crate::error::{ReactorError, ReactorResult};
use crate::signaler::Signaler;
use crate::sockops;
use crate::timer::{TimerId, TimerWheel};

const WAKE_TOKEN: Token = Token(0);
const SIGNALER_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

thread_local! {
    static THIS_THREAD_HAS_LOOP: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// A cloneable, `Send`+`Sync` reference to an [`EventLoop`], usable from any
/// thread to submit tasks, arm a quit, or cancel a timer. Matches the
/// subset of `angel::evloop`'s member functions documented "thread-safe".
#[derive(Clone)]
pub struct EventLoopHandle {
    queue: Arc<Mutex<Vec<Task>>>,
    wake_write: Arc<Socket>,
    owner_thread: ThreadId,
    live_ptr: Arc<AtomicPtr<EventLoop>>,
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHandle").field("owner_thread", &self.owner_thread).finish()
    }
}

impl EventLoopHandle {
    /// Whether the calling thread is the loop's own thread.
    pub fn is_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    fn with_live_loop<R>(&self, f: impl FnOnce(&mut EventLoop) -> R) -> Option<R> {
        if !self.is_loop_thread() {
            return None;
        }
        let ptr = self.live_ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // Safety: `ptr` is only ever non-null while `EventLoop::run` is
        // executing on `owner_thread`, and we've just confirmed the
        // current thread (which is therefore inside that same call stack,
        // since nothing else runs concurrently on a single OS thread) is
        // `owner_thread`. No other reference to the pointee is live.
        Some(f(unsafe { &mut *ptr }))
    }

    /// Runs `f` immediately if called from the loop's own thread;
    /// otherwise equivalent to [`EventLoopHandle::queue_in_loop`]. Matches
    /// `evloop::run_in_loop`.
    pub fn run_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        if self.with_live_loop(|evloop| f(evloop)).is_some() {
            return;
        }
        self.queue_in_loop(f);
    }

    /// Appends `f` to the loop's task queue, waking it iff the queue was
    /// previously empty. Matches `evloop::queue_in_loop`'s coalesced-wake
    /// rule: the submitter never blocks, and the pipe sees at most one
    /// byte per empty-to-non-empty transition.
    pub fn queue_in_loop<F>(&self, f: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.is_empty();
        q.push(Box::new(f));
        drop(q);
        if was_empty {
            self.wakeup(0);
        }
    }

    /// Schedules `cb` to run once, `delay_ms` from now. Must be called from
    /// the loop's own thread (matching actual usage in the original: every
    /// call site is already inside a handler running on that loop).
    pub fn run_after<F>(&self, delay_ms: i64, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.with_live_loop(|evloop| evloop.timer.run_after(delay_ms, cb))
            .expect("run_after must be called from the owning EventLoop's thread")
    }

    /// Schedules `cb` to run every `interval_ms`. Same thread requirement
    /// as [`EventLoopHandle::run_after`].
    pub fn run_every<F>(&self, interval_ms: i64, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.with_live_loop(|evloop| evloop.timer.run_every(interval_ms, cb))
            .expect("run_every must be called from the owning EventLoop's thread")
    }

    /// Cancels a timer from any thread by posting to the loop. A no-op if
    /// `id` is unknown or already fired. Matches `evloop::cancel_timer`.
    pub fn cancel_timer(&self, id: TimerId) {
        self.run_in_loop(move |evloop| evloop.timer.cancel_timer(id));
    }

    /// Requests the loop to quit. Returns immediately without waiting for
    /// the loop to exit. Matches `evloop::quit`.
    pub fn quit(&self) {
        self.wakeup(1);
    }

    fn wakeup(&self, v: u8) {
        use io::Write;
        let mut w = &*self.wake_write;
        if let Err(e) = w.write(&[v]) {
            tracing::warn!(error = %e, "failed to write to loop wake pipe");
        }
    }
}

/// The single-threaded reactor loop. Owns its dispatcher, timer wheel, and
/// channel table; must be run and dropped on the same thread it was
/// created on.
pub struct EventLoop {
    dispatcher: MioDispatcher,
    timer: TimerWheel,
    channels: HashMap<Token, Channel>,
    active: Vec<Token>,
    next_token: usize,
    wake_read_fd: RawFd,
    queue: Arc<Mutex<Vec<Task>>>,
    wake_write: Arc<Socket>,
    is_quit: bool,
    owner_thread: ThreadId,
    live_ptr: Arc<AtomicPtr<EventLoop>>,
    signaler: Option<Signaler>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("channels", &self.channels.len())
            .field("timers", &self.timer.len())
            .finish()
    }
}

impl EventLoop {
    /// Creates a new loop on the calling thread. Fails with
    /// [`ReactorError::DuplicateLoop`] if this thread already owns one,
    /// matching `evloop::evloop`'s `this_thread_loop` guard.
    pub fn new() -> ReactorResult<Self> {
        if THIS_THREAD_HAS_LOOP.with(|c| c.get()) {
            return Err(ReactorError::DuplicateLoop);
        }

        let dispatcher = MioDispatcher::new().map_err(|_| ReactorError::UnsupportedBackend("mio::Poll::new failed"))?;
        let (wake_read, wake_write) = sockops::socketpair().map_err(ReactorError::SocketPair)?;
        wake_read.set_nonblocking(true).map_err(ReactorError::SocketPair)?;
        let wake_read_fd = wake_read.as_raw_fd();
        std::mem::forget(wake_read);

        let mut evloop = Self {
            dispatcher,
            timer: TimerWheel::new(),
            channels: HashMap::new(),
            active: Vec::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            wake_read_fd,
            queue: Arc::new(Mutex::new(Vec::new())),
            wake_write: Arc::new(wake_write),
            is_quit: false,
            owner_thread: std::thread::current().id(),
            live_ptr: Arc::new(AtomicPtr::new(ptr::null_mut())),
            signaler: None,
        };
        evloop
            .dispatcher
            .add(evloop.wake_read_fd, WAKE_TOKEN, crate::channel::READ)
            .map_err(ReactorError::SocketPair)?;

        THIS_THREAD_HAS_LOOP.with(|c| c.set(true));
        tracing::info!(backend = evloop.dispatcher.name(), "event loop created");
        Ok(evloop)
    }

    /// A cloneable, cross-thread-safe handle to this loop.
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            queue: self.queue.clone(),
            wake_write: self.wake_write.clone(),
            owner_thread: self.owner_thread,
            live_ptr: self.live_ptr.clone(),
        }
    }

    /// Installs the process-wide [`Signaler`] on this loop. Fails if a
    /// signaler already exists anywhere in the process.
    pub fn install_signaler(&mut self) -> ReactorResult<&Signaler> {
        let signaler = Signaler::new(SIGNALER_TOKEN)?;
        self.dispatcher
            .add(signaler.read_fd(), SIGNALER_TOKEN, crate::channel::READ)
            .map_err(ReactorError::SocketPair)?;
        self.signaler = Some(signaler);
        Ok(self.signaler.as_ref().unwrap())
    }

    /// The installed signaler, if any.
    pub fn signaler(&self) -> Option<&Signaler> {
        self.signaler.as_ref()
    }

    /// Registers a channel, allocating a fresh token and enabling read
    /// interest by default (matching `channel::add`'s "Read event is
    /// enabled by default"). Returns the token it was registered under.
    pub fn add_channel(&mut self, fd: RawFd, hold_fd: bool) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let mut channel = if hold_fd {
            Channel::new_owned(fd, token)
        } else {
            Channel::new_borrowed(fd, token)
        };
        channel.enable_read(&mut self.dispatcher)?;
        self.channels.insert(token, channel);
        Ok(token)
    }

    /// Removes and drops a channel, deregistering its fd. Matches
    /// `channel::remove`.
    pub fn remove_channel(&mut self, token: Token) {
        if let Some(mut channel) = self.channels.remove(&token) {
            let _ = channel.disable_all(&mut self.dispatcher);
        }
    }

    /// Mutable access to a registered channel, for (re)installing handlers
    /// or toggling interest. Only valid on the loop's own thread.
    pub fn channel_mut(&mut self, token: Token) -> Option<&mut Channel> {
        self.channels.get_mut(&token)
    }

    /// The dispatcher backing this loop, for enabling/disabling interest
    /// directly against a channel.
    pub fn dispatcher_mut(&mut self) -> &mut MioDispatcher {
        &mut self.dispatcher
    }

    /// Enables write interest for the channel registered under `token`, if
    /// it still exists. Splits the `channels`/`dispatcher` fields directly
    /// rather than going through [`EventLoop::channel_mut`] +
    /// [`EventLoop::dispatcher_mut`], since borrowing both via separate
    /// method calls on the same `&mut EventLoop` does not borrow-check.
    pub fn channel_enable_write(&mut self, token: Token) -> io::Result<()> {
        match self.channels.get_mut(&token) {
            Some(channel) => channel.enable_write(&mut self.dispatcher),
            None => Ok(()),
        }
    }

    /// Disables write interest for the channel registered under `token`, if
    /// it still exists. See [`EventLoop::channel_enable_write`] for why this
    /// exists instead of composing `channel_mut`/`dispatcher_mut`.
    pub fn channel_disable_write(&mut self, token: Token) -> io::Result<()> {
        match self.channels.get_mut(&token) {
            Some(channel) => channel.disable_write(&mut self.dispatcher),
            None => Ok(()),
        }
    }

    /// Enables read interest for the channel registered under `token`, if it
    /// still exists. See [`EventLoop::channel_enable_write`].
    pub fn channel_enable_read(&mut self, token: Token) -> io::Result<()> {
        match self.channels.get_mut(&token) {
            Some(channel) => channel.enable_read(&mut self.dispatcher),
            None => Ok(()),
        }
    }

    /// Disables read interest for the channel registered under `token`, if
    /// it still exists. See [`EventLoop::channel_enable_write`].
    pub fn channel_disable_read(&mut self, token: Token) -> io::Result<()> {
        match self.channels.get_mut(&token) {
            Some(channel) => channel.disable_read(&mut self.dispatcher),
            None => Ok(()),
        }
    }

    /// Schedules `cb` after `delay_ms`. Only safe from the loop's own
    /// thread; see [`EventLoopHandle::run_after`] for the cross-thread
    /// entry point.
    pub fn run_after<F: FnMut() + Send + 'static>(&mut self, delay_ms: i64, cb: F) -> TimerId {
        self.timer.run_after(delay_ms, cb)
    }

    /// Schedules `cb` every `interval_ms`. Same thread requirement as
    /// [`EventLoop::run_after`].
    pub fn run_every<F: FnMut() + Send + 'static>(&mut self, interval_ms: i64, cb: F) -> TimerId {
        self.timer.run_every(interval_ms, cb)
    }

    /// Cancels a timer directly (no posting needed: we already hold
    /// `&mut self`).
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timer.cancel_timer(id);
    }

    /// Requests this loop to quit at the end of the current iteration.
    pub fn quit(&mut self) {
        self.is_quit = true;
    }

    /// Runs the loop until [`EventLoop::quit`] (or a remote
    /// [`EventLoopHandle::quit`]) is observed. Matches `evloop::run`.
    pub fn run(&mut self) {
        self.is_quit = false;
        let self_ptr = self as *mut EventLoop;
        self.live_ptr.store(self_ptr, Ordering::Release);

        while !self.is_quit {
            let timeout = self.timer.timeout();
            let mut events = Vec::new();
            let n = match self.dispatcher.wait(timeout, &mut events) {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "dispatcher wait failed");
                    0
                }
            };

            if n > 0 {
                self.active.clear();
                for (token, ev) in events {
                    if token == WAKE_TOKEN {
                        self.drain_wake_pipe();
                        continue;
                    }
                    if token == SIGNALER_TOKEN {
                        if let Some(signaler) = &self.signaler {
                            signaler.handle_events();
                        }
                        continue;
                    }
                    if let Some(channel) = self.channels.get_mut(&token) {
                        channel.set_trigger_events(ev);
                        self.active.push(token);
                    }
                }
                for token in self.active.drain(..) {
                    if let Some(channel) = self.channels.get_mut(&token) {
                        channel.handle_event();
                    }
                }
            } else {
                self.timer.tick();
            }

            self.do_functors();
        }

        // Final drain so no cross-thread submission made right before quit
        // is lost.
        loop {
            let empty = self.queue.lock().unwrap().is_empty();
            if empty {
                break;
            }
            self.do_functors();
        }

        self.live_ptr.store(ptr::null_mut(), Ordering::Release);
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            // Safety: `wake_read_fd` is a nonblocking socket owned by this
            // loop for its entire lifetime.
            let n = unsafe { libc::read(self.wake_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            if buf[..n as usize].iter().any(|&b| b != 0) {
                self.is_quit = true;
            }
            if (n as usize) < buf.len() {
                break;
            }
        }
    }

    fn do_functors(&mut self) {
        let tasks = {
            let mut q = self.queue.lock().unwrap();
            std::mem::take(&mut *q)
        };
        for task in tasks {
            task(self);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read_fd);
        }
        THIS_THREAD_HAS_LOOP.with(|c| c.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[test]
    fn second_loop_on_same_thread_is_rejected() {
        let _first = EventLoop::new().unwrap();
        let err = EventLoop::new().unwrap_err();
        assert!(matches!(err, ReactorError::DuplicateLoop));
    }

    #[test]
    fn queue_in_loop_runs_before_quit_completes() {
        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        handle.queue_in_loop(move |_| {
            r.fetch_add(1, AtomicOrdering::SeqCst);
        });
        handle.quit();
        evloop.run();
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn cross_thread_queue_wakes_loop() {
        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let quit_handle = handle.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.queue_in_loop(move |_| {
                r.fetch_add(1, AtomicOrdering::SeqCst);
            });
            quit_handle.quit();
        });
        evloop.run();
        worker.join().unwrap();
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn run_in_loop_executes_immediately_on_loop_thread() {
        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        handle.queue_in_loop(move |evloop| {
            let inner_handle = evloop.handle();
            o.lock().unwrap().push("before");
            inner_handle.run_in_loop(move |_| {
                // Runs synchronously within this same call, since we're on
                // the loop thread with a live pointer.
            });
            o.lock().unwrap().push("after");
        });
        handle.quit();
        evloop.run();
        assert_eq!(*order.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn timer_fires_and_quits_loop() {
        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let quit_handle = handle.clone();
        handle.queue_in_loop(move |evloop| {
            let h = evloop.handle();
            h.run_after(1, move || {
                f.fetch_add(1, AtomicOrdering::SeqCst);
                quit_handle.quit();
            });
        });
        evloop.run();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }
}
