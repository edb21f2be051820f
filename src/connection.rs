//! Per-connection state machine: buffers, the ordered send-task queue, TTL,
//! and the close protocol.
//!
//! Ported from `angel::connection` (`original_source/include/angel/connection.h`,
//! `src/connection.cc`). The original's `byte_stream_queue` /
//! `send_file_queue` / `send_complete_handler_queue` are three parallel
//! `std::queue`s tagged by a shared `send_id`, drained in lockstep by
//! checking `.front().first == next_id` on whichever queue's turn it is;
//! here they're a single [`VecDeque<SendTask>`], so "whose turn is it"
//! degenerates to "pop the front if its kind allows progress" without the
//! three-way interleave check (see `DESIGN.md` for the resolved Open
//! Question). Everything else — fast-path write before queuing,
//! high-water-mark firing off the loop, the close-handler swap-before-invoke
//! to prevent re-entrant double-close, and TTL re-arm on every read/send —
//! mirrors the original line for line.
//!
//! A connection needs to schedule work against itself from within its own
//! channel handlers (`enable_write`, `run_after` for the TTL timer) and from
//! any other thread (`send`, `close`, `set_ttl`). Matching the original's
//! `shared_from_this()` pattern, [`Connection`] is always handed out as
//! `Arc<Connection>` ([`ConnectionRef`]); handlers capture a clone.

use std::any::Any;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use mio::Token;

use crate::buffer::Buffer;
use crate::evloop::EventLoopHandle;
use crate::sockops;
use crate::timer::TimerId;
use crate::util::InetAddr;

/// Identifies a connection, unique for the life of the process (servers and
/// clients share one counter, matching `client::get_next_id`'s "All clients
/// share conn_id" comment).
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next process-wide connection id. Shared by
/// [`crate::server::Server`] and [`crate::client::Client`] so ids never
/// collide between a process's servers and its clients.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// A shared, reference-counted connection, matching `connection_ptr`.
pub type ConnectionRef = Arc<Connection>;

/// Invoked once the connection is fully established and registered.
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked whenever new data has been read into the input buffer.
pub type MessageHandler = Arc<dyn Fn(&ConnectionRef, &mut Buffer) + Send + Sync>;
/// Invoked exactly once, on the owning loop, when the connection closes.
pub type CloseHandler = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water-mark threshold.
pub type HighWaterMarkHandler = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked once all previously queued sends have drained; fires at most once.
pub type SendCompleteHandler = Box<dyn FnOnce(&ConnectionRef) + Send>;

/// `Connecting -> Connected -> {Closing -> Closed | Closed}`, matching
/// spec.md's state diagram (the original's `connected`/`closing`/`closed`
/// enum, plus the `connecting` state the original's constructor starts in
/// before `establish()` runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

struct FileTask {
    fd: RawFd,
    offset: i64,
    count: usize,
}

enum SendTask {
    ByteStream { len: usize },
    FileStream(FileTask),
    CompletionMarker(SendCompleteHandler),
}

struct SendQueue {
    tasks: VecDeque<(u64, SendTask)>,
    send_id: u64,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            send_id: 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

struct ConnectionIo {
    input_buf: Buffer,
    output_buf: Buffer,
    queue: SendQueue,
    high_water_mark: usize,
    ttl_ms: i64,
    ttl_timer_id: TimerId,
    context: Option<Box<dyn Any + Send>>,
}

struct CloseWait {
    done: Mutex<bool>,
    cv: Condvar,
}

/// A higher-level wrapper over a [`crate::channel::Channel`] that manages a
/// single TCP (or UDP) connection exclusively: buffers, send queue, TTL, and
/// the close protocol.
pub struct Connection {
    id: ConnectionId,
    handle: EventLoopHandle,
    token: Token,
    fd: RawFd,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    state: Mutex<ConnectionState>,
    reset_by_peer: AtomicBool,
    io: Mutex<ConnectionIo>,
    message_handler: Mutex<Option<MessageHandler>>,
    close_handler: Mutex<Option<CloseHandler>>,
    high_water_mark_handler: Mutex<Option<HighWaterMarkHandler>>,
    close_wait: CloseWait,
    _closing_epoch: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("state", &*self.state.lock().unwrap())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Connection {
    /// Wraps an already-accepted/connected, already-registered fd. Callers
    /// (`Server`/`Client`) are responsible for calling [`Connection::establish`]
    /// once handlers are installed, matching the original's two-phase
    /// `connection(id, loop, fd)` constructor then `establish()`.
    pub fn new(
        id: ConnectionId,
        handle: EventLoopHandle,
        token: Token,
        fd: RawFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> ConnectionRef {
        tracing::info!(id, fd, state = "<Connecting>", "connection created");
        Arc::new(Self {
            id,
            handle,
            token,
            fd,
            local_addr,
            peer_addr,
            state: Mutex::new(ConnectionState::Connecting),
            reset_by_peer: AtomicBool::new(false),
            io: Mutex::new(ConnectionIo {
                input_buf: Buffer::new(),
                output_buf: Buffer::new(),
                queue: SendQueue::new(),
                high_water_mark: 0,
                ttl_ms: 0,
                ttl_timer_id: 0,
                context: None,
            }),
            message_handler: Mutex::new(None),
            close_handler: Mutex::new(None),
            high_water_mark_handler: Mutex::new(None),
            close_wait: CloseWait {
                done: Mutex::new(false),
                cv: Condvar::new(),
            },
            _closing_epoch: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn is_reset_by_peer(&self) -> bool {
        self.reset_by_peer.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Connected
    }

    fn is_closing(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Closing
    }

    fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() == ConnectionState::Closed
    }

    fn state_str(&self) -> &'static str {
        match *self.state.lock().unwrap() {
            ConnectionState::Connecting => "<Connecting>",
            ConnectionState::Connected => "<Connected>",
            ConnectionState::Closing => "<Closing>",
            ConnectionState::Closed => "<Closed>",
        }
    }

    /// Stores opaque, connection-scoped data. Must not hold a strong
    /// reference back to this connection (spec.md §9): prefer a weak
    /// back-reference if the context needs to reach the connection.
    pub fn set_context<T: Any + Send>(&self, ctx: T) {
        self.io.lock().unwrap().context = Some(Box::new(ctx));
    }

    /// Runs `f` against the stored context, if any and if it downcasts to
    /// `T`, returning its result.
    ///
    /// Not thread-safe, matching the original's `get_context()`: callers
    /// set context in the connection handler and read it back from the
    /// message/close handlers, all of which run on the owning loop thread.
    /// Takes a closure rather than handing back `&T` so the `io` guard
    /// stays held for the whole borrow instead of being dropped underneath
    /// a reference to its contents.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let io = self.io.lock().unwrap();
        let ctx = io.context.as_ref()?.downcast_ref::<T>()?;
        Some(f(ctx))
    }

    /// Installs the message handler. Only meaningful before the connection
    /// is established (set once by `Server`/`Client`).
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.lock().unwrap() = Some(handler);
    }

    /// Installs the close handler. Swapped to `None` before invocation so
    /// user code may re-enter safely (spec.md §4.7).
    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    /// Installs the high-water-mark handler and threshold; `size == 0`
    /// disables the callback.
    pub fn set_high_water_mark_handler(&self, size: usize, handler: HighWaterMarkHandler) {
        self.io.lock().unwrap().high_water_mark = size;
        *self.high_water_mark_handler.lock().unwrap() = Some(handler);
    }

    /// Sets an idle TTL: the connection force-closes if no read or send
    /// activity occurs within `ms`. Thread-safe.
    pub fn set_ttl(self: &ConnectionRef, ms: i64) {
        if ms <= 0 {
            return;
        }
        let conn = self.clone();
        self.handle.run_in_loop(move |_| {
            let old = {
                let mut io = conn.io.lock().unwrap();
                io.ttl_ms = ms;
                io.ttl_timer_id
            };
            if old > 0 {
                conn.handle.cancel_timer(old);
            }
            conn.arm_ttl_timer();
        });
    }

    fn arm_ttl_timer(self: &Arc<Self>) {
        let ttl_ms = self.io.lock().unwrap().ttl_ms;
        if ttl_ms <= 0 {
            return;
        }
        let conn = self.clone();
        let id = self.handle.run_after(ttl_ms, move || {
            conn.close();
        });
        self.io.lock().unwrap().ttl_timer_id = id;
    }

    fn update_ttl_timer(self: &Arc<Self>) {
        let timer_id = self.io.lock().unwrap().ttl_timer_id;
        if timer_id == 0 {
            return;
        }
        self.handle.cancel_timer(timer_id);
        self.arm_ttl_timer();
    }

    /// Called by `Server`/`Client` once handlers are installed and the
    /// channel has been added to its loop: transitions Connecting ->
    /// Connected and fires `connection_handler`. Must run on the owning
    /// loop thread.
    pub fn establish(self: &ConnectionRef, connection_handler: Option<ConnectionHandler>) {
        *self.state.lock().unwrap() = ConnectionState::Connected;
        tracing::info!(id = self.id, fd = self.fd, state = self.state_str(), "connection established");
        if let Some(handler) = connection_handler {
            handler(self);
        }
    }

    /// Runs on the channel's read handler: drains the socket into the input
    /// buffer and dispatches to the message handler, or to the close
    /// protocol on EOF/error.
    pub fn handle_read(self: &ConnectionRef) {
        let n = {
            let mut io = self.io.lock().unwrap();
            io.input_buf.read_fd(self.fd)
        };
        match n {
            Ok(0) => {
                self.reset_by_peer.store(true, Ordering::Release);
                self.force_close();
                return;
            }
            Ok(n) => {
                tracing::debug!(id = self.id, fd = self.fd, n, "read from connection");
                let handler = self.message_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    // Swap the input buffer out from behind `io`'s guard before
                    // calling into user code: the handler typically calls
                    // `send()`, which on this same (loop) thread re-enters
                    // `send_in_loop` and locks `io` again. Holding the guard
                    // across the callback would deadlock on `Mutex`'s
                    // non-reentrancy.
                    let mut local_buf = std::mem::take(&mut self.io.lock().unwrap().input_buf);
                    handler(self, &mut local_buf);
                    self.io.lock().unwrap().input_buf = local_buf;
                } else {
                    self.io.lock().unwrap().input_buf.retrieve_all();
                }
            }
            Err(e) => self.handle_io_error(&e),
        }
        self.update_ttl_timer();
    }

    /// Runs on the channel's write handler: drains the head of the send
    /// queue in `send_id` order until either the queue empties or a write
    /// would block.
    pub fn handle_write(self: &ConnectionRef) {
        if self.is_closed() {
            tracing::warn!(id = self.id, fd = self.fd, "write on a closed connection, ignored");
            return;
        }

        while self.drain_one_task() {}

        let (empty, closing) = {
            let io = self.io.lock().unwrap();
            (io.queue.is_empty(), self.is_closing())
        };
        if empty {
            self.disable_write();
            if closing {
                self.force_close();
            }
        }
    }

    /// Attempts to progress exactly the front task by one write. Returns
    /// whether any progress was made (so the caller can keep draining
    /// multiple completed tasks within one writable wake without blocking on
    /// one that's still partial).
    fn drain_one_task(self: &ConnectionRef) -> bool {
        enum DrainResult {
            Bytes(Vec<u8>),
            File(RawFd, i64, usize),
        }

        let is_marker = matches!(
            self.io.lock().unwrap().queue.tasks.front(),
            Some((_, SendTask::CompletionMarker(_)))
        );

        if is_marker {
            let handler = match self.io.lock().unwrap().queue.tasks.pop_front() {
                Some((_, SendTask::CompletionMarker(handler))) => Some(handler),
                other => {
                    if let Some(t) = other {
                        self.io.lock().unwrap().queue.tasks.push_front(t);
                    }
                    None
                }
            };
            return match handler {
                Some(handler) => {
                    handler(self);
                    true
                }
                None => false,
            };
        }

        let request = {
            let io = self.io.lock().unwrap();
            match io.queue.tasks.front() {
                Some((send_id, SendTask::ByteStream { len })) => {
                    let data = io.output_buf.peek()[..*len].to_vec();
                    Some((*send_id, DrainResult::Bytes(data)))
                }
                Some((send_id, SendTask::FileStream(f))) => {
                    Some((*send_id, DrainResult::File(f.fd, f.offset, f.count)))
                }
                _ => None,
            }
        };
        let Some((send_id, payload)) = request else {
            return false;
        };

        let outcome = match payload {
            DrainResult::Bytes(data) => sockops::write_raw(self.fd, &data),
            DrainResult::File(fd, offset, count) => sockops::send_file_raw(self.fd, fd, offset, count),
        };

        match outcome {
            Ok(0) => false,
            Ok(n) => {
                let mut io = self.io.lock().unwrap();
                let mut retrieve_bytes = None;
                let done = match io.queue.tasks.front_mut() {
                    Some((_, SendTask::ByteStream { len })) => {
                        *len -= n;
                        retrieve_bytes = Some(n);
                        *len == 0
                    }
                    Some((_, SendTask::FileStream(f))) => {
                        f.offset += n as i64;
                        f.count -= n;
                        f.count == 0
                    }
                    _ => false,
                };
                if let Some(n) = retrieve_bytes {
                    io.output_buf.retrieve(n);
                }
                if done {
                    tracing::debug!(id = self.id, send_id, "send task complete");
                    io.queue.tasks.pop_front();
                }
                true
            }
            Err(e) if is_transient(&e) => false,
            Err(e) => {
                self.handle_io_error(&e);
                false
            }
        }
    }

    fn handle_io_error(self: &ConnectionRef, err: &std::io::Error) {
        if is_transient(err) {
            tracing::warn!(id = self.id, fd = self.fd, error = %err, "transient I/O error");
        } else {
            tracing::error!(id = self.id, fd = self.fd, error = %err, "fatal I/O error");
            self.force_close();
        }
    }

    fn disable_write(&self) {
        let conn_token = self.token;
        self.handle.run_in_loop(move |evloop| {
            let _ = evloop.channel_disable_write(conn_token);
        });
    }

    fn enable_write(&self) {
        let conn_token = self.token;
        self.handle.run_in_loop(move |evloop| {
            let _ = evloop.channel_enable_write(conn_token);
        });
    }

    /// Sends raw bytes (thread-safe). Copies across threads since the
    /// payload must outlive the calling thread's stack frame.
    pub fn send(self: &ConnectionRef, data: &[u8]) {
        if self.handle.is_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.handle.queue_in_loop(move |_| conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &ConnectionRef, data: &[u8]) {
        if self.is_closed() {
            tracing::warn!(id = self.id, fd = self.fd, state = self.state_str(), "send on a closed connection, ignored");
            return;
        }
        // Only ever reached on the owning loop thread (directly above, or via
        // the `queue_in_loop` closure), so re-arming the TTL here can call
        // straight through to `run_after` without a cross-thread panic.
        self.update_ttl_timer();
        tracing::debug!(id = self.id, len = data.len(), "new byte stream");

        let mut written = 0usize;
        let fast_path = self.io.lock().unwrap().queue.is_empty();
        if fast_path {
            match sockops::write_raw(self.fd, data) {
                Ok(n) => written = n,
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    self.handle_io_error(&e);
                    return;
                }
            }
        }

        let remaining = &data[written..];
        if !remaining.is_empty() {
            let crossed = {
                let mut io = self.io.lock().unwrap();
                io.output_buf.append(remaining);
                let send_id = io.queue.send_id;
                io.queue.send_id += 1;
                io.queue.tasks.push_back((send_id, SendTask::ByteStream { len: remaining.len() }));
                tracing::debug!(id = self.id, send_id, remaining = remaining.len(), "queued");
                io.high_water_mark > 0 && io.output_buf.readable() >= io.high_water_mark
            };

            self.enable_write();
            if crossed {
                if let Some(handler) = self.high_water_mark_handler.lock().unwrap().clone() {
                    let conn = self.clone();
                    self.handle.queue_in_loop(move |_| handler(&conn));
                }
            }
        }
    }

    /// Queues a zero-copy send of `count` bytes from `fd` at `offset`
    /// (thread-safe). Unlike [`Connection::send`], file sends always go
    /// through the writable-event drain rather than attempting a fast-path
    /// write, to keep the ordering logic simple (spec.md §4.7).
    pub fn send_file(self: &ConnectionRef, fd: RawFd, offset: i64, count: usize) {
        let conn = self.clone();
        self.handle.run_in_loop(move |_| conn.send_file_in_loop(fd, offset, count));
    }

    fn send_file_in_loop(self: &ConnectionRef, fd: RawFd, offset: i64, count: usize) {
        if self.is_closed() {
            tracing::warn!(id = self.id, fd = self.fd, "send_file on a closed connection, ignored");
            return;
        }
        // Runs only on the owning loop thread (via `run_in_loop` above), same
        // reasoning as `send_in_loop`.
        self.update_ttl_timer();
        let send_id = {
            let mut io = self.io.lock().unwrap();
            let send_id = io.queue.send_id;
            io.queue.send_id += 1;
            io.queue.tasks.push_back((send_id, SendTask::FileStream(FileTask { fd, offset, count })));
            send_id
        };
        tracing::debug!(id = self.id, send_id, fd, offset, count, "file stream queued");
        self.enable_write();
    }

    /// Registers a one-shot callback to run once every send task queued
    /// before this call has drained (thread-safe).
    pub fn set_send_complete_handler(self: &ConnectionRef, handler: SendCompleteHandler) {
        let conn = self.clone();
        self.handle.run_in_loop(move |_| {
            {
                let mut io = conn.io.lock().unwrap();
                let send_id = io.queue.send_id;
                io.queue.send_id += 1;
                io.queue.tasks.push_back((send_id, SendTask::CompletionMarker(handler)));
            }
            conn.enable_write();
        });
    }

    /// Cooperative close: if the send queue is non-empty, defers closing
    /// until it drains; otherwise closes immediately. Thread-safe.
    pub fn close(self: &ConnectionRef) {
        let conn = self.clone();
        self.handle.run_in_loop(move |_| conn.handle_close(false));
    }

    /// Bypasses the send queue and closes immediately, used on fatal errors
    /// and peer resets.
    fn force_close(self: &ConnectionRef) {
        self.handle_close(true);
    }

    fn handle_close(self: &ConnectionRef, forced: bool) {
        if self.is_closed() {
            return;
        }
        {
            let mut io = self.io.lock().unwrap();
            if io.ttl_timer_id > 0 {
                self.handle.cancel_timer(io.ttl_timer_id);
                io.ttl_timer_id = 0;
            }
        }
        let queue_empty = self.io.lock().unwrap().queue.is_empty();
        if !forced && !queue_empty {
            *self.state.lock().unwrap() = ConnectionState::Closing;
            return;
        }
        *self.state.lock().unwrap() = ConnectionState::Closed;
        tracing::info!(id = self.id, fd = self.fd, state = "<Closed>", "connection closed");

        let conn_token = self.token;
        let conn = self.clone();
        self.handle.run_in_loop(move |evloop| {
            evloop.remove_channel(conn_token);
            // Swap to None before invoking so the handler may drop its last
            // strong reference to this connection without re-entering.
            let handler = conn.close_handler.lock().unwrap().take();
            if let Some(handler) = handler {
                handler(&conn);
            }
            *conn.close_wait.done.lock().unwrap() = true;
            conn.close_wait.cv.notify_all();
        });
    }

    /// Blocks the calling thread until the close handler has run. Must not
    /// be called from the connection's own loop thread (it would deadlock
    /// waiting on itself).
    pub fn close_wait(self: &ConnectionRef) {
        self.close();
        let mut done = self.close_wait.done.lock().unwrap();
        while !*done {
            done = self.close_wait.cv.wait(done).unwrap();
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evloop::EventLoop;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn make_pair_conn(evloop: &mut EventLoop) -> (ConnectionRef, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        std::mem::forget(a);
        let token = evloop.add_channel(fd, true).unwrap();
        let handle = evloop.handle();
        let local = InetAddr::new("127.0.0.1:1".parse().unwrap());
        let peer = InetAddr::new("127.0.0.1:2".parse().unwrap());
        let conn = Connection::new(1, handle, token, fd, local, peer);
        let c = conn.clone();
        evloop.channel_mut(token).unwrap().set_read_handler(move || c.handle_read());
        let c2 = conn.clone();
        evloop.channel_mut(token).unwrap().set_write_handler(move || c2.handle_write());
        (conn, b)
    }

    #[test]
    fn send_fast_path_writes_immediately() {
        let mut evloop = EventLoop::new().unwrap();
        let (conn, mut peer) = make_pair_conn(&mut evloop);
        *conn.state.lock().unwrap() = ConnectionState::Connected;
        conn.send(b"hello");

        use std::io::Read;
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_zero_marks_reset_by_peer_and_closes() {
        let mut evloop = EventLoop::new().unwrap();
        let (conn, peer) = make_pair_conn(&mut evloop);
        *conn.state.lock().unwrap() = ConnectionState::Connected;
        drop(peer);

        conn.handle_read();
        assert!(conn.is_reset_by_peer());
        assert!(conn.is_closed());
    }

    #[test]
    fn close_with_pending_send_defers_to_closing() {
        let mut evloop = EventLoop::new().unwrap();
        let (conn, _peer) = make_pair_conn(&mut evloop);
        *conn.state.lock().unwrap() = ConnectionState::Connected;
        {
            let mut io = conn.io.lock().unwrap();
            io.queue.tasks.push_back((1, SendTask::ByteStream { len: 4 }));
            io.output_buf.append(b"data");
        }
        conn.handle_close(false);
        assert!(conn.is_closing());
    }

    #[test]
    fn high_water_mark_fires_once() {
        let mut evloop = EventLoop::new().unwrap();
        let (conn, _peer) = make_pair_conn(&mut evloop);
        *conn.state.lock().unwrap() = ConnectionState::Connected;

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        conn.set_high_water_mark_handler(
            8,
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        {
            let mut io = conn.io.lock().unwrap();
            io.queue.tasks.push_back((1, SendTask::ByteStream { len: 1 }));
        }
        conn.send(b"0123456789");
        let handle = evloop.handle();
        handle.quit();
        evloop.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
