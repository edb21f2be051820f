//! Composes one [`Connector`] and one [`Connection`], with an optional
//! reconnect policy.
//!
//! Ported from the newer `angel::client` (`original_source/include/angel/client.h`,
//! `src/client.cc`) — not the older `Angel::`-namespaced `client.h` the
//! retrieval pack also carries, which this crate's glossary resolution
//! ignores in favor of the namespace the rest of the original still
//! actively develops. `client::get_next_id()`'s "all clients share conn_id"
//! comment is why [`crate::connection::next_connection_id`] is a single
//! process-wide counter shared with [`crate::server::Server`] rather than
//! one per `Client`.
//!
//! Unlike [`crate::server::Server`], whose wrapped close handler only ever
//! runs once per connection (swapped to `None` by
//! [`Connection::set_close_handler`](crate::connection::Connection::set_close_handler)'s
//! close protocol), a `Client`'s close handler must survive across
//! reconnects, so it is re-installed fresh on every
//! [`Client::establish`]-time `Connection`, rather than installed once and
//! relied upon to persist by itself.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::connection::{
    next_connection_id, CloseHandler, Connection, ConnectionHandler, ConnectionRef,
    HighWaterMarkHandler, MessageHandler,
};
use crate::connector::{Connector, Protocol};
use crate::evloop::{EventLoop, EventLoopHandle};
use crate::sockops;
use crate::thread_pool::{Policy, ThreadPool};
use crate::timer::TimerId;
use crate::util::InetAddr;

/// Fires once, when a connect attempt exhausts retries (or has none
/// configured) without ever succeeding.
pub type ConnectFailureHandler = Arc<dyn Fn() + Send + Sync>;
/// Fires if a single connect attempt doesn't resolve within
/// [`ClientOptions::connect_timeout_ms`].
pub type ConnectTimeoutHandler = Arc<dyn Fn() + Send + Sync>;

/// Tunable knobs for a [`Client`], matching `angel::client_options`.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub protocol: Protocol,
    /// Keep retrying on connect failure rather than giving up.
    pub keep_reconnect: bool,
    pub retry_interval_ms: i64,
    /// Reconnect automatically after the peer resets the connection.
    pub is_reconnect: bool,
    /// Quit the owning loop once this client's connection closes.
    pub is_quit_loop: bool,
    /// `0` disables the per-attempt connect timeout.
    pub connect_timeout_ms: i64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            keep_reconnect: false,
            retry_interval_ms: 3000,
            is_reconnect: false,
            is_quit_loop: false,
            connect_timeout_ms: 0,
        }
    }
}

struct Handlers {
    connection: Option<ConnectionHandler>,
    message: Option<MessageHandler>,
    close: Option<CloseHandler>,
    high_water_mark: Option<(usize, HighWaterMarkHandler)>,
    connect_fail: Option<ConnectFailureHandler>,
    connect_timeout: Option<ConnectTimeoutHandler>,
}

struct ClientState {
    connector: Option<Arc<Connector>>,
    conn: Option<ConnectionRef>,
    connected: bool,
    timeout_timer: TimerId,
}

/// A single reconnecting TCP (or UDP) client connection.
pub struct Client {
    handle: EventLoopHandle,
    peer_addr: Mutex<InetAddr>,
    options: Mutex<ClientOptions>,
    handlers: Mutex<Handlers>,
    state: Mutex<ClientState>,
    task_pool: Mutex<Option<Arc<ThreadPool>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_addr", &self.peer_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Client {
    pub fn new(handle: EventLoopHandle, peer_addr: InetAddr, options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            handle,
            peer_addr: Mutex::new(peer_addr),
            options: Mutex::new(options),
            handlers: Mutex::new(Handlers {
                connection: None,
                message: None,
                close: None,
                high_water_mark: None,
                connect_fail: None,
                connect_timeout: None,
            }),
            state: Mutex::new(ClientState {
                connector: None,
                conn: None,
                connected: false,
                timeout_timer: 0,
            }),
            task_pool: Mutex::new(None),
        })
    }

    pub fn peer_addr(&self) -> InetAddr {
        *self.peer_addr.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// The current connection, if any. Reconnects replace this with a
    /// fresh [`ConnectionRef`], so callers should re-fetch rather than hold
    /// one across a reconnect.
    pub fn conn(&self) -> Option<ConnectionRef> {
        self.state.lock().unwrap().conn.clone()
    }

    pub fn start_task_threads(&self, n: usize, policy: Policy) {
        *self.task_pool.lock().unwrap() = Some(ThreadPool::new(n, policy));
    }

    pub fn executor<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.task_pool.lock().unwrap().as_ref() {
            Some(pool) => pool.executor(task),
            None => tracing::error!("Client::executor called with no task thread pool started"),
        }
    }

    pub fn set_connection_handler(&self, handler: ConnectionHandler) {
        self.handlers.lock().unwrap().connection = Some(handler);
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        self.handlers.lock().unwrap().message = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.lock().unwrap().close = Some(handler);
    }

    pub fn set_high_water_mark_handler(&self, size: usize, handler: HighWaterMarkHandler) {
        self.handlers.lock().unwrap().high_water_mark = Some((size, handler));
    }

    pub fn set_connect_fail_handler(&self, handler: ConnectFailureHandler) {
        self.handlers.lock().unwrap().connect_fail = Some(handler);
    }

    pub fn set_connect_timeout_handler(&self, handler: ConnectTimeoutHandler) {
        self.handlers.lock().unwrap().connect_timeout = Some(handler);
    }

    /// Sends bytes on the current connection, if any. Dropped (with a
    /// warning) if not currently connected.
    pub fn send(&self, data: &[u8]) {
        match self.conn() {
            Some(conn) => conn.send(data),
            None => tracing::warn!(addr = %self.peer_addr(), "send() called while not connected, dropped"),
        }
    }

    /// Queues a zero-copy file send on the current connection, if any.
    pub fn send_file(&self, fd: RawFd, offset: i64, count: usize) {
        match self.conn() {
            Some(conn) => conn.send_file(fd, offset, count),
            None => tracing::warn!(addr = %self.peer_addr(), "send_file() called while not connected, dropped"),
        }
    }

    /// Blocks until the current connection's close handler has run. A
    /// no-op if there is no current connection.
    pub fn close_wait(&self) {
        if let Some(conn) = self.conn() {
            conn.close_wait();
        }
    }

    /// Begins connecting. Safe to call from any thread (matches the
    /// original's usage of `client::start()` from a thread other than the
    /// one running its loop): posts the actual connector setup to the
    /// owning loop, running synchronously if already there.
    pub fn start(self: &Arc<Self>) {
        let client = self.clone();
        self.handle.run_in_loop(move |_| client.start_in_loop());
    }

    /// Tears down any in-flight attempt or live connection and starts over
    /// against the same address. Matches `client::restart()`.
    pub fn restart(self: &Arc<Self>) {
        let client = self.clone();
        self.handle.run_in_loop(move |_| client.start_in_loop());
    }

    /// Like [`Client::restart`], but against a new address.
    pub fn restart_to(self: &Arc<Self>, addr: InetAddr) {
        *self.peer_addr.lock().unwrap() = addr;
        self.restart();
    }

    /// Disables reconnect-on-reset, drops any in-flight connector, and
    /// blocks until the live connection (if any) is fully closed. Matches
    /// `client::active_shutdown`.
    pub fn active_shutdown(self: &Arc<Self>) {
        self.state.lock().unwrap().connector = None;
        let conn = self.state.lock().unwrap().conn.clone();
        if let Some(conn) = conn {
            self.options.lock().unwrap().is_reconnect = false;
            conn.close_wait();
        }
    }

    fn start_in_loop(self: &Arc<Self>) {
        let protocol = self.options.lock().unwrap().protocol;
        let addr = self.peer_addr();
        let mut connector = Connector::new(self.handle.clone(), addr, protocol);

        {
            let opts = self.options.lock().unwrap();
            // Safe: `connector` was just constructed above, `strong_count`
            // is still 1, and no clone has escaped yet.
            if let Some(c) = Arc::get_mut(&mut connector) {
                c.keep_reconnect = opts.keep_reconnect;
                c.retry_interval_ms = opts.retry_interval_ms;
            }
        }

        let c1 = self.clone();
        connector.set_on_connect(Box::new(move |fd| c1.establish(fd)));
        let c2 = self.clone();
        connector.set_on_fail(Box::new(move || c2.connect_failed()));

        self.state.lock().unwrap().connector = Some(connector.clone());
        self.add_connect_timeout_timer();
        connector.connect();
    }

    fn add_connect_timeout_timer(self: &Arc<Self>) {
        let timeout_ms = self.options.lock().unwrap().connect_timeout_ms;
        if timeout_ms <= 0 {
            return;
        }
        let client = self.clone();
        let id = self.handle.run_after(timeout_ms, move || client.connect_timeout());
        self.state.lock().unwrap().timeout_timer = id;
    }

    fn cancel_connect_timeout_timer(&self) {
        let id = std::mem::replace(&mut self.state.lock().unwrap().timeout_timer, 0);
        if id > 0 {
            self.handle.cancel_timer(id);
        }
    }

    fn connect_timeout(self: &Arc<Self>) {
        tracing::warn!(addr = %self.peer_addr(), "connect attempt timed out");
        self.state.lock().unwrap().connector = None;
        if let Some(h) = self.handlers.lock().unwrap().connect_timeout.clone() {
            h();
        }
        if self.options.lock().unwrap().keep_reconnect {
            self.start_in_loop();
        }
    }

    fn connect_failed(self: &Arc<Self>) {
        self.cancel_connect_timeout_timer();
        tracing::warn!(addr = %self.peer_addr(), "failed to connect");
        if let Some(h) = self.handlers.lock().unwrap().connect_fail.clone() {
            h();
        }
    }

    /// Invoked (via `Connector::set_on_connect`) on the owning loop thread
    /// the moment the socket is confirmed connected. Re-enters the loop
    /// once more to get `&mut EventLoop` access for channel registration,
    /// the same raw-pointer re-entry [`crate::connection::Connection`]'s
    /// own handlers already rely on.
    fn establish(self: &Arc<Self>, fd: RawFd) {
        self.cancel_connect_timeout_timer();
        let client = self.clone();
        self.handle.run_in_loop(move |evloop| client.establish_in_loop(evloop, fd));
    }

    fn establish_in_loop(self: &Arc<Self>, evloop: &mut EventLoop, fd: RawFd) {
        let local = match sockops::local_addr_of(fd) {
            Ok(addr) => InetAddr::new(addr),
            Err(e) => {
                tracing::error!(fd, error = %e, "failed to read local address of connected socket");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };
        let token = match evloop.add_channel(fd, true) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(fd, error = %e, "failed to register connected socket");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };

        let id = next_connection_id();
        let peer = self.peer_addr();
        let conn = Connection::new(id, self.handle.clone(), token, fd, local, peer);

        let (message, close, high_water_mark, connection_handler) = {
            let h = self.handlers.lock().unwrap();
            (h.message.clone(), h.close.clone(), h.high_water_mark.clone(), h.connection.clone())
        };
        if let Some(h) = message {
            conn.set_message_handler(h);
        }
        if let Some((size, h)) = high_water_mark {
            conn.set_high_water_mark_handler(size, h);
        }

        let client = self.clone();
        conn.set_close_handler(Arc::new(move |c: &ConnectionRef| client.shutdown(c, close.clone())));

        if let Some(channel) = evloop.channel_mut(token) {
            let c1 = conn.clone();
            channel.set_read_handler(move || c1.handle_read());
            let c2 = conn.clone();
            channel.set_write_handler(move || c2.handle_write());
        }

        {
            let mut state = self.state.lock().unwrap();
            state.conn = Some(conn.clone());
            state.connected = true;
        }

        conn.establish(connection_handler);
    }

    /// The connection's persistent close handler: runs on every close,
    /// reconnected or not, so it is never swapped to `None` the way
    /// `Server`'s per-connection close wrapper is.
    fn shutdown(self: &Arc<Self>, conn: &ConnectionRef, user_close: Option<CloseHandler>) {
        self.state.lock().unwrap().connected = false;
        self.cancel_connect_timeout_timer();

        let (is_reconnect, is_quit_loop) = {
            let opts = self.options.lock().unwrap();
            (opts.is_reconnect, opts.is_quit_loop)
        };

        if is_quit_loop {
            self.handle.quit();
        } else if is_reconnect && conn.is_reset_by_peer() {
            self.start_in_loop();
        }

        if let Some(h) = user_close {
            h(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn connects_and_fires_connection_handler() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let client = Client::new(handle.clone(), InetAddr::new(addr), ClientOptions::default());

        let connected = Arc::new(AtomicBool::new(false));
        let c = connected.clone();
        let quit_handle = handle.clone();
        client.set_connection_handler(Arc::new(move |_conn| {
            c.store(true, Ordering::SeqCst);
            quit_handle.quit();
        }));

        client.start();
        evloop.run();
        assert!(connected.load(Ordering::SeqCst));
        assert!(client.is_connected());
    }

    #[test]
    fn reconnect_on_peer_reset_reaches_connection_handler_twice() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            // First connection: accept then immediately drop to force a
            // peer reset; second: accept and hold open.
            if let Ok((first, _)) = listener.accept() {
                drop(first);
            }
            let _ = listener.accept();
        });

        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let mut options = ClientOptions::default();
        options.is_reconnect = true;
        let client = Client::new(handle.clone(), InetAddr::new(addr), options);

        let connect_count = Arc::new(AtomicUsize::new(0));
        let n = connect_count.clone();
        let quit_handle = handle.clone();
        client.set_connection_handler(Arc::new(move |_conn| {
            let count = n.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 2 {
                quit_handle.quit();
            }
        }));

        client.start();
        std::thread::spawn({
            let handle = handle.clone();
            move || {
                std::thread::sleep(Duration::from_secs(2));
                handle.quit();
            }
        });
        evloop.run();
        assert!(connect_count.load(Ordering::SeqCst) >= 2);
    }
}
