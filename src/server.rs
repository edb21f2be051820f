//! Owns the listening socket, an optional I/O loop group, an optional CPU
//! task pool, and the process's live connection registry.
//!
//! Ported from `angel::server` (`original_source/include/angel/server.h`,
//! `src/server.cc`). The original's accept flow is: accept on the main
//! loop, pick a worker loop round-robin, build the channel+connection *on
//! that worker loop* (posted there if it's a different thread), then post
//! the map insertion back to the main loop so the registry is mutated from
//! exactly one thread no matter which loop accepted the connection. The
//! user's close handler is wrapped rather than installed directly: after it
//! runs, `Server` posts its own map-removal back to the main loop, matching
//! `remove_connection`'s "invokes close_handler then posts map erase"
//! sequencing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{
    next_connection_id, CloseHandler, Connection, ConnectionHandler, ConnectionId, ConnectionRef,
    HighWaterMarkHandler, MessageHandler,
};
use crate::error::ReactorResult;
use crate::evloop::{EventLoop, EventLoopHandle};
use crate::evloop_thread::LoopGroup;
use crate::listener::Listener;
use crate::sockops;
use crate::thread_pool::{Policy, ThreadPool};
use crate::util::InetAddr;

struct Handlers {
    connection: Option<ConnectionHandler>,
    message: Option<MessageHandler>,
    close: Option<CloseHandler>,
    high_water_mark: Option<(usize, HighWaterMarkHandler)>,
}

/// A listening server: accepts connections, fans them out across an
/// optional [`LoopGroup`], and tracks every live [`Connection`] by id.
pub struct Server {
    handle: EventLoopHandle,
    listen_addr: InetAddr,
    listener: Mutex<Option<Listener>>,
    listener_arc: Mutex<Option<Arc<Listener>>>,
    io_threads: Mutex<Option<LoopGroup>>,
    task_pool: Mutex<Option<Arc<ThreadPool>>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionRef>>,
    handlers: Mutex<Handlers>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.listen_addr)
            .field("connections", &self.connections.lock().unwrap().len())
            .finish()
    }
}

impl Server {
    /// Reserves the listening address (binding happens in [`Server::start`]).
    pub fn new(handle: EventLoopHandle, listen_addr: InetAddr) -> ReactorResult<Arc<Self>> {
        let listener = Listener::new(handle.clone(), listen_addr)?;
        Ok(Arc::new(Self {
            handle,
            listen_addr,
            listener: Mutex::new(Some(listener)),
            listener_arc: Mutex::new(None),
            io_threads: Mutex::new(None),
            task_pool: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Handlers {
                connection: None,
                message: None,
                close: None,
                high_water_mark: None,
            }),
        }))
    }

    pub fn listen_addr(&self) -> InetAddr {
        self.listen_addr
    }

    /// Spawns `n` loop threads to spread accepted connections across,
    /// matching `server::start_io_threads`. Must be called before
    /// [`Server::start`].
    pub fn start_io_threads(&self, n: usize) -> ReactorResult<()> {
        *self.io_threads.lock().unwrap() = Some(LoopGroup::new(n)?);
        Ok(())
    }

    /// Starts a CPU task pool for [`Server::executor`], matching
    /// `server::start_task_threads`.
    pub fn start_task_threads(&self, n: usize, policy: Policy) {
        *self.task_pool.lock().unwrap() = Some(ThreadPool::new(n, policy));
    }

    /// Submits CPU-bound work to the task pool started by
    /// [`Server::start_task_threads`]. A no-op (logged) if no pool exists.
    pub fn executor<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.task_pool.lock().unwrap().as_ref() {
            Some(pool) => pool.executor(task),
            None => tracing::error!("Server::executor called with no task thread pool started"),
        }
    }

    pub fn set_nodelay(&self, on: bool) {
        if let Some(l) = self.listener.lock().unwrap().as_mut() {
            l.nodelay = on;
        }
    }

    pub fn set_keepalive(&self, on: bool) {
        if let Some(l) = self.listener.lock().unwrap().as_mut() {
            l.keepalive = on;
        }
    }

    pub fn set_keepalive_idle(&self, idle: Duration) {
        if let Some(l) = self.listener.lock().unwrap().as_mut() {
            l.keepalive_idle = idle;
        }
    }

    pub fn set_keepalive_intvl(&self, intvl: Duration) {
        if let Some(l) = self.listener.lock().unwrap().as_mut() {
            l.keepalive_intvl = intvl;
        }
    }

    pub fn set_keepalive_probes(&self, probes: u32) {
        if let Some(l) = self.listener.lock().unwrap().as_mut() {
            l.keepalive_probes = probes;
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

    /// Number of currently-registered connections. Safe from any thread:
    /// the map itself is the synchronization point, even though it is only
    /// ever *mutated* from the main loop.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<ConnectionRef> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    /// Runs `f` against connection `id` on the main loop, if it still
    /// exists. Safe to call from any thread, matching `server::for_one`.
    pub fn for_one<F>(self: &Arc<Self>, id: ConnectionId, f: F)
    where
        F: FnOnce(&ConnectionRef) + Send + 'static,
    {
        let server = self.clone();
        self.handle.run_in_loop(move |_| {
            if let Some(conn) = server.connections.lock().unwrap().get(&id) {
                f(conn);
            }
        });
    }

    /// Runs `f` against every live connection on the main loop. Safe to
    /// call from any thread, matching `server::for_each`.
    pub fn for_each<F>(self: &Arc<Self>, f: F)
    where
        F: Fn(&ConnectionRef) + Send + 'static,
    {
        let server = self.clone();
        self.handle.run_in_loop(move |_| {
            for conn in server.connections.lock().unwrap().values() {
                f(conn);
            }
        });
    }

    /// Requests the main loop to quit. Returns immediately.
    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Forks and detaches the current process, matching `server::daemon()`.
    /// Only the child returns.
    pub fn daemon() -> std::io::Result<()> {
        crate::util::daemonize()
    }

    /// Ignores `SIGPIPE`, installs `SIGINT`/`SIGTERM` handlers that quit the
    /// main loop, then starts accepting. Must run on the main loop's thread.
    pub fn start(self: &Arc<Self>, evloop: &mut EventLoop) -> ReactorResult<()> {
        // Safety: sets a process-wide signal disposition; no shared state is
        // touched.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        self.install_shutdown_signals(evloop);

        let mut listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .expect("Server::start must only be called once");
        listener.listen(evloop)?;

        let server = self.clone();
        listener.set_on_accept(Box::new(move |fd, peer| server.handle_accept(fd, peer)));

        let listener = Arc::new(listener);
        listener.clone().start_accepting(evloop);
        *self.listener_arc.lock().unwrap() = Some(listener);

        tracing::info!(addr = %self.listen_addr, "server started");
        Ok(())
    }

    fn install_shutdown_signals(self: &Arc<Self>, evloop: &mut EventLoop) {
        if evloop.signaler().is_none() {
            if let Err(e) = evloop.install_signaler() {
                tracing::warn!(error = %e, "failed to install signal handling, SIGINT/SIGTERM will not quit the server cleanly");
                return;
            }
        }
        let signaler = evloop.signaler().expect("just installed above");
        let h1 = self.handle.clone();
        let h2 = self.handle.clone();
        if let Err(e) = signaler.add_signal(libc::SIGINT, move || h1.quit()) {
            tracing::warn!(error = %e, "failed to register SIGINT handler");
        }
        if let Err(e) = signaler.add_signal(libc::SIGTERM, move || h2.quit()) {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
        }
    }

    fn get_next_loop(&self) -> EventLoopHandle {
        let threads = self.io_threads.lock().unwrap();
        match threads.as_ref() {
            Some(group) if !group.is_empty() => group.next_loop(),
            _ => self.handle.clone(),
        }
    }

    fn handle_accept(self: &Arc<Self>, fd: RawFd, peer: SocketAddr) {
        let server = self.clone();
        let worker = self.get_next_loop();
        let conn_handle = worker.clone();
        worker.run_in_loop(move |evloop| server.create_connection(evloop, conn_handle, fd, peer));
    }

    fn create_connection(
        self: &Arc<Self>,
        evloop: &mut EventLoop,
        handle: EventLoopHandle,
        fd: RawFd,
        peer: SocketAddr,
    ) {
        let local = match sockops::local_addr_of(fd) {
            Ok(addr) => InetAddr::new(addr),
            Err(e) => {
                tracing::error!(fd, error = %e, "failed to read local address of accepted socket");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };
        let token = match evloop.add_channel(fd, true) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(fd, error = %e, "failed to register accepted socket");
                unsafe {
                    libc::close(fd);
                }
                return;
            }
        };

        let id = next_connection_id();
        let conn = Connection::new(id, handle, token, fd, local, InetAddr::new(peer));

        let (message, close, high_water_mark, connection_handler) = {
            let handlers = self.handlers.lock().unwrap();
            (
                handlers.message.clone(),
                handlers.close.clone(),
                handlers.high_water_mark.clone(),
                handlers.connection.clone(),
            )
        };
        if let Some(h) = message {
            conn.set_message_handler(h);
        }
        if let Some((size, h)) = high_water_mark {
            conn.set_high_water_mark_handler(size, h);
        }
        let server = self.clone();
        conn.set_close_handler(Arc::new(move |c: &ConnectionRef| {
            if let Some(h) = &close {
                h(c);
            }
            server.remove_connection(c.id());
        }));

        if let Some(channel) = evloop.channel_mut(token) {
            let c1 = conn.clone();
            channel.set_read_handler(move || c1.handle_read());
            let c2 = conn.clone();
            channel.set_write_handler(move || c2.handle_write());
        }

        let server = self.clone();
        let conn_for_map = conn.clone();
        self.handle
            .run_in_loop(move |_| {
                server.connections.lock().unwrap().insert(conn_for_map.id(), conn_for_map);
            });

        conn.establish(connection_handler);
    }

    fn remove_connection(self: &Arc<Self>, id: ConnectionId) {
        let server = self.clone();
        self.handle.run_in_loop(move |_| {
            server.connections.lock().unwrap().remove(&id);
        });
    }
}
