//! Non-blocking `connect(2)` with retry/backoff for the client side of a
//! connection's lifecycle.
//!
//! Ported from `angel::connector_t` (`original_source/src/connector.h`/
//! `connector.cc`). The original keeps a raw `channel*` alive only for the
//! connecting window and destroys it the moment the socket is either
//! handed off (`connected()`) or abandoned (`retry()`); here [`Connector`]
//! is `Arc`-shared the same way [`crate::connection::Connection`] is, since
//! its channel handlers (`check`) need to call back into it, and its public
//! entry points (`connect`) are meant to be callable from `Client::start`
//! on the owning loop thread only, matching the original's usage (nothing
//! in `angel` ever touches a `connector_t` off its loop thread).

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use mio::Token;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::evloop::EventLoopHandle;
use crate::sockops;
use crate::timer::TimerId;
use crate::util::InetAddr;

/// `"tcp"` or `"udp"`, matching `connector_t::protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Invoked with the connected fd (still registered under no channel; the
/// caller takes ownership and decides what to do with it, typically wrapping
/// it in a [`crate::connection::Connection`]).
pub type NewConnectionHandler = Box<dyn Fn(RawFd) + Send>;
/// Invoked when the connect attempt fails and `keep_reconnect` is false.
pub type ConnectFailureHandler = Box<dyn Fn() + Send>;

struct ConnectorState {
    sockfd: Option<RawFd>,
    token: Option<Token>,
    wait_retry: bool,
    retry_timer_id: TimerId,
    has_connected: bool,
}

/// Drives one non-blocking connect attempt (with optional retry) to
/// `peer_addr`.
pub struct Connector {
    handle: EventLoopHandle,
    peer_addr: InetAddr,
    protocol: Protocol,
    pub keep_reconnect: bool,
    pub retry_interval_ms: i64,
    on_connect: Mutex<Option<NewConnectionHandler>>,
    on_fail: Mutex<Option<ConnectFailureHandler>>,
    state: Mutex<ConnectorState>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("peer_addr", &self.peer_addr)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Connector {
    /// Creates a connector bound to `handle`'s loop. `connect()` must be
    /// called explicitly to begin the attempt, matching the original's
    /// separate construction/`connect()` split.
    pub fn new(handle: EventLoopHandle, peer_addr: InetAddr, protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            handle,
            peer_addr,
            protocol,
            keep_reconnect: false,
            retry_interval_ms: 3000,
            on_connect: Mutex::new(None),
            on_fail: Mutex::new(None),
            state: Mutex::new(ConnectorState {
                sockfd: None,
                token: None,
                wait_retry: false,
                retry_timer_id: 0,
                has_connected: false,
            }),
        })
    }

    pub fn addr(&self) -> InetAddr {
        self.peer_addr
    }

    /// Installs the handler invoked once the socket is confirmed connected.
    pub fn set_on_connect(&self, handler: NewConnectionHandler) {
        *self.on_connect.lock().unwrap() = Some(handler);
    }

    /// Installs the handler invoked when a non-retrying attempt fails.
    pub fn set_on_fail(&self, handler: ConnectFailureHandler) {
        *self.on_fail.lock().unwrap() = Some(handler);
    }

    /// Starts (or restarts) the connect attempt. Must run on the owning
    /// loop's thread.
    pub fn connect(self: &Arc<Self>) {
        self.state.lock().unwrap().wait_retry = false;

        let domain = match self.peer_addr.addr() {
            std::net::SocketAddr::V4(_) => Domain::IPV4,
            std::net::SocketAddr::V6(_) => Domain::IPV6,
        };
        let ty = match self.protocol {
            Protocol::Tcp => Type::STREAM,
            Protocol::Udp => Type::DGRAM,
        };
        let sock = match Socket::new(domain, ty, None) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to create socket for connect");
                self.fail();
                return;
            }
        };
        if let Err(e) = sock.set_nonblocking(true) {
            tracing::error!(error = %e, "failed to set socket nonblocking");
            self.fail();
            return;
        }

        let fd = sock.as_raw_fd();
        std::mem::forget(sock);
        let sockaddr = SockAddr::from(self.peer_addr.addr());

        tracing::info!(fd, host = %self.peer_addr, "connect() issued");

        // Safety: `fd` was just created above and is not yet owned by any
        // Channel; `connect(2)` on it is a single syscall with no aliasing
        // concerns.
        let rc = unsafe { libc::connect(fd, sockaddr.as_ptr(), sockaddr.len()) };
        self.state.lock().unwrap().sockfd = Some(fd);

        let immediate_err = if rc == 0 {
            None
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                None
            } else {
                Some(err)
            }
        };

        match immediate_err {
            None if rc == 0 => self.connected(),
            None => self.connecting(fd),
            Some(err) => {
                tracing::error!(fd, error = %err, "connect failed immediately");
                self.abandon_and_retry();
            }
        }
    }

    fn connecting(self: &Arc<Self>, fd: RawFd) {
        tracing::debug!(fd, "connector is connecting");
        let c1 = self.clone();
        let c2 = self.clone();
        let c3 = self.clone();
        self.handle.run_in_loop(move |evloop| {
            let token = match evloop.add_channel(fd, false) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(fd, error = %e, "failed to register connecting channel");
                    return;
                }
            };
            c3.state.lock().unwrap().token = Some(token);
            if let Some(channel) = evloop.channel_mut(token) {
                channel.set_read_handler(move || c1.check());
                channel.set_write_handler(move || c2.check());
            }
            let _ = evloop.channel_enable_write(token);
        });
    }

    /// On Mac/BSD a connecting socket can report readable or writable
    /// depending on the backend, so `SO_ERROR` is consulted on either event
    /// rather than branching on which one fired (matches the original's
    /// comment on `connector_t::check`).
    fn check(self: &Arc<Self>) {
        if self.state.lock().unwrap().wait_retry {
            return;
        }
        let fd = match self.state.lock().unwrap().sockfd {
            Some(fd) => fd,
            None => return,
        };
        match sockops::take_error_raw(fd) {
            Ok(Some(err)) => {
                tracing::error!(fd, error = %err, retry_ms = self.retry_interval_ms, "connect failed, retrying");
                self.abandon_and_retry();
            }
            Ok(None) => self.connected(),
            Err(e) => {
                tracing::error!(fd, error = %e, "getsockopt(SO_ERROR) failed");
                self.abandon_and_retry();
            }
        }
    }

    fn connected(self: &Arc<Self>) {
        let already = {
            let mut state = self.state.lock().unwrap();
            let was = state.has_connected;
            state.has_connected = true;
            was
        };
        if already {
            return;
        }
        let (fd, token) = {
            let state = self.state.lock().unwrap();
            (state.sockfd.unwrap(), state.token)
        };
        tracing::debug!(fd, "connector is connected");

        let conn = self.clone();
        self.handle.run_in_loop(move |evloop| {
            if let Some(token) = token {
                evloop.remove_channel(token);
            }
            let handler = conn.on_connect.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                handler(fd);
            }
        });
    }

    fn abandon_and_retry(self: &Arc<Self>) {
        let (fd, token) = {
            let mut state = self.state.lock().unwrap();
            state.wait_retry = true;
            (state.sockfd.take(), state.token.take())
        };
        let conn = self.clone();
        self.handle.run_in_loop(move |evloop| {
            if let Some(token) = token {
                evloop.remove_channel(token);
            } else if let Some(fd) = fd {
                unsafe {
                    libc::close(fd);
                }
            }
        });

        if self.keep_reconnect {
            let retry = self.clone();
            let timer_id = self.handle.run_after(self.retry_interval_ms, move || {
                retry.connect();
            });
            self.state.lock().unwrap().retry_timer_id = timer_id;
        } else {
            self.fail();
        }
    }

    fn fail(&self) {
        if let Some(handler) = self.on_fail.lock().unwrap().as_ref() {
            handler();
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        if state.wait_retry {
            self.handle.cancel_timer(state.retry_timer_id);
        }
        if !state.wait_retry && !state.has_connected {
            if let Some(fd) = state.sockfd {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evloop::EventLoop;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let connector = Connector::new(handle.clone(), InetAddr::new(addr), Protocol::Tcp);

        let connected = Arc::new(AtomicBool::new(false));
        let c = connected.clone();
        let quit_handle = handle.clone();
        connector.set_on_connect(Box::new(move |fd| {
            c.store(true, Ordering::SeqCst);
            unsafe {
                libc::close(fd);
            }
            quit_handle.quit();
        }));

        let conn2 = connector.clone();
        handle.queue_in_loop(move |_| conn2.connect());
        evloop.run();
        assert!(connected.load(Ordering::SeqCst));
    }
}
