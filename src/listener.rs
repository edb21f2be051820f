//! Accepts inbound TCP connections and hands the raw fd to a callback.
//!
//! Ported from `angel::listener_t` (`original_source/src/listener.h`/
//! `listener.cc`). The original's `handle_accept()` calls `accept()` once
//! per readable wakeup and relies on the edge-triggered-vs-level-triggered
//! behavior of its dispatcher backend to pick up any remaining pending
//! connections on the next wakeup; since [`crate::dispatcher::MioDispatcher`]
//! always registers level-triggered interest, this port instead loops
//! `accept()` until `EAGAIN`/`EWOULDBLOCK` so a burst of simultaneous
//! connects can't starve behind a single accept per event.
//!
//! The reserved `/dev/null` idle fd and the close-then-accept-then-close
//! EMFILE rescue are carried over unchanged: without a spare fd held in
//! reserve, a process at its fd limit can't even `accept()` the connection
//! in order to reject it, so the kernel's accept queue backs up forever.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use mio::Token;
use socket2::{Domain, Socket, Type};

use crate::error::{ReactorError, ReactorResult};
use crate::evloop::EventLoopHandle;
use crate::sockops;
use crate::util::InetAddr;

/// Invoked with the accepted fd (already set non-blocking) and the peer's
/// address. The callee takes ownership of the fd.
pub type NewConnectionHandler = Box<dyn Fn(RawFd, SocketAddr) + Send>;

/// Binds, listens, and accepts on one address, posting each accepted fd to
/// a user callback. Must be driven by the [`crate::evloop::EventLoop`]
/// behind `handle`.
pub struct Listener {
    handle: EventLoopHandle,
    listen_addr: InetAddr,
    listen_fd: Option<RawFd>,
    token: Option<Token>,
    idle_fd: AtomicI32,
    /// `TCP_NODELAY` on accepted sockets. Matches `listener_t::nodelay`, default `false`.
    pub nodelay: bool,
    /// `SO_KEEPALIVE` on accepted sockets. Matches `listener_t::keepalive`, default `true`.
    pub keepalive: bool,
    pub keepalive_idle: Duration,
    pub keepalive_intvl: Duration,
    pub keepalive_probes: u32,
    on_accept: Mutex<Option<NewConnectionHandler>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("listen_addr", &self.listen_addr)
            .field("listen_fd", &self.listen_fd)
            .finish()
    }
}

fn open_idle_fd() -> io::Result<RawFd> {
    let path = std::ffi::CString::new("/dev/null").unwrap();
    // Safety: `path` is a valid, NUL-terminated C string for the duration of
    // this call.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl Listener {
    /// Creates a listener for `listen_addr`. Binding and listening happen
    /// in [`Listener::listen`]; construction only reserves the idle fd used
    /// by the `EMFILE` rescue.
    pub fn new(handle: EventLoopHandle, listen_addr: InetAddr) -> ReactorResult<Self> {
        let idle_fd = open_idle_fd().map_err(ReactorError::Bind)?;
        Ok(Self {
            handle,
            listen_addr,
            listen_fd: None,
            token: None,
            idle_fd: AtomicI32::new(idle_fd),
            nodelay: false,
            keepalive: true,
            keepalive_idle: Duration::from_secs(0),
            keepalive_intvl: Duration::from_secs(0),
            keepalive_probes: 0,
            on_accept: Mutex::new(None),
        })
    }

    /// Installs the handler invoked for every accepted connection.
    pub fn set_on_accept(&self, handler: NewConnectionHandler) {
        *self.on_accept.lock().unwrap() = Some(handler);
    }

    pub fn listen_addr(&self) -> InetAddr {
        self.listen_addr
    }

    /// Binds and starts listening. Must be called from the owning loop's
    /// thread (it registers a channel directly rather than posting).
    pub fn listen(&mut self, evloop: &mut crate::evloop::EventLoop) -> ReactorResult<()> {
        let domain = match self.listen_addr.addr() {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let sock = Socket::new(domain, Type::STREAM, None).map_err(ReactorError::Bind)?;
        sockops::set_reuseaddr(&sock, true).map_err(ReactorError::Bind)?;
        sockops::set_nodelay(&sock, self.nodelay).map_err(ReactorError::Bind)?;
        sockops::set_keepalive(
            &sock,
            self.keepalive,
            self.keepalive_idle,
            self.keepalive_intvl,
            self.keepalive_probes,
        )
        .map_err(ReactorError::Bind)?;
        sockops::set_nonblocking(&sock, true).map_err(ReactorError::Bind)?;

        sock.bind(&self.listen_addr.addr().into())
            .map_err(ReactorError::Bind)?;
        sock.listen(1024).map_err(ReactorError::Listen)?;

        let fd = sock.as_raw_fd();
        std::mem::forget(sock);
        self.listen_fd = Some(fd);

        let token = evloop
            .add_channel(fd, true)
            .map_err(ReactorError::Listen)?;
        self.token = Some(token);

        tracing::info!(addr = %self.listen_addr, fd, "listening");
        Ok(())
    }

    /// Registers this listener's accept handler on `evloop`. Split from
    /// [`Listener::listen`] so the caller (typically
    /// [`crate::server::Server`]) can install `on_accept` in between.
    pub fn start_accepting(self: std::sync::Arc<Self>, evloop: &mut crate::evloop::EventLoop) {
        let token = self.token.expect("Listener::listen must run before start_accepting");
        let listener = self.clone();
        if let Some(channel) = evloop.channel_mut(token) {
            channel.set_read_handler(move || listener.handle_accept());
        }
    }

    /// Accepts every pending connection, looping until `EAGAIN`. On
    /// `EMFILE`/`ENFILE`, sheds one pending connection using the reserved
    /// idle fd rather than spinning on a readable-but-unacceptable listener.
    fn handle_accept(&self) {
        let fd = self.listen_fd.expect("listen() must run before accepting");
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // Safety: `storage`/`len` are correctly sized out-parameters for
            // `accept4(2)`; `fd` is the listening socket, owned for this
            // listener's lifetime.
            let connfd = unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if connfd >= 0 {
                match sockaddr_to_std(&storage) {
                    Some(peer) => {
                        tracing::debug!(fd = connfd, peer = %peer, "accepted connection");
                        let handler = self.on_accept.lock().unwrap();
                        if let Some(handler) = handler.as_ref() {
                            handler(connfd, peer);
                        } else {
                            unsafe {
                                libc::close(connfd);
                            }
                        }
                    }
                    None => unsafe {
                        libc::close(connfd);
                    },
                }
                continue;
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) => break,
                Some(libc::EPROTO) | Some(libc::ECONNABORTED) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    self.shed_one_connection(fd);
                    break;
                }
                _ => {
                    tracing::error!(error = %err, "accept4 failed");
                    break;
                }
            }
        }
    }

    fn shed_one_connection(&self, fd: RawFd) {
        tracing::warn!("fd limit reached, shedding one pending connection");
        unsafe {
            libc::close(self.idle_fd.load(Ordering::Relaxed));
        }
        let rc = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if rc >= 0 {
            unsafe {
                libc::close(rc);
            }
        }
        match open_idle_fd() {
            Ok(new_idle) => self.idle_fd.store(new_idle, Ordering::Relaxed),
            Err(e) => {
                tracing::error!(error = %e, "failed to reopen idle fd after EMFILE rescue");
            }
        }
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Some(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Some(SocketAddr::new(ip.into(), port))
        }
        _ => None,
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(fd) = self.listen_fd.take() {
            // The listening fd is owned by the Channel registered in
            // `listen()` (`hold_fd = true`); closing it again here would
            // double-close, so only close it if it was never registered.
            if self.token.is_none() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
        unsafe {
            libc::close(self.idle_fd.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evloop::EventLoop;
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn accepts_one_connection() {
        let mut evloop = EventLoop::new().unwrap();
        let handle = evloop.handle();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = Listener::new(handle.clone(), InetAddr::new(addr)).unwrap();
        listener.listen(&mut evloop).unwrap();
        let bound_addr = {
            let fd = listener.listen_fd.unwrap();
            let sock = unsafe { Socket::from_raw_fd(fd) };
            let local = sock.local_addr().unwrap().as_socket().unwrap();
            std::mem::forget(sock);
            local
        };

        let accepted = Arc::new(AtomicUsize::new(0));
        let a = accepted.clone();
        let quit_handle = handle.clone();
        listener.set_on_accept(Box::new(move |fd, _peer| {
            a.fetch_add(1, Ordering::SeqCst);
            unsafe {
                libc::close(fd);
            }
            quit_handle.quit();
        }));
        let listener = Arc::new(listener);
        listener.clone().start_accepting(&mut evloop);

        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let _ = TcpStream::connect(bound_addr);
        });

        evloop.run();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
