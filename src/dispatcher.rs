//! Polymorphic readiness-notification backend.
//!
//! `original_source/src/dispatcher.h` defines an abstract `dispatcher` base
//! class (`wait`/`add`/`remove`/`name`) with four concrete backends
//! (`epoll.cc`, plus poll/select/kqueue siblings named in spec.md §4.1).
//! Rather than hand-roll a second epoll/kqueue/poll/select layer, this
//! wraps `mio::Poll`, which already performs exactly that target-OS backend
//! selection (epoll on Linux, kqueue on BSD/macOS, IOCP on Windows) behind
//! one portable API — the same abstraction `examples/ryanseipp-rask-old`
//! and `examples/aalykiot-dune` both already build their reactors on. See
//! `DESIGN.md` for the resolved Open Question.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::channel::{EventSet, ERROR, READ, WRITE};

/// A readiness-notification backend: registers fds for interest and reports
/// which of them became ready (and for what) on each [`Dispatcher::wait`].
pub trait Dispatcher: Send {
    /// Blocks up to `timeout` (or indefinitely if `None`) for readiness
    /// events, appending `(token, events)` pairs to `out` and returning how
    /// many were appended.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(Token, EventSet)>) -> io::Result<usize>;

    /// Registers `fd` under `token` with the given interest. Must not
    /// already be registered.
    fn add(&mut self, fd: RawFd, token: Token, interest: EventSet) -> io::Result<()>;

    /// Changes the interest of an already-registered `fd`.
    fn update(&mut self, fd: RawFd, token: Token, interest: EventSet) -> io::Result<()>;

    /// Deregisters `fd` entirely.
    fn remove(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Backend name, for diagnostics (`"mio"`, matching `dispatcher::name()`).
    fn name(&self) -> &'static str;
}

fn to_interest(events: EventSet) -> Interest {
    match (events & READ != 0, events & WRITE != 0) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

fn from_mio_event(event: &mio::event::Event) -> EventSet {
    let mut set: EventSet = 0;
    if event.is_readable() {
        set |= READ;
    }
    if event.is_writable() {
        set |= WRITE;
    }
    if event.is_error() || event.is_read_closed() || event.is_write_closed() {
        set |= ERROR;
    }
    set
}

/// The default [`Dispatcher`], backed by `mio::Poll`.
pub struct MioDispatcher {
    poll: Poll,
    events: Events,
}

impl MioDispatcher {
    const EVLIST_INIT_SIZE: usize = 64;

    /// Creates a fresh backend with no registrations.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(Self::EVLIST_INIT_SIZE),
        })
    }

    /// Registry handle, for registering non-fd sources such as
    /// [`mio::Waker`] directly.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

impl Dispatcher for MioDispatcher {
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(Token, EventSet)>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }
        let mut n = 0;
        for event in self.events.iter() {
            out.push((event.token(), from_mio_event(event)));
            n += 1;
        }
        if self.events.capacity() == n {
            // Saturated this round; mio will grow on its own accord next
            // time since Events doesn't auto-resize, so grow it ourselves.
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }
        Ok(n)
    }

    fn add(&mut self, fd: RawFd, token: Token, interest: EventSet) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, to_interest(interest))
    }

    fn update(&mut self, fd: RawFd, token: Token, interest: EventSet) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, to_interest(interest))
    }

    fn remove(&mut self, fd: RawFd, _token: Token) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn name(&self) -> &'static str {
        "mio"
    }
}

impl std::fmt::Debug for MioDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioDispatcher").field("backend", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_readable_after_write() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut d = MioDispatcher::new().unwrap();
        d.add(a.as_raw_fd(), Token(1), READ).unwrap();

        use std::io::Write;
        let mut b = b;
        b.write_all(b"x").unwrap();

        let mut out = Vec::new();
        let n = d.wait(Some(Duration::from_secs(1)), &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].0, Token(1));
        assert_ne!(out[0].1 & READ, 0);
    }
}
