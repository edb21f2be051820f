//! A single registered I/O event source: an fd, the interest the owner
//! wants, the interest the kernel last reported, and the handlers to run
//! for each.
//!
//! Ported from `angel::channel` (`original_source/src/channel.h`/
//! `channel.cc`). The original has `channel` hold a back-pointer to its
//! `evloop` and call `loop->dispatcher->add/remove` directly from
//! `enable_read`/`enable_write`/etc., with `add()`/`remove()` (full
//! registration into the loop's `channel_map`) posted via
//! `run_in_loop`/`queue_in_loop` so they only ever run on the owning
//! thread. Here `Channel` is a plain struct owned by
//! [`crate::evloop::EventLoop`]'s channel table (matching the teacher's
//! `Slab`-of-connections ownership in `listener.rs`/`worker.rs`) with no
//! back-pointer; `enable_read`/`enable_write`/`disable_*` take the
//! [`crate::dispatcher::Dispatcher`] explicitly, and full add/remove-from-loop
//! is `EventLoop::add_channel`/`remove_channel`, which are the only places
//! that run on the owning thread by construction (they're private to the
//! loop's own `run()`/`run_in_loop` machinery).

use std::fmt;
use std::os::unix::io::RawFd;

use mio::Token;

use crate::dispatcher::Dispatcher;

/// Bitmask of interest/trigger flags, matching `angel::event_type`.
pub type EventSet = u8;

/// Readability.
pub const READ: EventSet = 0x01;
/// Writability.
pub const WRITE: EventSet = 0x02;
/// Error/hangup.
pub const ERROR: EventSet = 0x04;

fn ev2str(events: EventSet) -> &'static str {
    match events {
        READ => "<Read>",
        WRITE => "<Write>",
        ERROR => "<Error>",
        x if x == READ | WRITE => "<Read|Write>",
        x if x == READ | ERROR => "<Read|Error>",
        x if x == WRITE | ERROR => "<Write|Error>",
        _ => "<None>",
    }
}

type Handler = Box<dyn FnMut() + Send>;

/// An fd's registration state and event handlers within one event loop.
pub struct Channel {
    fd: RawFd,
    token: Token,
    hold_fd: bool,
    filter: EventSet,
    trigger: EventSet,
    read_handler: Option<Handler>,
    write_handler: Option<Handler>,
    error_handler: Option<Handler>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("filter", &ev2str(self.filter))
            .field("trigger", &ev2str(self.trigger))
            .finish()
    }
}

impl Channel {
    /// A channel that closes `fd` when dropped.
    pub fn new_owned(fd: RawFd, token: Token) -> Self {
        Self::new(fd, token, true)
    }

    /// A channel over an `fd` owned elsewhere; dropping it never closes the fd.
    pub fn new_borrowed(fd: RawFd, token: Token) -> Self {
        Self::new(fd, token, false)
    }

    fn new(fd: RawFd, token: Token, hold_fd: bool) -> Self {
        Self {
            fd,
            token,
            hold_fd,
            filter: 0,
            trigger: 0,
            read_handler: None,
            write_handler: None,
            error_handler: None,
        }
    }

    /// The underlying fd.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The `mio::Token` this channel is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Interest currently registered with the dispatcher.
    pub fn filter_events(&self) -> EventSet {
        self.filter
    }

    /// Events the dispatcher reported on the last wakeup.
    pub fn trigger_events(&self) -> EventSet {
        self.trigger
    }

    /// Records the events the dispatcher reported for this channel; consumed
    /// by the next [`Channel::handle_event`] call.
    pub fn set_trigger_events(&mut self, events: EventSet) {
        self.trigger = events;
    }

    /// Whether `Read` interest is currently registered.
    pub fn is_reading(&self) -> bool {
        self.filter & READ != 0
    }

    /// Whether `Write` interest is currently registered.
    pub fn is_writing(&self) -> bool {
        self.filter & WRITE != 0
    }

    /// Installs the read handler.
    pub fn set_read_handler<F: FnMut() + Send + 'static>(&mut self, handler: F) {
        self.read_handler = Some(Box::new(handler));
    }

    /// Installs the write handler.
    pub fn set_write_handler<F: FnMut() + Send + 'static>(&mut self, handler: F) {
        self.write_handler = Some(Box::new(handler));
    }

    /// Installs the error handler.
    pub fn set_error_handler<F: FnMut() + Send + 'static>(&mut self, handler: F) {
        self.error_handler = Some(Box::new(handler));
    }

    /// Registers read interest with the dispatcher, if not already enabled.
    pub fn enable_read(&mut self, dispatcher: &mut dyn Dispatcher) -> std::io::Result<()> {
        if !self.is_reading() {
            self.filter |= READ;
            dispatcher.add(self.fd, self.token, self.filter)?;
            tracing::debug!(fd = self.fd, "channel enable <Read>");
        }
        Ok(())
    }

    /// Clears read interest, if enabled.
    pub fn disable_read(&mut self, dispatcher: &mut dyn Dispatcher) -> std::io::Result<()> {
        if self.is_reading() {
            self.filter &= !READ;
            dispatcher.update(self.fd, self.token, self.filter)?;
            tracing::debug!(fd = self.fd, "channel disable <Read>");
        }
        Ok(())
    }

    /// Registers write interest with the dispatcher, if not already enabled.
    pub fn enable_write(&mut self, dispatcher: &mut dyn Dispatcher) -> std::io::Result<()> {
        if !self.is_writing() {
            self.filter |= WRITE;
            dispatcher.update(self.fd, self.token, self.filter)?;
            tracing::debug!(fd = self.fd, "channel enable <Write>");
        }
        Ok(())
    }

    /// Clears write interest, if enabled.
    pub fn disable_write(&mut self, dispatcher: &mut dyn Dispatcher) -> std::io::Result<()> {
        if self.is_writing() {
            self.filter &= !WRITE;
            dispatcher.update(self.fd, self.token, self.filter)?;
            tracing::debug!(fd = self.fd, "channel disable <Write>");
        }
        Ok(())
    }

    /// Clears all interest and handlers, deregistering the fd entirely.
    pub fn disable_all(&mut self, dispatcher: &mut dyn Dispatcher) -> std::io::Result<()> {
        if self.filter != 0 {
            dispatcher.remove(self.fd, self.token)?;
            tracing::debug!(fd = self.fd, events = ev2str(self.filter), "channel disable all");
            self.read_handler = None;
            self.write_handler = None;
            self.error_handler = None;
            self.filter = 0;
        }
        Ok(())
    }

    /// Runs the handlers for whatever events were last reported, in
    /// Error, then Read, then Write order, clearing `trigger` afterward.
    pub fn handle_event(&mut self) {
        if self.trigger == 0 {
            return;
        }
        tracing::debug!(fd = self.fd, events = ev2str(self.trigger), "channel triggered");
        if self.trigger & ERROR != 0 {
            if let Some(h) = self.error_handler.as_mut() {
                h();
            }
        }
        if self.trigger & READ != 0 {
            if let Some(h) = self.read_handler.as_mut() {
                h();
            }
        }
        if self.trigger & WRITE != 0 {
            if let Some(h) = self.write_handler.as_mut() {
                h();
            }
        }
        self.trigger = 0;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.hold_fd {
            // Safety: `fd` is only ever closed here or by whatever created
            // it if `hold_fd` is false; a `Channel` never outlives its fd.
            unsafe {
                libc::close(self.fd);
            }
            tracing::debug!(fd = self.fd, "~Channel: closed fd");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MioDispatcher;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handle_event_runs_in_error_read_write_order() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut chan = Channel::new_borrowed(a.as_raw_fd(), Token(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        chan.set_error_handler(move || o1.lock().unwrap().push("error"));
        let o2 = order.clone();
        chan.set_read_handler(move || o2.lock().unwrap().push("read"));
        let o3 = order.clone();
        chan.set_write_handler(move || o3.lock().unwrap().push("write"));

        chan.set_trigger_events(READ | WRITE | ERROR);
        chan.handle_event();
        assert_eq!(*order.lock().unwrap(), vec!["error", "read", "write"]);
        assert_eq!(chan.trigger_events(), 0);
    }

    #[test]
    fn enable_disable_toggle_filter() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut chan = Channel::new_borrowed(a.as_raw_fd(), Token(1));
        let mut dispatcher = MioDispatcher::new().unwrap();
        dispatcher.add(chan.fd(), chan.token(), READ).unwrap();
        chan.filter = READ;
        assert!(chan.is_reading());
        chan.enable_write(&mut dispatcher).unwrap();
        assert!(chan.is_writing());
        chan.disable_all(&mut dispatcher).unwrap();
        assert!(!chan.is_reading());
        assert!(!chan.is_writing());
        let _ = AtomicUsize::new(0);
    }
}
