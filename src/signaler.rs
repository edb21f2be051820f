//! Converts process signals into ordinary readable events on one loop.
//!
//! Ported from `angel::signal` (`original_source/include/angel/signal.h`,
//! `src/signal.cc`, not kept in the retrieval pack but referenced by
//! `evloop`/`server`/`client`): a process-wide self-pipe plus a per-signal
//! list of user handlers. Registering a signal installs a trampoline that
//! runs in the actual signal handler and must be async-signal-safe; here
//! that trampoline is exactly one `libc::write` of the signal number into
//! the pipe's write end, installed through `signal_hook::low_level::register`
//! (the crate already vets the bookkeeping around the OS `sigaction` call,
//! leaving only our one-line write for us to keep signal-safe, which
//! `libc::write` is). `signal_hook::iterator`'s higher-level `Signals`
//! type intentionally erases which signal fired behind a generic wakeup;
//! since the loop-side handler needs to dispatch by signal number
//! (spec.md §4.5), `low_level::register` is the better fit than the
//! iterator API despite both living in the same crate.
//!
//! Process-singleton: the first [`crate::evloop::EventLoop`] that calls
//! [`EventLoop::install_signaler`](crate::evloop::EventLoop::install_signaler)
//! owns it for the life of the process: a second attempt, from any thread,
//! is rejected with [`crate::error::ReactorError::DuplicateSignaler`].

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use mio::Token;
use socket2::Socket;

use crate::error::{ReactorError, ReactorResult};
use crate::sockops;

static INSTALLED: AtomicBool = AtomicBool::new(false);

type Handler = Box<dyn FnMut() + Send>;

/// Identifies one registered `(signal, handler)` pair, for [`Signaler::cancel_signal`].
pub type HandlerId = usize;

struct Entry {
    id: HandlerId,
    handler: Handler,
}

/// Process-wide signal-to-event bridge, bound to exactly one [`crate::evloop::EventLoop`].
pub struct Signaler {
    token: Token,
    read_fd: RawFd,
    _write_end: Socket,
    handlers: Mutex<HashMap<i32, Vec<Entry>>>,
    sig_ids: Mutex<HashMap<i32, signal_hook::SigId>>,
    next_id: Mutex<HandlerId>,
}

impl Signaler {
    /// Creates the self-pipe and claims the process-wide installation slot.
    /// Fails with [`ReactorError::DuplicateSignaler`] if one already exists
    /// anywhere in the process.
    pub fn new(token: Token) -> ReactorResult<Self> {
        if INSTALLED.swap(true, Ordering::AcqRel) {
            return Err(ReactorError::DuplicateSignaler);
        }
        let (read, write) = sockops::socketpair().map_err(ReactorError::SocketPair)?;
        read.set_nonblocking(true).map_err(ReactorError::SocketPair)?;
        use std::os::unix::io::AsRawFd;
        let read_fd = read.as_raw_fd();
        // Leak the read half's `Socket` wrapper deliberately: the raw fd is
        // registered directly with the dispatcher (not wrapped in an owning
        // Channel, to avoid a double-close), and `Drop` below closes it.
        std::mem::forget(read);
        Ok(Self {
            token,
            read_fd,
            _write_end: write,
            handlers: Mutex::new(HashMap::new()),
            sig_ids: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        })
    }

    /// The mio token this signaler's read end is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The read end's fd, for registration with the dispatcher.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Registers `handler` to run (on the owning loop's thread) whenever
    /// `signo` is delivered to the process. Multiple handlers may be
    /// registered for the same signal; all run, in registration order.
    pub fn add_signal<F>(&self, signo: i32, handler: F) -> io::Result<HandlerId>
    where
        F: FnMut() + Send + 'static,
    {
        let id = {
            let mut n = self.next_id.lock().unwrap();
            let id = *n;
            *n += 1;
            id
        };
        let mut handlers = self.handlers.lock().unwrap();
        let list = handlers.entry(signo).or_default();
        let first_for_signal = list.is_empty();
        list.push(Entry {
            id,
            handler: Box::new(handler),
        });
        drop(handlers);

        if first_for_signal {
            self.install_trampoline(signo)?;
        }
        tracing::debug!(signo, handler_id = id, "signal handler registered");
        Ok(id)
    }

    fn install_trampoline(&self, signo: i32) -> io::Result<()> {
        let write_fd = unsafe { libc::dup(self.write_fd()) };
        if write_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: the closure below only calls `libc::write` on a fd it
        // owns exclusively (`write_fd`, a dup'd copy of the pipe's write
        // end), which is async-signal-safe. It performs no allocation, no
        // locking, and does not touch Rust-managed memory, satisfying
        // `signal_hook::low_level::register`'s requirement that the action
        // be safe to run inside an actual signal handler.
        let sig_id = unsafe {
            signal_hook::low_level::register(signo, move || {
                let byte = signo as u8;
                libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1);
            })
        }?;
        self.sig_ids.lock().unwrap().insert(signo, sig_id);
        Ok(())
    }

    fn write_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self._write_end.as_raw_fd()
    }

    /// Cancels one previously registered handler. If it was the last
    /// handler for its signal, the signal's default disposition is
    /// restored, matching `angel::cancel_signal`.
    pub fn cancel_signal(&self, id: HandlerId) {
        let mut handlers = self.handlers.lock().unwrap();
        let mut now_empty_signal = None;
        for (signo, list) in handlers.iter_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id) {
                list.remove(pos);
                if list.is_empty() {
                    now_empty_signal = Some(*signo);
                }
                break;
            }
        }
        drop(handlers);
        if let Some(signo) = now_empty_signal {
            self.restore_default(signo);
        }
    }

    /// Clears every handler for `signo` and sets its disposition to
    /// `SIG_IGN`, matching `angel::ignore_signal`.
    pub fn ignore_signal(&self, signo: i32) {
        self.handlers.lock().unwrap().remove(&signo);
        if let Some(sig_id) = self.sig_ids.lock().unwrap().remove(&signo) {
            signal_hook::low_level::unregister(sig_id);
        }
        unsafe {
            libc::signal(signo, libc::SIG_IGN);
        }
    }

    fn restore_default(&self, signo: i32) {
        if let Some(sig_id) = self.sig_ids.lock().unwrap().remove(&signo) {
            signal_hook::low_level::unregister(sig_id);
        }
        unsafe {
            libc::signal(signo, libc::SIG_DFL);
        }
    }

    /// Drains up to 1024 pending signal bytes from the self-pipe and
    /// dispatches each to the handlers registered for that signal.
    /// Invoked by the owning loop when the signaler's fd becomes readable.
    pub fn handle_events(&self) {
        let mut buf = [0u8; 1024];
        let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            return;
        }
        let mut handlers = self.handlers.lock().unwrap();
        for &signo in &buf[..n as usize] {
            if let Some(list) = handlers.get_mut(&(signo as i32)) {
                for entry in list.iter_mut() {
                    (entry.handler)();
                }
            }
        }
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        let sig_ids: Vec<_> = self.sig_ids.lock().unwrap().drain().map(|(_, id)| id).collect();
        for id in sig_ids {
            signal_hook::low_level::unregister(id);
        }
        unsafe {
            libc::close(self.read_fd);
        }
        INSTALLED.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Signaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaler").field("token", &self.token).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn add_and_cancel_signal_updates_bookkeeping() {
        // Exercises only the bookkeeping paths (not an actual raised
        // signal, which would be process-global and racy under `cargo
        // test`'s parallel harness); `handle_events`/trampoline wiring for
        // a real delivery is covered by the server/client integration
        // tests, which each run in their own process.
        let signaler = Signaler::new(Token(1)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        // SIGUSR2 is unlikely to be used by the surrounding test harness.
        let id = signaler.add_signal(libc::SIGUSR2, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        signaler.cancel_signal(id);
        assert!(signaler.handlers.lock().unwrap().get(&libc::SIGUSR2).map(|l| l.is_empty()).unwrap_or(true));
        drop(signaler);
        std::thread::sleep(Duration::from_millis(1));
    }
}
