//! Growable byte buffer used for both sides of a connection's I/O.
//!
//! ```text
//! +------------------------+
//! | avail | xxxxxx | avail |
//! +------------------------+
//!         r        w
//! ```
//!
//! Ported from `angel::buffer` (`original_source/src/buffer.h`/`buffer.cc`),
//! the newer of the two buffer namespaces the original carries — not the
//! raw-pointer `Angel::` one the teacher's `src/first/buffer.rs` reflected.
//! `read_index`/`write_index` delimit the readable span; bytes before
//! `read_index` are "prependable" space freed by past `retrieve` calls and
//! reclaimed by `make_space` before the backing `Vec` is ever grown.

use std::io;
#[cfg(unix)]
use std::os::unix::io::RawFd;

const INIT_SIZE: usize = 1024;
const EXTRABUF_SIZE: usize = 65536;

thread_local! {
    static EXTRABUF: std::cell::RefCell<[u8; EXTRABUF_SIZE]> =
        std::cell::RefCell::new([0u8; EXTRABUF_SIZE]);
}

/// A growable read/write byte buffer with a single readable window.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// A buffer with the original's default initial capacity (1 KiB).
    pub fn new() -> Self {
        Self::with_capacity(INIT_SIZE)
    }

    /// A buffer with a caller-chosen initial capacity.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            read_index: 0,
            write_index: 0,
        }
    }

    /// The readable span, from `read_index` to `write_index`.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Number of bytes available to prepend without reallocating.
    pub fn prependable(&self) -> usize {
        self.read_index
    }

    /// Number of unread bytes currently buffered.
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Free space after `write_index`.
    pub fn writeable(&self) -> usize {
        self.buf.len() - self.write_index
    }

    /// Reclaims space ahead of `write_index` for at least `len` more bytes,
    /// compacting the readable span to the front of the backing `Vec`
    /// before ever growing it.
    fn make_space(&mut self, len: usize) {
        if len > self.writeable() {
            if len <= self.writeable() + self.prependable() {
                let read_bytes = self.readable();
                self.buf.copy_within(self.read_index..self.write_index, 0);
                self.read_index = 0;
                self.write_index = read_bytes;
            } else {
                self.buf.resize(self.write_index + len, 0);
            }
        }
    }

    /// Appends `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.make_space(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Consumes `len` bytes from the front of the readable span.
    ///
    /// Matches `buffer::retrieve`'s clamping exactly: if `len` is less than
    /// the currently readable amount, only `read_index` advances; otherwise
    /// (including `len == readable()`) both cursors reset to 0, so a fully
    /// drained buffer always starts the next `append` from the beginning.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable() {
            self.read_index += len;
        } else {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    /// Consumes everything currently readable.
    pub fn retrieve_all(&mut self) {
        self.retrieve(self.readable());
    }

    /// The readable span followed by a trailing NUL, for interop with APIs
    /// that want a C string. Does not advance `write_index`.
    pub fn c_str(&mut self) -> &[u8] {
        self.make_space(1);
        self.buf[self.write_index] = 0;
        self.peek()
    }

    /// Whether the readable span begins with `pattern`.
    pub fn starts_with(&self, pattern: &[u8]) -> bool {
        let p = self.peek();
        p.len() >= pattern.len() && &p[..pattern.len()] == pattern
    }

    /// Index of `pattern` within the readable span, if present.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        let p = self.peek();
        if pattern.is_empty() || p.len() < pattern.len() {
            return None;
        }
        p.windows(pattern.len()).position(|w| w == pattern)
    }

    /// Index of the first `"\r\n"`, if present.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find(b"\r\n")
    }

    /// Index of the first `"\n"`, if present.
    pub fn find_lf(&self) -> Option<usize> {
        self.find(b"\n")
    }

    /// Swaps the contents of two buffers without copying data.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(&mut self.buf, &mut other.buf);
        std::mem::swap(&mut self.read_index, &mut other.read_index);
        std::mem::swap(&mut self.write_index, &mut other.write_index);
    }

    /// Reads from `fd` directly into the buffer's writeable tail, scattering
    /// any overflow into a 65536-byte thread-local buffer so a single
    /// `readv(2)` can absorb a large datagram/segment without forcing a
    /// buffer growth on every call. Matches `buffer::read_fd`.
    #[cfg(unix)]
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        EXTRABUF.with(|cell| {
            let mut extrabuf = cell.borrow_mut();
            let writeable = self.writeable();

            let mut iov = [
                libc::iovec {
                    iov_base: self.buf[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                    iov_len: writeable,
                },
                libc::iovec {
                    iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: extrabuf.len(),
                },
            ];

            // Safety: iov[0] points at `writeable` valid bytes inside `self.buf`
            // (held mutably for the duration of this call), iov[1] at the
            // thread-local scratch buffer; both outlive the readv call.
            let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let n = n as usize;
            if n <= writeable {
                self.write_index += n;
            } else {
                self.write_index += writeable;
                let overflow = n - writeable;
                self.append(&extrabuf[..overflow]);
            }
            Ok(n)
        })
    }

    /// Non-unix fallback: a single `read` into the writeable tail, growing
    /// first if that tail is too small. No scatter/gather here since
    /// `readv` isn't part of this crate's portable surface.
    #[cfg(not(unix))]
    pub fn read_fd<R: io::Read>(&mut self, src: &mut R) -> io::Result<usize> {
        if self.writeable() < EXTRABUF_SIZE {
            self.make_space(EXTRABUF_SIZE);
        }
        let start = self.write_index;
        let n = src.read(&mut self.buf[start..])?;
        self.write_index += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut b = Buffer::new();
        b.append(b"hello");
        assert_eq!(b.readable(), 5);
        assert_eq!(b.peek(), b"hello");
        b.retrieve(3);
        assert_eq!(b.peek(), b"lo");
        b.retrieve(2);
        assert_eq!(b.readable(), 0);
    }

    #[test]
    fn retrieve_clamps_to_zero_on_full_drain() {
        let mut b = Buffer::new();
        b.append(b"abc");
        b.retrieve(3);
        assert_eq!(b.readable(), 0);
        b.append(b"xyz");
        // read_index/write_index both reset, so the new append starts fresh.
        assert_eq!(b.peek(), b"xyz");
    }

    #[test]
    fn make_space_compacts_before_growing() {
        let mut b = Buffer::with_capacity(8);
        b.append(b"abcdef");
        b.retrieve(4);
        assert_eq!(b.prependable(), 4);
        // This append fits in writeable()+prependable() without a resize.
        b.append(b"gh");
        assert_eq!(b.peek(), b"efgh");
        assert_eq!(b.prependable(), 0);
    }

    #[test]
    fn find_helpers() {
        let mut b = Buffer::new();
        b.append(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(b.starts_with(b"GET"));
        assert_eq!(b.find_crlf(), Some(14));
        assert_eq!(b.find_lf(), Some(15));
        assert_eq!(b.find(b"Host"), Some(16));
    }

    #[test]
    fn read_fd_overflows_into_extrabuf() {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload = vec![7u8; 4096];
        tx.write_all(&payload).unwrap();
        drop(tx);

        let mut b = Buffer::with_capacity(16);
        let n = b.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(b.readable(), 4096);
        assert!(b.peek().iter().all(|&x| x == 7));
    }
}
