//! Raw socket option helpers and the zero-copy `send_file` primitive.
//!
//! Mirrors `original_source/src/sockops.h`/`sockops.cc`: thin wrappers over
//! platform socket options plus the connection-queue `FileStream` primitive.
//! Everything that `socket2` already exposes goes through `socket2::Socket`;
//! `send_file` does not have a `socket2` equivalent, so it is implemented
//! directly against `libc::sendfile` on Linux, with a portable read/write
//! loop fallback on other platforms (matching the original's
//! `#if defined(__linux__) ... #else ...` split).

use std::fs::File;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Socket, TcpKeepalive, Type};

/// Enables or disables `SO_REUSEADDR`.
pub fn set_reuseaddr(sock: &Socket, on: bool) -> io::Result<()> {
    sock.set_reuse_address(on)
}

/// Enables or disables `TCP_NODELAY`.
pub fn set_nodelay(sock: &Socket, on: bool) -> io::Result<()> {
    sock.set_nodelay(on)
}

/// Enables `SO_KEEPALIVE` with the given idle/interval/probe-count tunables,
/// or disables it outright when `on` is false.
///
/// `idle`/`intvl`/`probes` match the fields the original's `listener_t`
/// carries (`original_source/src/listener.h`); not every platform honors
/// `probes` (it's a no-op on platforms `socket2` can't set it for), which
/// mirrors the original's own best-effort `setsockopt` calls.
pub fn set_keepalive(
    sock: &Socket,
    on: bool,
    idle: Duration,
    intvl: Duration,
    probes: u32,
) -> io::Result<()> {
    if !on {
        return sock.set_keepalive(false);
    }
    let ka = TcpKeepalive::new()
        .with_time(idle)
        .with_interval(intvl)
        .with_retries(probes);
    sock.set_tcp_keepalive(&ka)
}

/// Sets or clears `O_NONBLOCK`.
pub fn set_nonblocking(sock: &Socket, on: bool) -> io::Result<()> {
    sock.set_nonblocking(on)
}

/// Reads and clears the socket's pending `SO_ERROR`, the way the original's
/// `get_socket_error()` does after a connector's writable wakeup.
pub fn get_socket_error(sock: &Socket) -> io::Result<Option<io::Error>> {
    sock.take_error()
}

/// Raw-fd equivalent of [`get_socket_error`], for callers (namely
/// [`crate::connector::Connector`]) holding a `mio::net::TcpStream` rather
/// than a `socket2::Socket` wrapper. Reads `SO_ERROR` directly via
/// `getsockopt`, which is what `Socket::take_error` itself does internally.
pub fn take_error_raw(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut errno: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: `fd` is a valid, open socket for the duration of this call
    // (borrowed by the caller); `errno`/`len` are correctly sized
    // out-parameters per `getsockopt(2)`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if errno == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(errno)))
    }
}

/// Creates a connected pair of local stream sockets for the event loop's
/// wake pipe, matching `sockops::socketpair()`.
pub fn socketpair() -> io::Result<(Socket, Socket)> {
    Socket::pair(Domain::UNIX, Type::STREAM, None)
}

/// The local address bound to `fd`, for connections whose `Connection` is
/// built straight from an accepted/connected raw fd with no owning
/// `socket2::Socket` wrapper around.
pub fn local_addr_of(fd: RawFd) -> io::Result<std::net::SocketAddr> {
    use std::os::unix::io::FromRawFd;
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let result = sock.local_addr().and_then(|a| {
        a.as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP local address"))
    });
    std::mem::forget(sock);
    result
}

/// A single `write(2)` against a raw fd, for [`crate::connection::Connection`]'s
/// byte-stream drain, which (like the original) writes directly against the
/// channel's fd rather than through a buffered `std::io::Write` impl.
pub fn write_raw(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // Safety: `fd` is borrowed for the duration of this call; `data` is a
    // valid slice for its own length.
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Sends up to `count` bytes from `file` (starting at `offset`, or the
/// file's current position if `None`) directly to `out`, using the kernel's
/// zero-copy `sendfile(2)` where available.
///
/// Backs the `FileStream` arm of a connection's send-task queue
/// (spec.md §3/§4.7, `original_source/src/sockops.cc`'s `send_file`). On
/// Linux this is a single `sendfile(2)` syscall operating on the raw fds;
/// elsewhere it falls back to a plain read/write loop through a stack
/// buffer, which is what the original does for platforms with no
/// `sendfile` binding (`#else ... return -1`) — except we actually move the
/// bytes instead of failing, since a portable crate can't assume Linux.
pub fn send_file(
    out: &TcpStream,
    file: &File,
    offset: Option<u64>,
    count: usize,
) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    {
        send_file_linux(out.as_raw_fd(), file.as_raw_fd(), offset, count)
    }
    #[cfg(not(target_os = "linux"))]
    {
        send_file_fallback(out, file, offset, count)
    }
}

/// Raw-fd equivalent of [`send_file`], for [`crate::connection::Connection`],
/// which only ever holds the bare fds passed to `send_file(fd, offset,
/// count)` rather than owned `File`/`TcpStream` values (the caller retains
/// ownership of the source fd, matching `angel::connection::send_file`).
pub fn send_file_raw(out_fd: RawFd, in_fd: RawFd, offset: i64, count: usize) -> io::Result<usize> {
    #[cfg(target_os = "linux")]
    {
        send_file_linux(out_fd, in_fd, Some(offset as u64), count)
    }
    #[cfg(not(target_os = "linux"))]
    {
        send_file_fallback_raw(out_fd, in_fd, offset, count)
    }
}

#[cfg(not(target_os = "linux"))]
fn send_file_fallback_raw(out_fd: RawFd, in_fd: RawFd, offset: i64, count: usize) -> io::Result<usize> {
    let mut buf = [0u8; 64 * 1024];
    let chunk = count.min(buf.len());
    // Safety: in_fd/out_fd are borrowed for the duration of this call; buf is
    // a valid, appropriately sized stack buffer.
    let n = unsafe {
        libc::pread(
            in_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            chunk,
            offset as libc::off_t,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Ok(0);
    }
    let n = n as usize;
    let w = unsafe { libc::write(out_fd, buf.as_ptr() as *const libc::c_void, n) };
    if w < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(w as usize)
}

#[cfg(target_os = "linux")]
fn send_file_linux(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<u64>,
    count: usize,
) -> io::Result<usize> {
    let mut off: libc::off_t = offset.unwrap_or(0) as libc::off_t;
    let off_ptr = if offset.is_some() {
        &mut off as *mut libc::off_t
    } else {
        std::ptr::null_mut()
    };
    // Safety: out_fd/in_fd are borrowed for the duration of this call only
    // (the caller retains ownership of both File and TcpStream), count and
    // off_ptr are valid per sendfile(2)'s contract.
    let n = unsafe { libc::sendfile(out_fd, in_fd, off_ptr, count) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
fn send_file_fallback(
    out: &TcpStream,
    file: &File,
    offset: Option<u64>,
    count: usize,
) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut file = file.try_clone()?;
    if let Some(off) = offset {
        file.seek(SeekFrom::Start(off))?;
    }
    let mut out = out.try_clone()?;
    let mut remaining = count;
    let mut sent = 0usize;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        let n = file.read(&mut buf[..chunk])?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        sent += n;
        remaining -= n;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn keepalive_and_nodelay_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let sock = Socket::from(client);
        set_nodelay(&sock, true).unwrap();
        set_keepalive(
            &sock,
            true,
            Duration::from_secs(30),
            Duration::from_secs(5),
            3,
        )
        .unwrap();
        assert!(sock.keepalive().unwrap());
    }

    #[test]
    fn take_error_raw_is_clean_on_healthy_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let err = take_error_raw(client.as_raw_fd()).unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn socketpair_roundtrip() {
        let (a, b) = socketpair().unwrap();
        a.set_nonblocking(false).unwrap();
        b.set_nonblocking(false).unwrap();
        let mut a: std::os::unix::net::UnixStream = a.into();
        let mut b: std::os::unix::net::UnixStream = b.into();
        a.write_all(&[7]).unwrap();
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn send_file_moves_all_bytes() {
        use std::io::Write as _;

        let mut tmp = tempfile_like();
        tmp.write_all(b"hello reactor").unwrap();
        tmp.sync_all().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let file = File::open(tmp_path()).unwrap();
        let n = send_file(&client, &file, Some(0), 13).unwrap();
        assert_eq!(n, 13);

        let mut server = server;
        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello reactor");
    }

    fn tmp_path() -> std::path::PathBuf {
        std::env::temp_dir().join("angelreactor-sockops-test.bin")
    }

    fn tempfile_like() -> File {
        File::create(tmp_path()).unwrap()
    }
}
