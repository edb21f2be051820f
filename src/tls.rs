//! TLS as a pluggable interceptor: a handshake driver that sits in front of
//! channel creation, and a post-handshake encrypt/decrypt filter.
//!
//! Ported from `angel::ssl_handshake`/`ssl_filter`/`ssl_connection`
//! (`original_source/src/ssl_handshake.cc`, `src/ssl/ssl_filter.cc`,
//! `src/ssl/ssl_connection.cc`). The original drives OpenSSL's
//! `SSL_do_handshake` from the channel's read/write handlers, toggling
//! `enable_read`/`enable_write` based on `SSL_ERROR_WANT_READ`/
//! `SSL_ERROR_WANT_WRITE`, and on success hands the channel off to a
//! `ssl_connection` whose `write`/`sendfile` are routed through an
//! `ssl_filter` backed by a pair of memory `BIO`s. `rustls` plays the role
//! OpenSSL plays there: [`rustls::ConnectionCommon::read_tls`]/`write_tls`
//! pump ciphertext through the raw fd exactly where the original calls
//! `BIO_write`/`BIO_read`, and `process_new_packets` stands in for
//! `SSL_do_handshake`'s internal state machine. Unlike the original's
//! in-place buffer mutation via memory BIOs, [`TlsFilter`] takes explicit
//! plaintext/ciphertext [`crate::buffer::Buffer`] pairs, which keeps the
//! call sites honest about which buffer holds what.
//!
//! No TLS record layer is reimplemented here; all of it is `rustls`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use mio::Token;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection as RustlsConnection, ServerConfig, ServerConnection};

use crate::buffer::Buffer;
use crate::evloop::EventLoopHandle;
use crate::sockops;

/// Runs once a handshake completes: the raw fd (still registered under its
/// original token) and the now-ready TLS session, ready to be wrapped in a
/// [`TlsFilter`] and handed to a normal [`crate::connection::Connection`].
/// Matches `ssl_handshake::onestablish`'s "transfer ownership of the channel
/// to the upper layer".
pub type EstablishHandler = Box<dyn FnOnce(RawFd, RustlsConnection) + Send>;

/// Runs when the handshake fails fatally. The fd has already been closed by
/// the time this fires, matching `ssl_handshake::onfail`.
pub type FailHandler = Box<dyn FnOnce() + Send>;

struct Handlers {
    on_establish: Option<EstablishHandler>,
    on_fail: Option<FailHandler>,
}

/// Drives a single TLS handshake over an already-connected fd, toggling the
/// channel's read/write interest as `rustls` asks for more ciphertext or has
/// more to send. One `TlsHandshake` is consumed per handshake attempt.
pub struct TlsHandshake {
    handle: EventLoopHandle,
    token: Token,
    fd: RawFd,
    conn: Mutex<Option<RustlsConnection>>,
    handlers: Mutex<Handlers>,
}

impl std::fmt::Debug for TlsHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandshake")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .finish()
    }
}

impl TlsHandshake {
    /// Starts a handshake acting as the TLS client, matching
    /// `ssl_handshake::start_client_handshake`.
    pub fn client(
        handle: EventLoopHandle,
        token: Token,
        fd: RawFd,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> io::Result<Arc<Self>> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self::new(handle, token, fd, RustlsConnection::Client(conn)))
    }

    /// Starts a handshake acting as the TLS server, matching
    /// `ssl_handshake::start_server_handshake`.
    pub fn server(
        handle: EventLoopHandle,
        token: Token,
        fd: RawFd,
        config: Arc<ServerConfig>,
    ) -> io::Result<Arc<Self>> {
        let conn = ServerConnection::new(config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self::new(handle, token, fd, RustlsConnection::Server(conn)))
    }

    fn new(handle: EventLoopHandle, token: Token, fd: RawFd, conn: RustlsConnection) -> Arc<Self> {
        Arc::new(Self {
            handle,
            token,
            fd,
            conn: Mutex::new(Some(conn)),
            handlers: Mutex::new(Handlers {
                on_establish: None,
                on_fail: None,
            }),
        })
    }

    pub fn set_establish_handler(&self, handler: EstablishHandler) {
        self.handlers.lock().unwrap().on_establish = Some(handler);
    }

    pub fn set_fail_handler(&self, handler: FailHandler) {
        self.handlers.lock().unwrap().on_fail = Some(handler);
    }

    /// Installs the channel's read/write handlers and runs the first
    /// handshake step. Matches `ssl_handshake::start_handshake`, which sets
    /// both handlers to the same `check_handler` and immediately calls
    /// `handshake()` once.
    pub fn start(self: &Arc<Self>) {
        let token = self.token;
        let h1 = self.clone();
        let h2 = self.clone();
        self.handle.run_in_loop(move |evloop| {
            if let Some(channel) = evloop.channel_mut(token) {
                channel.set_read_handler(move || h1.step());
                channel.set_write_handler(move || h2.step());
            }
        });
        self.step();
    }

    /// One round of ciphertext I/O plus handshake progress. Re-entrant-safe:
    /// channel handlers call this directly, and it also drives itself once
    /// from [`TlsHandshake::start`].
    fn step(self: &Arc<Self>) {
        let mut guard = self.conn.lock().unwrap();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            // A previous step already finished or failed this handshake;
            // a stray wakeup arrived after the channel should've had its
            // handlers replaced. Ignore it.
            None => return,
        };

        if conn.wants_read() {
            match conn.read_tls(&mut RawFdReader(self.fd)) {
                Ok(0) => {
                    drop(guard);
                    self.fail("peer closed connection during handshake");
                    return;
                }
                Ok(_) => {
                    if let Err(e) = conn.process_new_packets() {
                        drop(guard);
                        self.fail(&e.to_string());
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    drop(guard);
                    self.fail(&e.to_string());
                    return;
                }
            }
        }

        while conn.wants_write() {
            match conn.write_tls(&mut RawFdWriter(self.fd)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    drop(guard);
                    self.fail(&e.to_string());
                    return;
                }
            }
        }

        if conn.is_handshaking() {
            let want_read = conn.wants_read();
            let want_write = conn.wants_write();
            drop(guard);
            self.set_interest(want_read, want_write);
            return;
        }

        let conn = guard.take().expect("checked Some above");
        drop(guard);
        tracing::info!(fd = self.fd, "TLS handshake successful");
        if let Some(on_establish) = self.handlers.lock().unwrap().on_establish.take() {
            on_establish(self.fd, conn);
        }
    }

    fn set_interest(self: &Arc<Self>, want_read: bool, want_write: bool) {
        let token = self.token;
        self.handle.run_in_loop(move |evloop| {
            if want_read {
                let _ = evloop.channel_enable_read(token);
            } else {
                let _ = evloop.channel_disable_read(token);
            }
            if want_write {
                let _ = evloop.channel_enable_write(token);
            } else {
                let _ = evloop.channel_disable_write(token);
            }
        });
    }

    fn fail(self: &Arc<Self>, reason: &str) {
        tracing::error!(fd = self.fd, reason, "TLS handshake failed");
        let token = self.token;
        let fd = self.fd;
        self.handle.run_in_loop(move |evloop| {
            evloop.remove_channel(token);
            let _ = fd; // the channel owns fd and closes it on removal
        });
        if let Some(on_fail) = self.handlers.lock().unwrap().on_fail.take() {
            on_fail();
        }
    }
}

/// Post-handshake encrypt/decrypt filter over a completed [`rustls::Connection`].
///
/// Matches `ssl_filter`'s `decrypt`/`encrypt`, but with explicit
/// plaintext/ciphertext buffers standing in for the original's two memory
/// `BIO`s.
pub struct TlsFilter {
    conn: RustlsConnection,
}

impl std::fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFilter").finish()
    }
}

impl TlsFilter {
    pub fn new(conn: RustlsConnection) -> Self {
        Self { conn }
    }

    /// Consumes ciphertext from `raw` (freshly read off the socket),
    /// appending any plaintext it yields to `decrypted`. Matches
    /// `ssl_filter::decrypt`'s "give the encrypted data read from the
    /// network to openssl for decryption, then read the decrypted data".
    pub fn decrypt(&mut self, raw: &mut Buffer, decrypted: &mut Buffer) -> io::Result<()> {
        if raw.readable() > 0 {
            let mut cursor = raw.peek();
            let n = self.conn.read_tls(&mut cursor)?;
            raw.retrieve(n);
        }
        if let Err(e) = self.conn.process_new_packets() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
        }
        let mut buf = [0u8; 8192];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => decrypted.append(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Consumes plaintext from `plaintext` (queued for sending), appending
    /// the resulting ciphertext to `raw` for the caller to write to the
    /// socket. Matches `ssl_filter::encrypt`'s "give the unencrypted data to
    /// openssl for encryption, then read the encrypted data from wbio".
    pub fn encrypt(&mut self, plaintext: &mut Buffer, raw: &mut Buffer) -> io::Result<()> {
        if plaintext.readable() > 0 {
            let n = self.conn.writer().write(plaintext.peek())?;
            plaintext.retrieve(n);
        }
        let mut sink = BufferWriter(raw);
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct RawFdReader(RawFd);

impl io::Read for RawFdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: `fd` is owned by the channel this handshake is driving and
        // stays open for the handshake's lifetime; `buf` is a valid slice.
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

struct RawFdWriter(RawFd);

impl io::Write for RawFdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        sockops::write_raw(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct BufferWriter<'a>(&'a mut Buffer);

impl io::Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_configs() -> (Arc<ClientConfig>, Arc<ServerConfig>, ServerName<'static>) {
        use rcgen::generate_simple_self_signed;

        let cert = generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.cert.der().clone();
        let key_der =
            rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der()).unwrap();

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = ServerName::try_from("localhost").unwrap();
        (Arc::new(client_config), Arc::new(server_config), name)
    }

    #[test]
    fn filter_round_trips_plaintext_through_an_in_process_handshake() {
        let (client_config, server_config, name) = test_configs();
        let mut client = ClientConnection::new(client_config, name).unwrap();
        let mut server = ServerConnection::new(server_config).unwrap();

        // Drive the handshake purely in memory, bouncing ciphertext between
        // the two sides until both report done.
        for _ in 0..10 {
            if !client.is_handshaking() && !server.is_handshaking() {
                break;
            }
            let mut buf = Vec::new();
            while client.wants_write() {
                let n = client.write_tls(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
            }
            let mut cursor = &buf[..];
            while !cursor.is_empty() {
                let n = server.read_tls(&mut cursor).unwrap();
                if n == 0 {
                    break;
                }
            }
            let _ = server.process_new_packets().unwrap();

            let mut buf = Vec::new();
            while server.wants_write() {
                let n = server.write_tls(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
            }
            let mut cursor = &buf[..];
            while !cursor.is_empty() {
                let n = client.read_tls(&mut cursor).unwrap();
                if n == 0 {
                    break;
                }
            }
            let _ = client.process_new_packets().unwrap();
        }
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());

        let mut client_filter = TlsFilter::new(RustlsConnection::Client(client));
        let mut server_filter = TlsFilter::new(RustlsConnection::Server(server));

        let mut plaintext_in = Buffer::new();
        plaintext_in.append(b"hello reactor");
        let mut wire = Buffer::new();
        client_filter.encrypt(&mut plaintext_in, &mut wire).unwrap();
        assert_eq!(plaintext_in.readable(), 0);
        assert!(wire.readable() > 0);

        let mut decrypted = Buffer::new();
        server_filter.decrypt(&mut wire, &mut decrypted).unwrap();
        assert_eq!(decrypted.peek(), b"hello reactor");
    }
}
