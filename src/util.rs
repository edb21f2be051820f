//! Small helpers shared across the crate: address formatting, monotonic
//! wall-clock milliseconds for the timer wheel, and the `daemon()` helper.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thin wrapper over [`SocketAddr`] with the formatting helpers
/// `angel::inet_addr` offers, used pervasively in log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    /// Wraps an existing address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The wrapped [`SocketAddr`].
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// Just the host portion, e.g. `"127.0.0.1"`.
    pub fn to_host(&self) -> String {
        self.0.ip().to_string()
    }

    /// `"host:port"`.
    pub fn to_host_port(&self) -> String {
        format!("{}:{}", self.0.ip(), self.0.port())
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for InetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_host_port())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used by the timer wheel to compute absolute expirations. Not monotonic
/// in the strict sense (it can jump if the system clock is stepped), which
/// matches the original's `util::get_cur_time_ms()` (`gettimeofday`-based).
pub fn cur_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

/// Forks, detaches from the controlling terminal, and `chdir("/")`s, the
/// way `angel::server::daemon()` /  `original_source/src/util/daemon.cc`
/// does. The parent process exits immediately after a successful fork;
/// only the child returns from this call.
#[cfg(unix)]
pub fn daemonize() -> std::io::Result<()> {
    use nix::unistd::{chdir, fork, setsid, ForkResult};

    // Safety: fork() is async-signal-safe to call here; we immediately
    // branch on its result without touching shared mutable state between
    // parent and child.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from(e)),
    }

    setsid().map_err(std::io::Error::from)?;
    chdir("/").map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_formatting() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let a = InetAddr::new(addr);
        assert_eq!(a.to_host(), "127.0.0.1");
        assert_eq!(a.to_host_port(), "127.0.0.1:8080");
    }

    #[test]
    fn cur_time_ms_is_increasing() {
        let a = cur_time_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = cur_time_ms();
        assert!(b >= a);
    }
}
