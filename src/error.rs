//! Error types for configuration/setup failures.
//!
//! Per-operation transient I/O, peer-reset, and resource-exhaustion errors
//! are handled inline with `io::Result` (see [`crate::connection`] and
//! [`crate::listener`]) since they never need to escape a single
//! `handle_*` method. [`ReactorError`] covers the remaining class: failures
//! with no meaningful local recovery (bind/listen/socketpair/unsupported
//! backend), which the original `angel::` implementation logs at `fatal`
//! and aborts the process for.

use std::io;

use thiserror::Error;

/// Fatal setup/configuration failures.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// `bind(2)` failed.
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    /// `listen(2)` failed.
    #[error("failed to listen on socket: {0}")]
    Listen(#[source] io::Error),

    /// Creating the self-pipe / wake socket pair failed.
    #[error("failed to create socket pair: {0}")]
    SocketPair(#[source] io::Error),

    /// The target platform has no supported readiness backend.
    #[error("no supported I/O multiplexing backend: {0}")]
    UnsupportedBackend(&'static str),

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A second event loop was constructed on a thread that already owns one.
    #[error("a thread may only run one EventLoop at a time")]
    DuplicateLoop,

    /// The process-wide signaler was constructed more than once.
    #[error("only one Signaler instance is allowed per process")]
    DuplicateSignaler,
}

/// Convenience alias for fallible setup paths.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Terminates the process after logging a fatal setup failure.
///
/// Mirrors `angel::log_fatal`'s abort-on-fatal behavior for the top-level
/// entry points ([`crate::server::Server::start`],
/// [`crate::client::Client::start`]) where no caller exists to recover. A
/// program that can't bind its listening socket has nothing useful left to
/// do. Library embedders who want a `Result` instead should use the
/// `try_*` constructors, which return [`ReactorError`] rather than calling
/// this.
pub fn abort_on_fatal(err: ReactorError) -> ! {
    tracing::error!(error = %err, "fatal setup failure, aborting process");
    std::process::exit(1)
}
