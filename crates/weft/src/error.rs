//! Runtime errors and invariant checks
//!
//! Environmental failures (epoll, pipes, thread spawn, configuration) are
//! reported through [`Error`]. Broken invariants inside the runtime are not
//! recoverable: [`fatal!`] logs the message with a backtrace and aborts.

use std::io;
use std::os::unix::io::RawFd;

/// Weft runtime errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `epoll_create1` failed
    #[error("epoll_create failed: {0}")]
    EpollCreate(#[source] io::Error),

    /// The tickle pipe could not be created or configured
    #[error("failed to create tickle pipe: {0}")]
    Pipe(#[source] io::Error),

    /// `epoll_ctl` rejected a registration change
    #[error("epoll_ctl({op}, fd={fd}, events={events:#x}) failed: {source}")]
    EpollCtl {
        /// `ADD`, `MOD` or `DEL`
        op: &'static str,
        /// Target descriptor
        fd: RawFd,
        /// Requested epoll event mask
        events: u32,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// Negative or otherwise unusable file descriptor
    #[error("invalid file descriptor {0}")]
    InvalidFd(RawFd),

    /// An operation needed a running fiber but the thread is on its root stack
    #[error("no fiber is executing on this thread")]
    NoCurrentFiber,

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Configuration could not be parsed
    #[error("configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration parsed but holds unusable values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Weft result type
pub type Result<T> = std::result::Result<T, Error>;

/// Log a diagnostic with a captured backtrace and abort the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let backtrace = ::std::backtrace::Backtrace::force_capture();
        ::tracing::error!(
            target: $crate::LOG_TARGET,
            "fatal: {}\nbacktrace:\n{}",
            format_args!($($arg)+),
            backtrace
        );
        eprintln!("weft fatal: {}", format_args!($($arg)+));
        ::std::process::abort()
    }};
}

/// Abort through [`fatal!`] when `cond` does not hold.
#[macro_export]
macro_rules! weft_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::fatal!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!("assertion failed: {}: {}", stringify!($cond), format_args!($($arg)+));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoll_ctl_message() {
        let err = Error::EpollCtl {
            op: "MOD",
            fd: 7,
            events: 0x8000_0001,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("epoll_ctl(MOD, fd=7, events=0x80000001)"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
