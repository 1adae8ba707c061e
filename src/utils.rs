use std::io;
use std::path::{Path, PathBuf};

/// The peer reset, aborted or half-closed the connection
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || matches!(
        err.raw_os_error(),
        Some(libc::EPIPE | libc::ECONNRESET | libc::ECONNABORTED | libc::ESHUTDOWN)
    )
}

/// A write timed out because the peer stopped draining its receive window
pub fn is_stalled(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Shutting down a socket that is already gone
pub fn is_not_connected(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected || err.raw_os_error() == Some(libc::ENOTCONN)
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
