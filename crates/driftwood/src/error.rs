use std::io;

use thiserror::Error;

/// Failure taxonomy for the session engine.
///
/// Transient conditions (`EINTR`, `EAGAIN`) are retried internally and never
/// surface here; `ESRCH` while signalling is treated as "already gone".
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("invalid terminal size: {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("text could not be encoded for the child process")]
    EncodingFailure,

    #[error("{call} failed: {}", errno_description(.errno))]
    SystemCallFailed { call: &'static str, errno: i32 },
}

fn errno_description(errno: &i32) -> String {
    io::Error::from_raw_os_error(*errno).to_string()
}

impl SessionError {
    pub(crate) fn syscall(call: &'static str, err: &io::Error) -> Self {
        SessionError::SystemCallFailed {
            call,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }

    /// Maps a PTY-layer error chain onto the failing OS call.
    pub(crate) fn pty_syscall(call: &'static str, err: &anyhow::Error) -> Self {
        let errno = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<io::Error>())
            .find_map(io::Error::raw_os_error)
            .unwrap_or(0);
        SessionError::SystemCallFailed { call, errno }
    }
}
