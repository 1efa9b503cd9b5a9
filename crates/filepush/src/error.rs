use std::io;

use thiserror::Error;

/// Errors returned synchronously by the owner-side pump API.
///
/// Failures inside the copy loop never surface here; they are reported
/// asynchronously through [`PumpEvent`](crate::PumpEvent)s.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("pump is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to spawn pump thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("event receiver has already been taken")]
    EventsTaken,

    #[error("a previous worker panicked and took the sink with it")]
    SinkLost,
}

impl PumpError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// How the copy loop reacts to a failed read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// Interrupted, busy or would-block: try again without changing state.
    Retry,
    /// The device dropped data; try again, but the condition is worth counting.
    Overflow,
    /// Anything else ends the loop.
    Fatal,
}

/// Classify an IO error the way the pump loops need it.
pub fn classify(err: &io::Error) -> IoClass {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ResourceBusy => {
            return IoClass::Retry;
        }
        _ => {}
    }

    match err.raw_os_error() {
        Some(code) if is_busy(code) => IoClass::Retry,
        Some(code) if is_overflow(code) => IoClass::Overflow,
        _ => IoClass::Fatal,
    }
}

#[cfg(unix)]
fn is_busy(code: i32) -> bool {
    code == libc::EBUSY || code == libc::EAGAIN
}

#[cfg(unix)]
fn is_overflow(code: i32) -> bool {
    code == libc::EOVERFLOW
}

#[cfg(not(unix))]
fn is_busy(_code: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn is_overflow(_code: i32) -> bool {
    false
}
