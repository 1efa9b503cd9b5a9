use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{IoClass, classify};

/// Destination a pump writes to. The pump never closes it.
pub trait Sink: Send + Sync {
    /// Write some prefix of `data`, returning how much was taken.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for the sink to become readable, which a playback
    /// device uses to acknowledge that it drained everything written so far.
    fn wait_readable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A descriptor-backed sink: a file, device node, pipe, socket or stdout.
#[derive(Debug)]
pub struct FdSink<T> {
    inner: T,
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl<T: std::os::unix::io::AsRawFd> FdSink<T> {
    pub fn new(inner: T) -> Self {
        let fd = inner.as_raw_fd();
        Self { inner, fd }
    }
}

#[cfg(not(unix))]
impl<T> FdSink<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T> FdSink<T> {
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Sink for FdSink<T>
where
    T: Send + Sync,
    for<'a> &'a T: Write,
{
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        (&self.inner).write(data)
    }

    #[cfg(unix)]
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: `pfd` is a valid, initialised pollfd and we pass a count of one.
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    fn flush(&self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

/// The write side of a [`RecorderPumpThread`](crate::RecorderPumpThread).
pub trait RecordSink: Send {
    /// Write the whole batch. `halted` reports a pending stop; implementations
    /// that retry interrupted writes must give up once it returns `true`.
    fn write_data(&mut self, data: &[u8], halted: &dyn Fn() -> bool) -> io::Result<usize>;

    /// Flush any sink-side buffering. Called once when the recorder loop exits.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts a [`Sink`] into a [`RecordSink`] with a partial-write loop.
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl RecordSink for SinkWriter {
    fn write_data(&mut self, data: &[u8], halted: &dyn Fn() -> bool) -> io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.sink.write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if classify(&e) == IoClass::Retry && !halted() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}
