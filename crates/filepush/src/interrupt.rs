//! Knocking a pump thread out of a blocking syscall.
//!
//! On Unix the worker is sent `SIGUSR1`, whose process-wide handler does
//! nothing and is installed without `SA_RESTART`: the blocked `read`, `write`
//! or `poll` then fails with `EINTR`, which std reports as
//! [`ErrorKind::Interrupted`](std::io::ErrorKind::Interrupted). The loops
//! re-check their halt flag right after any such failure.
//!
//! Elsewhere interrupting is a no-op and the loops rely on that re-check alone.

use std::thread::JoinHandle;

use parking_lot::Mutex;

#[cfg(unix)]
mod imp {
    use std::os::unix::thread::JoinHandleExt;
    use std::sync::Once;
    use std::thread::JoinHandle;

    use tracing::warn;

    pub type RawThread = libc::pthread_t;

    static INSTALL: Once = Once::new();

    extern "C" fn on_wake(_signal: libc::c_int) {}

    pub fn install_wake_handler() {
        INSTALL.call_once(|| {
            // SAFETY: the handler is async-signal-safe (it does nothing) and the
            // sigaction struct is fully initialised before use.
            let rc = unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_wake as extern "C" fn(libc::c_int) as libc::sighandler_t;
                action.sa_flags = 0;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut())
            };
            if rc != 0 {
                warn!(
                    error = %std::io::Error::last_os_error(),
                    "failed to install SIGUSR1 handler, blocking calls cannot be interrupted"
                );
            }
        });
    }

    pub fn raw_thread<T>(handle: &JoinHandle<T>) -> RawThread {
        handle.as_pthread_t() as RawThread
    }

    pub fn wake(thread: RawThread) {
        // SAFETY: `thread` belongs to a JoinHandle that has not been joined yet,
        // so the pthread_t is still valid.
        unsafe {
            libc::pthread_kill(thread, libc::SIGUSR1);
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::thread::JoinHandle;

    pub type RawThread = ();

    pub fn install_wake_handler() {}

    pub fn raw_thread<T>(_handle: &JoinHandle<T>) -> RawThread {}

    pub fn wake(_thread: RawThread) {}
}

/// Targets one worker thread at a time.
#[derive(Debug)]
pub struct WorkerInterrupter {
    target: Mutex<Option<imp::RawThread>>,
}

impl Default for WorkerInterrupter {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerInterrupter {
    /// Create an interrupter, installing the wake-up handler if needed. Must
    /// happen before any worker that may be interrupted is spawned.
    pub fn new() -> Self {
        imp::install_wake_handler();
        Self {
            target: Mutex::new(None),
        }
    }

    /// Point at a freshly spawned worker.
    pub fn attach<T>(&self, handle: &JoinHandle<T>) {
        *self.target.lock() = Some(imp::raw_thread(handle));
    }

    /// Forget the worker; call before joining it.
    pub fn detach(&self) {
        *self.target.lock() = None;
    }

    pub fn interrupt(&self) {
        if let Some(thread) = *self.target.lock() {
            imp::wake(thread);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn interrupt_breaks_a_blocking_read() {
        let interrupter = WorkerInterrupter::new();
        let (mut reader, _writer) = UnixStream::pair().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });
        interrupter.attach(&handle);

        // The signal may land before the read blocks; keep knocking until it returns.
        while !handle.is_finished() {
            interrupter.interrupt();
            std::thread::sleep(Duration::from_millis(5));
        }
        interrupter.detach();

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    }
}
