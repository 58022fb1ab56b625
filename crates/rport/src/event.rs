//! Event notification for the consumer loop.
//!
//! The receive thread pokes a pipe whenever it hands a packet over, so an
//! owner running a `poll`-style event loop can watch [`EventNotifier::as_raw_fd`]
//! and call [`Channel::process`](crate::channel::Channel::process) when it
//! becomes readable. On non-Unix hosts a flag stands in for the pipe.

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::RawFd;

/// Self-pipe carrying "work available" wakeups.
#[cfg(unix)]
#[derive(Debug)]
pub struct EventNotifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

#[cfg(unix)]
impl EventNotifier {
    /// Opens a non-blocking, close-on-exec pipe.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pipe cannot be created.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element array for pipe(2) to fill.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let notifier = Self { read_fd: fds[0], write_fd: fds[1] };
        for fd in fds {
            // SAFETY: `fd` was just returned by pipe(2) and is owned by `notifier`.
            let ok = unsafe {
                let fl = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) == 0
                    && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == 0
            };
            if !ok {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(notifier)
    }

    /// Wakes the consumer. A full pipe already means a wakeup is pending.
    pub fn notify(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack variable to our own fd.
        let _ = unsafe { libc::write(self.write_fd, (&raw const byte).cast(), 1) };
    }

    /// Consumes all pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer of the stated length from our own fd.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Descriptor that becomes readable when work is handed over.
    pub const fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

#[cfg(unix)]
impl Drop for EventNotifier {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this notifier and closed exactly once.
        unsafe {
            let _ = libc::close(self.read_fd);
            let _ = libc::close(self.write_fd);
        }
    }
}

/// Flag-based stand-in for hosts without pipes.
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct EventNotifier {
    pending: std::sync::atomic::AtomicBool,
}

#[cfg(not(unix))]
impl EventNotifier {
    /// Creates the notifier.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the Unix version.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::default())
    }

    /// Marks work as available.
    pub fn notify(&self) {
        self.pending.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Clears the pending mark.
    pub fn drain(&self) {
        self.pending.store(false, std::sync::atomic::Ordering::Release);
    }
}
