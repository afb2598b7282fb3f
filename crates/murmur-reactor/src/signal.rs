use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::debug;

use crate::error::{ReactorError, Result};

/// Write end of the live signal pipe, or -1 when unclaimed.
///
/// The async-signal handler can only touch this atomic and write(2), so
/// signal dispatch is process-global: exactly one reactor owns it at a time.
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay_signal(sig: libc::c_int) {
    let fd = RELAY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // SAFETY: `byte` lives for the duration of the call and write(2) is
        // async-signal-safe. The pipe is non-blocking; if it is full the
        // signal is dropped, which the pending-signal coalescing semantics of
        // Unix already permit.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
        }
    }
}

/// Self-pipe bridging async signal delivery into the poll(2) loop.
///
/// `relay_signal` writes the signal number into the pipe; the reactor polls
/// the read end like any other descriptor and turns drained bytes into
/// `Event::Signal` dispatches on the loop thread.
#[derive(Debug)]
pub(crate) struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    watched: Vec<i32>,
}

impl SignalPipe {
    /// Create the pipe and claim the process-global relay slot.
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `fds` is a valid writable array of two file descriptors.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
        let [read_fd, write_fd] = fds;
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }

        if RELAY_FD
            .compare_exchange(-1, write_fd, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: both fds were just created by pipe(2) and are owned here.
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(ReactorError::SignalOwner);
        }

        Ok(Self {
            read_fd,
            write_fd,
            watched: Vec::new(),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Install the relay handler for `sig`.
    pub fn watch(&mut self, sig: i32) -> Result<()> {
        if self.watched.contains(&sig) {
            return Ok(());
        }

        // SAFETY: zeroed sigaction is a valid starting point; the fields set
        // below fully describe the handler. `sigaction` with a null oldact is
        // permitted.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = relay_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(ReactorError::Io(io::Error::last_os_error()));
            }
        }

        debug!(sig, "watching signal");
        self.watched.push(sig);
        Ok(())
    }

    /// Drain every pending signal byte from the pipe.
    pub fn drain(&self) -> Vec<i32> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` is a valid writable buffer of the given length and
            // `read_fd` is an open descriptor owned by this pipe.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            signals.extend(buf[..n as usize].iter().map(|&b| i32::from(b)));
        }
        signals
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // Restore default dispositions so a forked child that discards the
        // inherited loop starts with a clean signal slate.
        for &sig in &self.watched {
            // SAFETY: zeroed sigaction with SIG_DFL resets the handler.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(sig, &action, std::ptr::null_mut());
            }
        }

        let _ = RELAY_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // SAFETY: both fds are owned by this pipe and closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an owned open descriptor with valid flag arguments.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(ReactorError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
