use std::io;

/// Which side of a fork this process image is.
///
/// A tagged result instead of a raw pid test: the two branches of
/// `create_worker` diverge into different initialization paths, and the
/// caller dispatches on this explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The original process; `pid` is the new child.
    Parent { pid: libc::pid_t },
    /// The freshly forked child.
    Child,
}

/// Fork the current process.
pub fn fork() -> io::Result<Forked> {
    // SAFETY: fork(2) has no memory-safety preconditions of its own. Both
    // resulting images are responsible for discarding the resources they do
    // not own, which the caller's branch dispatch handles.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent { pid }),
    }
}

/// Send `signal` to `pid`.
pub(crate) fn kill(pid: libc::pid_t, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) with a tracked pid; an ESRCH from a pid that exited
    // between lookup and delivery surfaces as an error for the caller.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Collect one exited child without blocking.
///
/// Returns `Some((pid, raw_wait_status))` for a reaped child, `None` when no
/// child is currently waitable (including ECHILD).
pub(crate) fn reap_any() -> Option<(libc::pid_t, i32)> {
    let mut status = 0;
    // SAFETY: `status` is a valid writable int for waitpid(2) to fill.
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        Some((pid, status))
    } else {
        None
    }
}
