use std::io;
use std::process;

use crate::fork::{fork, Forked};

/// Detach the current process into a daemon.
///
/// One-shot startup helper: double-fork with a setsid(2) in between so the
/// surviving process can never reacquire a controlling terminal, then clear
/// the umask. Must run before the first `create_worker` call; the
/// intermediate parents exit(0).
pub fn daemonize() -> io::Result<()> {
    if let Forked::Parent { .. } = fork()? {
        process::exit(0);
    }

    // SAFETY: called from a forked child, which is guaranteed not to be a
    // process-group leader, so setsid(2) can only fail on exotic kernels.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Forked::Parent { .. } = fork()? {
        process::exit(0);
    }

    // SAFETY: umask(2) cannot fail.
    unsafe {
        libc::umask(0);
    }

    Ok(())
}
