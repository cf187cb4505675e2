use std::time::{Duration, Instant};

/// Check whether a process with the given PID is alive.
///
/// `kill(pid, 0)` delivers no signal; it only performs the permission and
/// existence checks. EPERM means the process exists but belongs to another
/// user, which still counts as alive for liveness purposes.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    // No cheap probe available; assume alive and let staleness rules apply.
    pid != 0
}

/// Send SIGTERM, poll for exit up to `grace`, then SIGKILL.
///
/// Returns true if the process is gone by the time we return. ESRCH at any
/// point means it already exited.
#[cfg(unix)]
pub fn terminate_with_grace(pid: u32, grace: Duration) -> bool {
    let pid_i32 = pid as i32;

    if !pid_alive(pid) {
        return true;
    }

    if unsafe { libc::kill(pid_i32, libc::SIGTERM) } != 0 {
        return !pid_alive(pid);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    unsafe {
        libc::kill(pid_i32, libc::SIGKILL);
    }
    // SIGKILL cannot be blocked; give the kernel a beat to reap.
    std::thread::sleep(Duration::from_millis(50));
    !pid_alive(pid)
}

#[cfg(not(unix))]
pub fn terminate_with_grace(_pid: u32, _grace: Duration) -> bool {
    false
}
