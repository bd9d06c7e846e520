use tracing::debug;

/// Best-effort graceful termination by pid. A missing process is the
/// expected case after a crash and is ignored.
pub fn terminate(pid: u32) {
    #[cfg(unix)]
    // Safety: plain kill(2); an unused pid returns ESRCH and nothing else
    // happens.
    unsafe {
        if libc::kill(pid as libc::pid_t, libc::SIGTERM) != 0 {
            debug!(pid, "terminate: no such process");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .output();
    }
}
