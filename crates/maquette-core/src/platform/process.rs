//! Process aliveness and termination.
//!
//! The lock protocol treats "is the recorded server pid still alive" as the
//! staleness test, and forced stops need a termination primitive that first
//! offers the process a graceful exit.

// This module owns the OS boundary; each unsafe block is a single syscall.
#![allow(unsafe_code)]

use crate::error::{BridgeError, Result};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// Unix sends signal 0 (existence probe, nothing delivered); Windows opens a
/// limited-information process handle.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 only performs the permission/existence
        // check for `pid`; no signal is delivered.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        // SAFETY: OpenProcess/CloseHandle on a pid we do not dereference.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if !handle.is_null() {
                CloseHandle(handle);
                true
            } else {
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Terminate a process gracefully, then forcefully if needed.
///
/// Unix sends SIGTERM, polls up to `timeout_ms`, then SIGKILL. Windows uses
/// `taskkill /F /T`, which takes the whole tree. Returns `true` when the
/// process is gone afterwards (or was never running).
pub fn terminate_process(pid: u32, timeout_ms: u64) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_process_unix(pid, timeout_ms)
    }

    #[cfg(windows)]
    {
        terminate_process_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(BridgeError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn terminate_process_unix(pid: u32, timeout_ms: u64) -> Result<bool> {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;
    use std::time::Duration;

    let nix_pid = Pid::from_raw(pid as i32);

    debug!("Sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (timeout_ms / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Reap a potential zombie; without this the process stays in the
        // table and the aliveness check keeps returning true.
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        return Err(BridgeError::Other(format!(
            "Failed to kill process {}: {}",
            pid, e
        )));
    }

    sleep(Duration::from_millis(100));
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("Reaped process {}: {:?}", pid, status),
        Err(e) => {
            // ECHILD means another parent reaps it; that is fine.
            if e != nix::errno::Errno::ECHILD {
                debug!("waitpid({}) failed: {}", pid, e);
            }
        }
    }

    Ok(!is_process_alive(pid))
}

#[cfg(windows)]
fn terminate_process_windows(pid: u32) -> Result<bool> {
    use std::process::Command;

    debug!("Terminating process {} with taskkill", pid);
    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .output()
        .map_err(|e| BridgeError::Other(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        Ok(true)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(true)
        } else {
            warn!("taskkill failed for {}: {}", pid, stderr);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[test]
    fn test_terminate_nonexistent_succeeds() {
        let result = terminate_process(4_000_000_000, 500);
        assert!(result.is_ok());
        assert!(result.unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_child_process() {
        use std::process::Command;

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        let terminated = terminate_process(pid, 1_000).unwrap();
        assert!(terminated);
        assert!(!is_process_alive(pid));
    }
}
