//! Small process-related helpers shared across the workspace.
//!
//! Besides command construction, this crate addresses running processes by pid so
//! callers that only persisted a pid (not a `Child` handle) can still stop them.

#[cfg(feature = "tokio")]
use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

fn checked_pid(pid: u32) -> io::Result<i32> {
    // pid 0 and negative values address process groups, never a single child.
    match i32::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid process id: {pid}"),
        )),
    }
}

/// Ask a process to stop gracefully (`SIGTERM` on unix).
///
/// On Windows there is no graceful equivalent for console-less children, so this
/// behaves like [`force_kill`].
pub fn send_stop(pid: u32) -> io::Result<()> {
    let pid = checked_pid(pid)?;

    #[cfg(unix)]
    {
        signal(pid, libc::SIGTERM)
    }

    #[cfg(windows)]
    {
        taskkill(pid)
    }
}

/// Kill a process immediately (`SIGKILL` on unix).
pub fn force_kill(pid: u32) -> io::Result<()> {
    let pid = checked_pid(pid)?;

    #[cfg(unix)]
    {
        signal(pid, libc::SIGKILL)
    }

    #[cfg(windows)]
    {
        taskkill(pid)
    }
}

#[cfg(unix)]
fn signal(pid: i32, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions; pid was validated positive.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn taskkill(pid: i32) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.no_window();
    cmd.args(["/PID", &pid.to_string(), "/F"]);
    let status = cmd.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}
