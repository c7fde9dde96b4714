use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, kill, SigSet};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub mod dump;
mod image;
pub mod restore;

/// Duplicates descriptor `fd` of process `pid` into this process.
pub(crate) fn pidfd_getfd(pid: Pid, fd: RawFd) -> Result<OwnedFd> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    let pidfd = Errno::result(pidfd).with_context(|| format!("failed to open pidfd for {pid}"))?;
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

    let dup = unsafe {
        libc::syscall(
            libc::SYS_pidfd_getfd,
            std::os::fd::AsRawFd::as_raw_fd(&pidfd),
            fd,
            0,
        )
    };
    let dup = Errno::result(dup)
        .with_context(|| format!("failed to take descriptor {fd} from {pid}"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup as RawFd) })
}

// The revive process stays around while the restored program runs, reaping it
// and forwarding the signals it receives.
#[tracing::instrument(level = "trace")]
pub(crate) fn handle_foreground(child_pid: Pid) -> Result<i32> {
    tracing::trace!("waiting for the restored process to exit");
    let signal_set = SigSet::all();
    signal_set
        .thread_block()
        .with_context(|| "failed to call pthread_sigmask")?;
    // A child that is already gone raised its SIGCHLD before the mask was in
    // place, so no signal is pending for it.
    if let Some(code) = reap(child_pid)? {
        return Ok(code);
    }
    loop {
        match signal_set
            .wait()
            .with_context(|| "failed to call sigwait")?
        {
            signal::SIGCHLD => {
                if let Some(code) = reap(child_pid)? {
                    return Ok(code);
                }
            }
            signal => {
                tracing::trace!(?signal, "forwarding signal");
                let _ = kill(child_pid, Some(signal)).map_err(|err| {
                    tracing::warn!(?err, ?signal, "failed to forward signal");
                });
            }
        }
    }
}

/// Collects every exited child without blocking, returning the exit code of
/// `child_pid` once it is among them.
fn reap(child_pid: Pid) -> Result<Option<i32>> {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(pid, status) if pid == child_pid => return Ok(Some(status)),
            WaitStatus::Signaled(pid, signal, _) if pid == child_pid => {
                return Ok(Some(128 + signal as i32))
            }
            WaitStatus::StillAlive => return Ok(None),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::sys::stat::fstat;
    use nix::unistd;
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_pidfd_getfd_own_process() -> Result<()> {
        let file = tempfile::tempfile()?;
        let dup = pidfd_getfd(unistd::getpid(), file.as_raw_fd())?;
        assert_ne!(dup.as_raw_fd(), file.as_raw_fd());
        assert_eq!(
            fstat(dup.as_raw_fd())?.st_ino,
            fstat(file.as_raw_fd())?.st_ino
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_foreground_reports_exit_code() -> Result<()> {
        // run the waiting side in its own process so the blocked signal mask
        // does not leak into the test harness
        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None)?, WaitStatus::Exited(child, 7));
            }
            unistd::ForkResult::Child => match unsafe { unistd::fork()? } {
                unistd::ForkResult::Parent { child } => {
                    let code = handle_foreground(child).unwrap_or(1);
                    std::process::exit(code);
                }
                unistd::ForkResult::Child => {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                    std::process::exit(7);
                }
            },
        }
        Ok(())
    }

    #[test]
    #[serial]
    fn test_foreground_sees_child_that_exited_early() -> Result<()> {
        use std::time::{Duration, Instant};

        match unsafe { unistd::fork()? } {
            unistd::ForkResult::Parent { child } => {
                let started = Instant::now();
                let status = loop {
                    match waitpid(child, Some(WaitPidFlag::WNOHANG))? {
                        WaitStatus::StillAlive if started.elapsed() < Duration::from_secs(3) => {
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        WaitStatus::StillAlive => {
                            let _ = kill(child, signal::SIGKILL);
                            let _ = waitpid(child, None);
                            panic!("handle_foreground kept waiting for an exited child");
                        }
                        status => break status,
                    }
                };
                assert_eq!(status, WaitStatus::Exited(child, 5));
            }
            unistd::ForkResult::Child => match unsafe { unistd::fork()? } {
                unistd::ForkResult::Parent { child } => {
                    // the child is a zombie before any signal is blocked
                    std::thread::sleep(Duration::from_millis(200));
                    let code = handle_foreground(child).unwrap_or(1);
                    std::process::exit(code);
                }
                unistd::ForkResult::Child => std::process::exit(5),
            },
        }
        Ok(())
    }
}
