//! Waiting for, killing and reaping the supervised child.

use crate::config::types::{KeeperError, Result};
use crate::core::types::ResourceUsage;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{setpgid, Pid};
use std::mem::MaybeUninit;
use std::time::Duration;

/// How a wait ended for the child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
    /// Still alive; must be killed and reaped before finishing
    Stopped(Signal),
}

impl ChildExit {
    pub fn is_reaped(&self) -> bool {
        !matches!(self, ChildExit::Stopped(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReapedChild {
    pub exit: ChildExit,
    pub usage: ResourceUsage,
}

/// Result of one blocking wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitEvent {
    /// A signal handler ran; the keeper should look at its flags
    Interrupted,
    Changed(ReapedChild),
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

fn usage_from_rusage(rus: &libc::rusage) -> ResourceUsage {
    ResourceUsage {
        cpu_time: timeval_to_duration(rus.ru_utime) + timeval_to_duration(rus.ru_stime),
        wall_time: Duration::ZERO,
        max_rss_kb: rus.ru_maxrss.max(0) as u64,
        voluntary_switches: rus.ru_nvcsw.max(0) as u64,
        forced_switches: rus.ru_nivcsw.max(0) as u64,
    }
}

fn decode_status(pid: Pid, status: libc::c_int) -> Result<ChildExit> {
    match WaitStatus::from_raw(pid, status)? {
        WaitStatus::Exited(_, code) => Ok(ChildExit::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Ok(ChildExit::Signaled(sig)),
        WaitStatus::Stopped(_, sig) => Ok(ChildExit::Stopped(sig)),
        other => Err(KeeperError::Process(format!(
            "wait4: unknown status {:?}",
            other
        ))),
    }
}

fn wait4_raw(pid: Pid) -> std::result::Result<(libc::c_int, libc::rusage), Errno> {
    let mut status: libc::c_int = 0;
    let mut rus = MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: status and rus point to writable memory owned by this frame.
    let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, libc::WUNTRACED, rus.as_mut_ptr()) };
    if rc < 0 {
        return Err(Errno::last());
    }
    if rc != pid.as_raw() {
        return Err(Errno::ECHILD);
    }
    // SAFETY: zero-initialized and filled in by a successful wait4.
    Ok((status, unsafe { rus.assume_init() }))
}

/// Block until the child changes state or a handled signal arrives
pub fn wait_child(pid: Pid) -> Result<WaitEvent> {
    match wait4_raw(pid) {
        Ok((status, rus)) => Ok(WaitEvent::Changed(ReapedChild {
            exit: decode_status(pid, status)?,
            usage: usage_from_rusage(&rus),
        })),
        Err(Errno::EINTR) => Ok(WaitEvent::Interrupted),
        Err(e) => Err(KeeperError::Process(format!("wait4: {}", e))),
    }
}

/// Block until the child is really gone, riding out signal interruptions
pub fn reap_blocking(pid: Pid) -> Result<ReapedChild> {
    loop {
        match wait_child(pid)? {
            WaitEvent::Interrupted => continue,
            WaitEvent::Changed(reaped) if reaped.exit.is_reaped() => return Ok(reaped),
            // stopped after the kill was sent; SIGKILL still wins
            WaitEvent::Changed(_) => continue,
        }
    }
}

/// SIGKILL the child's process group and the child itself.
/// The child may already be gone, so ESRCH is not an error.
/// Put the child into its own process group from the keeper's side.
/// EACCES (already exec'd) and ESRCH (already gone) mean the child's own
/// setpgid has done the job.
pub fn lead_own_group(pid: Pid) -> Result<()> {
    match setpgid(pid, pid) {
        Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(KeeperError::Process(format!("setpgid({}): {}", pid, e.desc()))),
    }
}

pub fn kill_process_tree(pid: Pid) {
    if let Err(e) = killpg(pid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            log::debug!("killpg({}): {}", pid, e);
        }
    }
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            log::debug!("kill({}): {}", pid, e);
        }
    }
}

/// Kill whatever is left of a reaped child's process group
pub fn sweep_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => log::debug!("Swept leftover processes of group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => log::debug!("killpg({}): {}", pgid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, ForkResult};

    fn spawn_exiting(code: i32) -> Pid {
        // SAFETY: the child only calls _exit.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(code) },
            ForkResult::Parent { child } => child,
        }
    }

    #[test]
    fn test_reap_exit_code() {
        let pid = spawn_exiting(7);
        let reaped = reap_blocking(pid).unwrap();
        assert_eq!(reaped.exit, ChildExit::Exited(7));
    }

    #[test]
    fn test_kill_and_reap_sleeping_child() {
        // SAFETY: the child only calls async-signal-safe functions.
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe {
                libc::setpgid(0, 0);
                loop {
                    libc::pause();
                }
            },
            ForkResult::Parent { child } => child,
        };
        // make sure the group exists before signalling it
        lead_own_group(pid).unwrap();
        assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap(), pid);
        kill_process_tree(pid);
        let reaped = reap_blocking(pid).unwrap();
        assert_eq!(reaped.exit, ChildExit::Signaled(Signal::SIGKILL));
        sweep_group(pid);
    }

    #[test]
    fn test_lead_own_group_tolerates_foreign_and_gone_pids() {
        // not our child: ESRCH
        assert!(lead_own_group(Pid::from_raw(1)).is_ok());

        let pid = spawn_exiting(0);
        reap_blocking(pid).unwrap();
        assert!(lead_own_group(pid).is_ok());
    }

    #[test]
    fn test_wait_for_unknown_child_fails() {
        let err = wait_child(Pid::from_raw(i32::MAX - 1)).unwrap_err();
        assert!(err.to_string().contains("wait4"));
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 250_000,
        };
        assert_eq!(timeval_to_duration(tv), Duration::from_millis(1250));
    }
}
