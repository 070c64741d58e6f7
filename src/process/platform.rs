//! OS plumbing for backend processes.
//!
//! Each backend is spawned as the leader of a new process group so the whole
//! tree can be signalled or killed at once. On Linux the child also receives
//! SIGKILL if the supervisor dies.

use std::io;

use tokio::process::Command;

/// Signal used for the console-style stop request.
#[cfg(unix)]
pub const STOP_SIGNAL: libc::c_int = libc::SIGTERM;

/// Put the command in its own process group and tie its lifetime to ours.
pub fn isolate_process_tree(command: &mut Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command.kill_on_drop(true);
}

/// Ask every process in the group led by `pid` to stop.
#[cfg(unix)]
pub fn signal_process_group(pid: u32) -> io::Result<()> {
    send_signal(-(pid as i32), STOP_SIGNAL)
}

/// Kill every process in the group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    send_signal(-(pid as i32), libc::SIGKILL)
}

/// Kill a single process.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    send_signal(pid as i32, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(target: i32, signal: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Already gone counts as delivered.
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether a process with this pid still exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn signal_process_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process group signals are not supported"))
}

#[cfg(not(unix))]
pub fn kill_process_group(pid: u32) -> io::Result<()> {
    kill_process(pid)
}

#[cfg(not(unix))]
pub fn kill_process(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "kill by pid is not supported"))
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Whether a debugger (ptrace tracer) is attached to `pid`.
#[cfg(target_os = "linux")]
pub fn debugger_attached(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("TracerPid:"))
                .and_then(|v| v.trim().parse::<u32>().ok())
        })
        .is_some_and(|tracer| tracer != 0)
}

#[cfg(not(target_os = "linux"))]
pub fn debugger_attached(_pid: u32) -> bool {
    false
}

/// Parent pid of `pid`, if it can be read.
#[cfg(target_os = "linux")]
pub fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn parent_pid(_pid: u32) -> Option<u32> {
    None
}

/// Whether `pid` is `ancestor` or one of its descendants.
pub fn is_same_or_descendant(pid: u32, ancestor: u32) -> bool {
    let mut current = pid;
    for _ in 0..64 {
        if current == ancestor {
            return true;
        }
        match parent_pid(current) {
            Some(parent) if parent != 0 && parent != current => current = parent,
            _ => return false,
        }
    }
    false
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(u32::MAX >> 2));
    }

    #[test]
    fn descendant_walk_reaches_parent() {
        let pid = std::process::id();
        let parent = parent_pid(pid).expect("parent pid");
        assert!(is_same_or_descendant(pid, pid));
        assert!(is_same_or_descendant(pid, parent));
        assert!(!is_same_or_descendant(parent, pid));
    }

    #[tokio::test]
    async fn group_kill_reaches_grandchildren() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 30 & sleep 30");
        isolate_process_tree(&mut command);
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();

        kill_process_group(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
