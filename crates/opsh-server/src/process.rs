//! Process-group signalling shared by command runs and PTY shells.
//!
//! Both spawn their child as the leader of a fresh process group, so the
//! group id equals the child pid and one `killpg` reaches every descendant
//! that stays in that group. A PTY shell is also a session leader whose
//! background jobs get groups of their own; [`signal_session`] reaches those.

use std::io;

/// Signals the server sends to child process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminal hang-up; what a shell expects when its terminal goes away.
    Hangup,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn as_libc(self) -> libc::c_int {
        match self {
            Signal::Hangup => libc::SIGHUP,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal.as_libc()) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: Signal) -> io::Result<()> {
    Ok(())
}

/// Send `signal` to every process group in the session led by `sid`.
///
/// Every group is tried; the first error is returned.
pub fn signal_session(sid: u32, signal: Signal) -> io::Result<()> {
    let mut result = Ok(());
    for pgid in session_groups(sid) {
        if let Err(e) = signal_group(pgid, signal) {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// Process groups with at least one member in session `sid`.
#[cfg(target_os = "linux")]
fn session_groups(sid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![sid];
    };
    let mut groups = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some((pgrp, session)) = parse_stat_ids(&stat) {
            if session == sid && !groups.contains(&pgrp) {
                groups.push(pgrp);
            }
        }
    }
    groups
}

#[cfg(not(target_os = "linux"))]
fn session_groups(sid: u32) -> Vec<u32> {
    vec![sid]
}

/// Pull `(pgrp, session)` out of a `/proc/<pid>/stat` line. The command name
/// is parenthesised and may itself contain spaces or parentheses.
#[cfg(target_os = "linux")]
fn parse_stat_ids(stat: &str) -> Option<(u32, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    let session = fields.next()?.parse().ok()?;
    Some((pgrp, session))
}

/// True while `pid` exists and is not a zombie.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Exit code for a finished child, using the shell convention `128 + n`
/// for a child terminated by signal `n`.
pub fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}
