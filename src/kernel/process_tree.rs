/// Stage membership outside the process group
///
/// A process that calls `setsid()` leaves its stage's process group, so a
/// group kill misses it. Every stage process is started with a unique token
/// in its environment, which its descendants inherit. At teardown the
/// supervisor scans `/proc` for live processes carrying the token, plus
/// anything parented by them or by the still-unreaped leader, and kills them.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs;

/// Environment variable holding the stage token
pub const STAGE_TOKEN_VAR: &str = "CODEBOX_STAGE";

/// Scans after the first one catch processes forked while the kill was in flight.
const MAX_KILL_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub ppid: i32,
    pub state: char,
}

impl ProcStat {
    /// Zombies and dead entries hold no running code.
    pub fn is_running(&self) -> bool {
        !matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are read after the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let mut rest = content.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcStat { pid, ppid, state })
}

/// Current state of one process, `None` once it is gone.
pub fn read_stat(pid: i32) -> Option<ProcStat> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&content)
}

/// Whether a process has stopped running. A zombie counts as stopped: it is
/// only waiting for its parent to reap it.
pub fn has_exited(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Err(Errno::ESRCH) => true,
        _ => read_stat(pid).map(|stat| !stat.is_running()).unwrap_or(true),
    }
}

fn all_processes() -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()))
        .filter_map(read_stat)
        .collect()
}

fn carries_token(pid: i32, marker: &[u8]) -> bool {
    match fs::read(format!("/proc/{}/environ", pid)) {
        Ok(environ) => environ.split(|&byte| byte == 0).any(|entry| entry == marker),
        Err(_) => false,
    }
}

/// Live processes belonging to the stage tagged `token`: everything carrying
/// the token, everything under `roots`, and their descendants.
pub fn stage_members(token: &str, roots: &[Pid]) -> Vec<Pid> {
    let marker = format!("{}={}", STAGE_TOKEN_VAR, token).into_bytes();
    let own_pid = std::process::id() as i32;
    let processes: Vec<ProcStat> = all_processes()
        .into_iter()
        .filter(|stat| stat.is_running() && stat.pid != own_pid)
        .collect();

    let mut members: HashSet<i32> = processes
        .iter()
        .filter(|stat| carries_token(stat.pid, &marker))
        .map(|stat| stat.pid)
        .collect();
    members.extend(roots.iter().map(|pid| pid.as_raw()));

    loop {
        let before = members.len();
        for stat in &processes {
            if members.contains(&stat.ppid) {
                members.insert(stat.pid);
            }
        }
        if members.len() == before {
            break;
        }
    }

    members.remove(&own_pid);
    let mut members: Vec<Pid> = members.into_iter().map(Pid::from_raw).collect();
    members.sort_by_key(|pid| pid.as_raw());
    members
}

/// SIGKILL every live member of a stage. Returns how many were signalled.
pub fn kill_stage(token: &str, roots: &[Pid]) -> usize {
    let mut signalled: HashSet<Pid> = HashSet::new();

    for _ in 0..MAX_KILL_ROUNDS {
        let fresh: Vec<Pid> = stage_members(token, roots)
            .into_iter()
            .filter(|pid| !signalled.contains(pid))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for pid in fresh {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => log::warn!("Failed to kill stage process {}: {}", pid, e),
            }
            signalled.insert(pid);
        }
    }

    signalled.len()
}
