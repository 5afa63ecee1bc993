/// Supervised child processes
///
/// Each stage runs as the leader of its own process group and carries a
/// stage token in its environment. The supervisor polls the child against a
/// wall-clock deadline and the output budget. On timeout, on overflow and
/// after the leader exits it kills the group and every process still
/// carrying the token, so no descendant outlives the stage, including one
/// that started its own session.
use crate::config::types::{CodeboxError, OutputIntegrity, Result, TIMEOUT_EXIT_CODE};
use crate::exec::output::OutputCollector;
use crate::kernel::process_tree::{self, STAGE_TOKEN_VAR};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One process to run inside a workspace
#[derive(Debug, Clone)]
pub struct StageCommand<'a> {
    pub argv: Vec<OsString>,
    pub workdir: &'a Path,
    pub environment: &'a [(&'a str, &'a str)],
    pub timeout: Duration,
    pub output_limit: usize,
}

/// What happened to one supervised process
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub integrity: OutputIntegrity,
    pub wall_time: Duration,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Normal exit code, or `128 + signal` for a signal death.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// SIGKILL every member of a process group. A group that is already gone is
/// not an error.
pub fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Kill everything that belongs to a stage. `leader` is passed only while
/// the leader has not been reaped, so its pid cannot have been reused.
fn terminate_stage(pgid: Pid, token: &str, leader: Option<Pid>) {
    let roots: Vec<Pid> = leader.into_iter().collect();
    let escaped = process_tree::kill_stage(token, &roots);
    kill_group(pgid);
    if escaped > 0 {
        log::debug!("Killed {} process(es) of stage group {}", escaped, pgid);
    }
}

/// Spawn the command and supervise it to completion.
///
/// Only a spawn or wait failure is an `Err`; timeouts, signal deaths and
/// non-zero exits are reported in the outcome.
pub fn run_stage(cmd: &StageCommand<'_>) -> Result<StageOutcome> {
    let (program, args) = cmd
        .argv
        .split_first()
        .ok_or_else(|| CodeboxError::Process("empty command".to_string()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cmd.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    let token = uuid::Uuid::new_v4().simple().to_string();
    command.env(STAGE_TOKEN_VAR, &token);
    for (key, value) in cmd.environment {
        command.env(key, value);
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| CodeboxError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let pgid = Pid::from_raw(child.id() as i32);
    log::debug!("Spawned {:?} as group {}", program, pgid);

    let collector = OutputCollector::spawn(child.stdout.take(), child.stderr.take(), cmd.output_limit);

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= cmd.timeout {
                    timed_out = true;
                } else if !collector.exceeded() {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                terminate_stage(pgid, &token, Some(pgid));
                match child.wait() {
                    Ok(status) => break status,
                    Err(e) => {
                        return Err(CodeboxError::Process(format!("wait: {}", e)));
                    }
                }
            }
            Err(e) => {
                terminate_stage(pgid, &token, Some(pgid));
                let _ = child.wait();
                return Err(CodeboxError::Process(format!("wait: {}", e)));
            }
        }
    };

    // Leader is gone; take down anything it left running.
    terminate_stage(pgid, &token, None);

    let output = collector.finish();
    let wall_time = started.elapsed();

    let mut stderr = output.stderr;
    let exit_code = if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Time limit exceeded: killed after {} ms\n",
            cmd.timeout.as_millis()
        ));
        TIMEOUT_EXIT_CODE
    } else {
        exit_code_of(status)
    };

    Ok(StageOutcome {
        stdout: output.stdout,
        stderr,
        exit_code,
        timed_out,
        integrity: output.integrity,
        wall_time,
    })
}
