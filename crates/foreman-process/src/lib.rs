//! Subprocess spawn/poll/timeout/kill, process-tree walking, and graceful
//! `SIGTERM -> SIGKILL` escalation, grounded on the teacher's
//! `run_command_with_timeout` poll loop and generalized to the pulse's
//! two-phase hang handling (§5).
//!
//! Process signalling has no safe std equivalent, so this crate carries a
//! narrow, audited exception to the workspace's blanket `unsafe_code` lint,
//! granted via this crate's own `Cargo.toml` (a `#![allow]` attribute here
//! cannot override the workspace's `forbid`).

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to poll child: {0}")]
    Poll(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run `program args` in `working_dir`, returning its captured output. If
/// `timeout` elapses first the child is killed and `timed_out` is set.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ProcessError> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);

    let (exit_code, stdout, stderr, timed_out) = match timeout {
        Some(timeout_dur) => {
            let mut child = command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|source| ProcessError::Spawn {
                    program: program.to_string(),
                    source,
                })?;

            let deadline = Instant::now() + timeout_dur;
            loop {
                match child.try_wait().map_err(ProcessError::Poll)? {
                    Some(status) => {
                        let (out, err) = drain(&mut child);
                        break (status.code().unwrap_or(-1), out, err, false);
                    }
                    None => {
                        if Instant::now() >= deadline {
                            let _ = child.kill();
                            let _ = child.wait();
                            let (out, mut err) = drain(&mut child);
                            err.push_str(&format!(
                                "\ncommand timed out after {}",
                                humantime::format_duration(timeout_dur)
                            ));
                            break (-1, out, err, true);
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        }
        None => {
            let output = command
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(|source| ProcessError::Spawn {
                    program: program.to_string(),
                    source,
                })?;
            (
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                false,
            )
        }
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain(child: &mut Child) -> (String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    if let Some(mut o) = child.stdout.take() {
        let _ = o.read_to_end(&mut out);
    }
    if let Some(mut e) = child.stderr.take() {
        let _ = e.read_to_end(&mut err);
    }
    (
        String::from_utf8_lossy(&out).to_string(),
        String::from_utf8_lossy(&err).to_string(),
    )
}

/// Whether a process with the given pid currently exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 is a pure existence/permission probe, no process
    // state is mutated.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Send `SIGTERM`, matching the teacher's preference for a graceful
/// stop-then-verify step before any hard kill.
#[cfg(unix)]
pub fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) {}

/// Send `SIGKILL`.
#[cfg(unix)]
pub fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill(_pid: u32) {}

/// Walk `/proc` to find every pid whose parent is `pid`, recursively.
/// Returns an empty vec on non-Linux platforms or if `/proc` is
/// unavailable — process-tree walking degrades to "just the one pid"
/// rather than failing the caller.
#[cfg(target_os = "linux")]
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut children_of: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Ok(this_pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let stat_path = entry.path().join("stat");
        let Ok(stat) = std::fs::read_to_string(&stat_path) else {
            continue;
        };
        // Format: "pid (comm) state ppid ...". `comm` may contain spaces or
        // parens, so find the ppid field after the last ')'.
        let Some(after_comm) = stat.rsplit_once(')') else {
            continue;
        };
        let fields: Vec<&str> = after_comm.1.split_whitespace().collect();
        let Some(ppid_str) = fields.get(1) else {
            continue;
        };
        let Ok(ppid) = ppid_str.parse::<u32>() else {
            continue;
        };
        children_of.entry(ppid).or_default().push(this_pid);
    }

    let mut result = Vec::new();
    let mut stack = vec![pid];
    while let Some(current) = stack.pop() {
        if let Some(children) = children_of.get(&current) {
            for &child in children {
                result.push(child);
                stack.push(child);
            }
        }
    }
    result
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(_pid: u32) -> Vec<u32> {
    Vec::new()
}

/// Two-phase graceful shutdown of a pid and its descendant tree: `SIGTERM`
/// bottom-up, wait `grace_period`, then `SIGKILL` anything still alive.
pub fn terminate_tree(pid: u32, grace_period: Duration) {
    let mut tree = descendants(pid);
    tree.push(pid);
    // Bottom-up: children first so a parent doesn't respawn anything while
    // we're still working through its descendants.
    for &p in tree.iter().rev() {
        terminate(p);
    }
    std::thread::sleep(grace_period);
    for &p in tree.iter().rev() {
        if is_alive(p) {
            kill(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_timeout_captures_output() {
        let td = tempfile::tempdir().unwrap();
        let out = run_with_timeout("echo", &["hello"], td.path(), None).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[test]
    fn run_with_timeout_kills_long_running_command() {
        let td = tempfile::tempdir().unwrap();
        let out = run_with_timeout(
            "sleep",
            &["5"],
            td.path(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
        assert!(out.timed_out);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn nonexistent_pid_is_not_alive() {
        assert!(!is_alive(u32::MAX - 1));
    }
}
