//! Bounded execution of external programs
//!
//! Helper programs named by settings descriptors and init system control
//! commands both run through [`run_command`]. Each child is placed in its own
//! process group so a timed-out command can be killed together with anything
//! it spawned, and it is told to die if jobservice itself dies.
//!
//! Output is captured on reader threads while the parent waits, so a chatty
//! child cannot fill a pipe and stall past its deadline.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Reasons a command could not produce an exit status
#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be started
    #[error("failed to spawn: {0}")]
    Spawn(std::io::Error),

    /// The program outlived its deadline and was killed
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Waiting on the program or reading its output failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output from a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited with code 0.
    pub success: bool,
}

impl CommandOutput {
    /// Check that the command succeeded, describing the failure otherwise.
    pub fn ensure_success(&self) -> Result<(), String> {
        if self.success {
            Ok(())
        } else {
            let code = self
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = self.stderr.trim();
            if detail.is_empty() {
                Err(format!("exit code {}", code))
            } else {
                Err(format!("exit code {}: {}", code, detail))
            }
        }
    }
}

/// Run `cmd` to completion, feeding `stdin` if given, for at most `timeout`.
///
/// The deadline covers draining stdout and stderr too: a background process
/// that inherited the pipes cannot hold the call open after the child exits.
/// A non-zero exit is not an error here; callers decide what it means.
pub fn run_command(
    cmd: &mut Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    debug!(command = ?cmd, timeout = ?timeout, "run_command: spawning");

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .in_new_process_group();

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let pid = child.id();

    let feeder = match (stdin, child.stdin.take()) {
        (Some(payload), Some(mut pipe)) => {
            let payload = payload.to_owned();
            Some(thread::spawn(move || pipe.write_all(payload.as_bytes())))
        }
        _ => None,
    };
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            warn!(pid, "run_command: deadline passed, killing process group");
            kill_group(&mut child, pid);
            let _ = child.wait();
            return Err(ExecError::TimedOut(timeout));
        }
    };

    let (stdout, stderr) = match (
        collect_output(&stdout_reader, deadline),
        collect_output(&stderr_reader, deadline),
    ) {
        (Some(stdout), Some(stderr)) => (stdout?, stderr?),
        _ => {
            warn!(pid, "run_command: output still open at deadline, killing process group");
            kill_group(&mut child, pid);
            return Err(ExecError::TimedOut(timeout));
        }
    };

    // The feeder may still be blocked on a pipe held by a leftover process
    if let Some(feeder) = feeder.filter(|f| f.is_finished()) {
        match feeder.join() {
            Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                debug!(pid, error = %e, "run_command: writing stdin failed");
            }
            _ => {}
        }
    }

    debug!(pid, status = ?status, "run_command: finished");
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        success: status.success(),
    })
}

fn kill_group(child: &mut Child, pid: u32) {
    if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
        debug!(pid, error = %e, "run_command: group kill failed, killing child");
        let _ = child.kill();
    }
}

/// Reader thread delivering a pipe's full content once it reaches EOF
fn spawn_reader<R>(pipe: Option<R>) -> Receiver<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let result = match pipe {
            Some(mut pipe) => pipe.read_to_end(&mut buf).map(|_| buf),
            None => Ok(buf),
        };
        // The receiver is gone when the command already timed out
        let _ = tx.send(result);
    });
    rx
}

/// Wait for a reader until `deadline`. `None` means the pipe is still open.
fn collect_output(
    reader: &Receiver<std::io::Result<Vec<u8>>>,
    deadline: Instant,
) -> Option<Result<Vec<u8>, ExecError>> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match reader.recv_timeout(remaining) {
        Ok(result) => Some(result.map_err(ExecError::Io)),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(ExecError::Io(std::io::Error::other(
            "output reader thread panicked",
        )))),
    }
}

/// Send a signal to an entire process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run as the leader of its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Helpers must not outlive us mid-write
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_captures_stdout_and_exit_code() {
        let out = run_command(&mut sh("echo hello; exit 0"), None, Duration::from_secs(5)).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.ensure_success().is_ok());
    }

    #[test]
    fn test_nonzero_exit_is_reported_not_raised() {
        let out = run_command(&mut sh("echo oops >&2; exit 3"), None, Duration::from_secs(5)).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        let err = out.ensure_success().unwrap_err();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn test_stdin_is_fed() {
        let out = run_command(&mut sh("cat"), Some("payload\n"), Duration::from_secs(5)).unwrap();
        assert_eq!(out.stdout, "payload\n");
    }

    #[test]
    fn test_timeout_kills_child() {
        let start = Instant::now();
        let result = run_command(&mut sh("sleep 30"), None, Duration::from_millis(200));
        assert!(matches!(result, Err(ExecError::TimedOut(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_background_process_holding_output_is_bounded() {
        let start = Instant::now();
        let result = run_command(&mut sh("sleep 30 & exit 0"), None, Duration::from_millis(500));
        assert!(matches!(result, Err(ExecError::TimedOut(_))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_background_process_with_closed_output_is_fine() {
        let out = run_command(
            &mut sh("sleep 5 >/dev/null 2>&1 & echo started"),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "started\n");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let mut cmd = Command::new("/nonexistent/jobservice-test-program");
        let result = run_command(&mut cmd, None, Duration::from_secs(1));
        assert!(matches!(result, Err(ExecError::Spawn(_))));
    }
}
