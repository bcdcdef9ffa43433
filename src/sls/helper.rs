//! External helper port
//!
//! Some settings have no flat file to edit; their descriptor names a command
//! that prints the current value and one that accepts a new value on standard
//! input. Commands are run through `sh -c` with a bounded timeout.

use std::process::Command;
use std::time::Duration;
use tracing::debug;

use crate::error::{JobServiceError, Result};
use crate::exec::{run_command, ExecError};

/// Runs descriptor helper commands
#[derive(Debug, Clone)]
pub struct ExternalHelper {
    shell: String,
    timeout: Duration,
}

impl ExternalHelper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shell: "sh".to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `command` and return what it printed, minus one trailing newline.
    pub fn fetch(&self, command: &str) -> Result<String> {
        debug!(command, "ExternalHelper::fetch");
        let mut stdout = self.run(command, None)?;
        if stdout.ends_with('\n') {
            stdout.pop();
            if stdout.ends_with('\r') {
                stdout.pop();
            }
        }
        Ok(stdout)
    }

    /// Run `command` with `payload` on standard input.
    pub fn push(&self, command: &str, payload: &str) -> Result<()> {
        debug!(command, "ExternalHelper::push");
        self.run(command, Some(payload)).map(|_| ())
    }

    fn run(&self, command: &str, stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);

        let output = run_command(&mut cmd, stdin, self.timeout).map_err(|e| match e {
            ExecError::TimedOut(t) => JobServiceError::helper(command, format!("timed out after {:?}", t)),
            other => JobServiceError::helper(command, other.to_string()),
        })?;
        output
            .ensure_success()
            .map_err(|reason| JobServiceError::helper(command, reason))?;
        Ok(output.stdout)
    }
}

impl Default for ExternalHelper {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_trims_one_newline() {
        let helper = ExternalHelper::default();
        assert_eq!(helper.fetch("printf 'yes\\n'").unwrap(), "yes");
        assert_eq!(helper.fetch("printf 'a\\n\\n'").unwrap(), "a\n");
        assert_eq!(helper.fetch("true").unwrap(), "");
    }

    #[test]
    fn test_fetch_failure_is_not_empty_value() {
        let helper = ExternalHelper::default();
        let err = helper.fetch("echo broken >&2; exit 1").unwrap_err();
        match err {
            JobServiceError::HelperExecution { reason, .. } => assert!(reason.contains("broken")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_push_feeds_stdin() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("value");
        let helper = ExternalHelper::default();

        helper
            .push(&format!("cat > '{}'", target.display()), "new-value")
            .unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new-value");
    }

    #[test]
    fn test_timeout_is_helper_error() {
        let helper = ExternalHelper::new(Duration::from_millis(200));
        let err = helper.fetch("sleep 30").unwrap_err();
        match err {
            JobServiceError::HelperExecution { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
