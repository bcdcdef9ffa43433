//! Script-based init backend
//!
//! Jobs are the scripts in the init directory that are linked into at least
//! one `rcN.d` directory. A job is automatic when it has a start (`S`) link in
//! the active runlevel.
//!
//! Running state comes from `<script> status`, following the LSB exit codes
//! (0 running, 1-3 not running). Scripts that do not implement `status`, or
//! cannot be run, leave us with no live signal; for those, running is assumed
//! to follow the automatic flag.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobInfo, ServiceBackend};
use crate::config::SysvConfig;
use crate::error::{JobServiceError, Result};
use crate::exec::run_command;

const BACKEND_NAME: &str = "System V";
const DEFAULT_RUNLEVEL: &str = "2";

/// One `rcN.d` entry for a job
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunlevelLink {
    runlevel: String,
    start: bool,
    priority: u8,
}

/// Backend for `/etc/init.d` scripts
pub struct SysvBackend {
    config: SysvConfig,
    timeout: Duration,
    active_runlevel: String,
    links: BTreeMap<String, Vec<RunlevelLink>>,
}

impl SysvBackend {
    pub fn new(config: SysvConfig, timeout: Duration) -> Self {
        let active_runlevel = config
            .runlevel
            .clone()
            .unwrap_or_else(|| DEFAULT_RUNLEVEL.to_string());
        Self {
            config,
            timeout,
            active_runlevel,
            links: BTreeMap::new(),
        }
    }

    fn script(&self, job: &str) -> PathBuf {
        self.config.init_dir.join(job)
    }

    fn links_for(&self, job: &str) -> Result<&[RunlevelLink]> {
        self.links
            .get(job)
            .map(Vec::as_slice)
            .ok_or_else(|| JobServiceError::UnknownJob(job.to_string()))
    }

    /// Fixed runlevel from configuration, else ask `runlevel`
    fn query_runlevel(&self) -> String {
        if let Some(level) = &self.config.runlevel {
            return level.clone();
        }
        match run_command(&mut Command::new("runlevel"), None, self.timeout) {
            Ok(out) if out.success => out
                .stdout
                .split_whitespace()
                .last()
                .filter(|l| *l != "unknown")
                .map(String::from)
                .unwrap_or_else(|| DEFAULT_RUNLEVEL.to_string()),
            Ok(_) | Err(_) => {
                debug!("query_runlevel: runlevel unavailable, using default");
                DEFAULT_RUNLEVEL.to_string()
            }
        }
    }

    fn scan_links(&self) -> Result<BTreeMap<String, Vec<RunlevelLink>>> {
        let mut links: BTreeMap<String, Vec<RunlevelLink>> = BTreeMap::new();
        for entry in fs::read_dir(&self.config.rc_dir)? {
            let entry = entry?;
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let Some(runlevel) = dir_name
                .strip_prefix("rc")
                .and_then(|rest| rest.strip_suffix(".d"))
                .filter(|level| !level.is_empty())
            else {
                continue;
            };
            if !entry.path().is_dir() {
                continue;
            }
            for link in fs::read_dir(entry.path())? {
                let link_name = link?.file_name().to_string_lossy().into_owned();
                if let Some((start, priority, job)) = parse_link_name(&link_name) {
                    links.entry(job.to_string()).or_default().push(RunlevelLink {
                        runlevel: runlevel.to_string(),
                        start,
                        priority,
                    });
                }
            }
        }
        for entries in links.values_mut() {
            entries.sort_by(|a, b| (&a.runlevel, a.priority).cmp(&(&b.runlevel, b.priority)));
        }
        Ok(links)
    }

    /// Live status: Some(true/false) when the script answered, None otherwise
    fn live_status(&self, job: &str) -> Option<bool> {
        let mut cmd = Command::new(self.script(job));
        cmd.arg("status");
        match run_command(&mut cmd, None, self.timeout) {
            Ok(out) => match out.exit_code {
                Some(0) => Some(true),
                Some(1..=3) => Some(false),
                _ => None,
            },
            Err(e) => {
                debug!(job, error = %e, "live_status: status query failed");
                None
            }
        }
    }

    fn automatic(&self, links: &[RunlevelLink]) -> bool {
        links
            .iter()
            .any(|l| l.runlevel == self.active_runlevel && l.start)
    }

    fn read_pid(&self, job: &str) -> Option<u32> {
        let path = self.config.pid_dir.join(format!("{}.pid", job));
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn run_action(&self, program: PathBuf, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&program);
        cmd.args(args);
        let output = run_command(&mut cmd, None, self.timeout)
            .map_err(|e| JobServiceError::backend(BACKEND_NAME, format!("{}: {}", program.display(), e)))?;
        output.ensure_success().map_err(|reason| {
            JobServiceError::backend(
                BACKEND_NAME,
                format!("{} {}: {}", program.display(), args.join(" "), reason),
            )
        })
    }

    fn change_state(&mut self, job: &str, start: bool) -> Result<()> {
        let links = self.links_for(job)?;
        let running = self
            .live_status(job)
            .unwrap_or_else(|| self.automatic(links));
        if running == start {
            debug!(job, start, "change_state: already in requested state");
            return Ok(());
        }
        let action = if start { "start" } else { "stop" };
        self.run_action(self.script(job), &[action])?;
        info!(job, action, "Job state changed");
        Ok(())
    }
}

/// Split `S20ssh` into (start, priority, name)
fn parse_link_name(name: &str) -> Option<(bool, u8, &str)> {
    let start = match name.chars().next()? {
        'S' => true,
        'K' => false,
        _ => return None,
    };
    let digits = name.get(1..3)?;
    let priority = digits.parse().ok()?;
    let job = name.get(3..)?;
    if job.is_empty() {
        return None;
    }
    Some((start, priority, job))
}

/// Key/value pairs from an LSB `### BEGIN INIT INFO` block
fn lsb_properties(script: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    let mut parsing = false;
    for line in script.lines() {
        if !parsing {
            parsing = line.contains("### BEGIN INIT INFO");
            continue;
        }
        if line.contains("### END INIT INFO") {
            break;
        }
        let body = line.trim_start_matches('#').trim();
        if let Some((key, value)) = body.split_once(':') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

impl ServiceBackend for SysvBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn list_jobs(&mut self) -> Result<Vec<String>> {
        self.active_runlevel = self.query_runlevel();
        self.links = self.scan_links()?;

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.config.init_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_file() && self.links.contains_key(&name) {
                jobs.push(name);
            }
        }
        // links without a script are dangling
        self.links.retain(|job, _| jobs.contains(job));
        jobs.sort();
        debug!(count = jobs.len(), runlevel = %self.active_runlevel, "SysvBackend::list_jobs");
        Ok(jobs)
    }

    fn describe(&self, job: &str) -> Result<JobInfo> {
        let links = self.links_for(job)?;
        let props = match fs::read_to_string(self.script(job)) {
            Ok(content) => lsb_properties(&content),
            Err(e) => {
                warn!(job, error = %e, "describe: cannot read init script");
                BTreeMap::new()
            }
        };

        let automatic = self.automatic(links);
        let running = self.live_status(job).unwrap_or(automatic);

        let mut info = JobInfo::new(job);
        info.description = props
            .get("Short-Description")
            .or_else(|| props.get("Description"))
            .cloned()
            .unwrap_or_default();
        info.automatic = automatic;
        info.running = running;
        info.pid = if running { self.read_pid(job) } else { None };
        for link in links {
            if link.start {
                info.starton.push(link.runlevel.clone());
            } else {
                info.stopon.push(link.runlevel.clone());
            }
        }
        Ok(info)
    }

    fn start(&mut self, job: &str) -> Result<()> {
        self.change_state(job, true)
    }

    fn stop(&mut self, job: &str) -> Result<()> {
        self.change_state(job, false)
    }

    fn set_automatic(&mut self, job: &str, automatic: bool) -> Result<()> {
        self.links_for(job)?;
        let action = if automatic { "enable" } else { "disable" };
        self.run_action(PathBuf::from(&self.config.update_rc), &[job, action])?;
        self.links = self.scan_links()?;
        info!(job, automatic, "Automatic start changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_parse_link_name() {
        assert_eq!(parse_link_name("S20ssh"), Some((true, 20, "ssh")));
        assert_eq!(parse_link_name("K01cups-browsed"), Some((false, 1, "cups-browsed")));
        assert_eq!(parse_link_name("README"), None);
        assert_eq!(parse_link_name("S20"), None);
        assert_eq!(parse_link_name("Sxxssh"), None);
    }

    #[test]
    fn test_lsb_properties() {
        let script = "#!/bin/sh\n### BEGIN INIT INFO\n# Provides:          ssh\n# Short-Description: OpenBSD Secure Shell server\n### END INIT INFO\n# Description: ignored\n";
        let props = lsb_properties(script);
        assert_eq!(props.get("Provides").map(String::as_str), Some("ssh"));
        assert_eq!(
            props.get("Short-Description").map(String::as_str),
            Some("OpenBSD Secure Shell server")
        );
        assert!(!props.contains_key("Description"));
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_list_and_describe_from_tree() {
        let root = TempDir::new().unwrap();
        let init_dir = root.path().join("init.d");
        fs::create_dir_all(&init_dir).unwrap();
        fs::create_dir_all(root.path().join("rc2.d")).unwrap();
        fs::create_dir_all(root.path().join("rc0.d")).unwrap();

        write_script(
            &init_dir,
            "alpha",
            "#!/bin/sh\n### BEGIN INIT INFO\n# Short-Description: Alpha daemon\n### END INIT INFO\ncase \"$1\" in status) exit 3;; esac\n",
        );
        write_script(&init_dir, "unlinked", "#!/bin/sh\nexit 0\n");
        fs::write(root.path().join("rc2.d/S20alpha"), "").unwrap();
        fs::write(root.path().join("rc0.d/K80alpha"), "").unwrap();
        fs::write(root.path().join("rc2.d/S10ghost"), "").unwrap();

        let config = SysvConfig {
            init_dir,
            rc_dir: root.path().to_path_buf(),
            runlevel: Some("2".to_string()),
            ..SysvConfig::default()
        };
        let mut backend = SysvBackend::new(config, Duration::from_secs(5));

        assert_eq!(backend.list_jobs().unwrap(), vec!["alpha"]);

        let info = backend.describe("alpha").unwrap();
        assert_eq!(info.description, "Alpha daemon");
        assert!(info.automatic);
        assert!(!info.running, "status exit 3 means stopped");
        assert_eq!(info.starton, vec!["2"]);
        assert_eq!(info.stopon, vec!["0"]);

        assert!(matches!(
            backend.describe("ghost"),
            Err(JobServiceError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_running_approximates_automatic_without_status() {
        let root = TempDir::new().unwrap();
        let init_dir = root.path().join("init.d");
        fs::create_dir_all(&init_dir).unwrap();
        fs::create_dir_all(root.path().join("rc3.d")).unwrap();
        // exit 4: status unsupported
        write_script(&init_dir, "legacy", "#!/bin/sh\nexit 4\n");
        fs::write(root.path().join("rc3.d/S50legacy"), "").unwrap();

        let config = SysvConfig {
            init_dir,
            rc_dir: root.path().to_path_buf(),
            runlevel: Some("3".to_string()),
            ..SysvConfig::default()
        };
        let mut backend = SysvBackend::new(config, Duration::from_secs(5));
        backend.list_jobs().unwrap();
        let info = backend.describe("legacy").unwrap();
        assert!(info.automatic);
        assert!(info.running);
    }

    #[test]
    fn test_start_runs_script_and_reports_failure() {
        let root = TempDir::new().unwrap();
        let init_dir = root.path().join("init.d");
        let marker = root.path().join("started");
        fs::create_dir_all(&init_dir).unwrap();
        fs::create_dir_all(root.path().join("rc2.d")).unwrap();
        write_script(
            &init_dir,
            "good",
            &format!(
                "#!/bin/sh\ncase \"$1\" in status) exit 3;; start) touch '{}';; esac\n",
                marker.display()
            ),
        );
        write_script(
            &init_dir,
            "bad",
            "#!/bin/sh\ncase \"$1\" in status) exit 3;; start) echo cannot bind >&2; exit 1;; esac\n",
        );
        fs::write(root.path().join("rc2.d/S20good"), "").unwrap();
        fs::write(root.path().join("rc2.d/S20bad"), "").unwrap();

        let config = SysvConfig {
            init_dir,
            rc_dir: root.path().to_path_buf(),
            runlevel: Some("2".to_string()),
            update_rc: "/nonexistent/update-rc.d".to_string(),
            ..SysvConfig::default()
        };
        let mut backend = SysvBackend::new(config, Duration::from_secs(5));
        backend.list_jobs().unwrap();

        backend.start("good").unwrap();
        assert!(marker.exists());

        // already stopped: no-op
        backend.stop("good").unwrap();

        let err = backend.start("bad").unwrap_err();
        match err {
            JobServiceError::BackendExecution { reason, .. } => assert!(reason.contains("cannot bind")),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(matches!(
            backend.set_automatic("good", false),
            Err(JobServiceError::BackendExecution { .. })
        ));
    }
}
