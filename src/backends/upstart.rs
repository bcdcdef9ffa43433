//! Event-based init backend driven through `initctl`
//!
//! Job state comes from `initctl list`; descriptive fields and start
//! conditions come from the job's `.conf` file. Automatic start is turned off
//! with a `manual` stanza in the job's `.override` file.
//!
//! `env KEY=VALUE` stanzas in a job's conf are exposed as contributed
//! settings named `env.KEY`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{JobInfo, ServiceBackend};
use crate::config::UpstartConfig;
use crate::error::{JobServiceError, Result};
use crate::exec::run_command;
use crate::sls::codec::{self, Pattern};
use crate::sls::types::SettingKind;
use crate::sls::Setting;

const BACKEND_NAME: &str = "Upstart";
const ENV_PREFIX: &str = "env.";
const MANUAL_STANZA: &str = "manual";

/// One line of `initctl list`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListEntry {
    job: String,
    instance: Option<String>,
    goal: String,
    state: String,
    pid: Option<u32>,
}

impl ListEntry {
    fn full_name(&self) -> String {
        match &self.instance {
            Some(inst) => format!("{}/{}", self.job, inst),
            None => self.job.clone(),
        }
    }

    /// Running and not on its way down
    fn running(&self) -> bool {
        self.goal == "start" && self.state == "running"
    }
}

/// Stanzas of interest from a job conf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct JobConf {
    description: String,
    author: String,
    version: String,
    start_on: Option<String>,
    stop_on: Option<String>,
    manual: bool,
    env: Vec<(String, String)>,
}

/// Backend for Upstart jobs
pub struct UpstartBackend {
    config: UpstartConfig,
    timeout: Duration,
    jobs: Vec<String>,
}

impl UpstartBackend {
    pub fn new(config: UpstartConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            jobs: Vec::new(),
        }
    }

    fn conf_path(&self, job: &str) -> PathBuf {
        self.config.conf_dir.join(format!("{}.conf", base_name(job)))
    }

    fn override_path(&self, job: &str) -> PathBuf {
        self.config.conf_dir.join(format!("{}.override", base_name(job)))
    }

    fn initctl(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.config.initctl);
        cmd.args(args);
        let output = run_command(&mut cmd, None, self.timeout).map_err(|e| {
            JobServiceError::backend(BACKEND_NAME, format!("{}: {}", self.config.initctl, e))
        })?;
        output.ensure_success().map_err(|reason| {
            JobServiceError::backend(
                BACKEND_NAME,
                format!("{} {}: {}", self.config.initctl, args.join(" "), reason),
            )
        })?;
        Ok(output.stdout)
    }

    fn query_list(&self) -> Result<Vec<ListEntry>> {
        Ok(parse_list(&self.initctl(&["list"])?))
    }

    fn ensure_known(&self, job: &str) -> Result<()> {
        if self.jobs.iter().any(|j| j == job) {
            Ok(())
        } else {
            Err(JobServiceError::UnknownJob(job.to_string()))
        }
    }

    fn read_conf(&self, job: &str) -> JobConf {
        let path = self.conf_path(job);
        match fs::read(&path) {
            Ok(content) => parse_conf(&String::from_utf8_lossy(&content)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "read_conf: no job conf");
                JobConf::default()
            }
        }
    }

    fn override_is_manual(&self, job: &str) -> bool {
        fs::read_to_string(self.override_path(job))
            .map(|content| content.lines().any(|l| l.trim() == MANUAL_STANZA))
            .unwrap_or(false)
    }

    fn change_state(&mut self, job: &str, start: bool) -> Result<()> {
        self.ensure_known(job)?;
        let running = self
            .query_list()?
            .iter()
            .find(|e| e.full_name() == job)
            .map(ListEntry::running)
            .unwrap_or(false);
        if running == start {
            debug!(job, start, "change_state: already in requested state");
            return Ok(());
        }

        let action = if start { "start" } else { "stop" };
        let instance_arg = job.split_once('/').map(|(_, inst)| format!("INSTANCE={}", inst));
        let mut args = vec![action, base_name(job)];
        if let Some(arg) = &instance_arg {
            args.push(arg);
        }
        self.initctl(&args)?;
        info!(job, action, "Job state changed");
        Ok(())
    }
}

/// Job name without any instance suffix
fn base_name(job: &str) -> &str {
    job.split_once('/').map(|(base, _)| base).unwrap_or(job)
}

/// Parse `initctl list` output.
///
/// Lines look like `ssh start/running, process 812` or
/// `network-interface (eth0) start/running`.
fn parse_list(output: &str) -> Vec<ListEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some((job, rest)) = line.split_once(' ') else {
            continue;
        };
        let mut rest = rest.trim_start();
        let mut instance = None;
        if let Some(inner) = rest.strip_prefix('(') {
            let Some((inst, tail)) = inner.split_once(')') else {
                continue;
            };
            instance = Some(inst.to_string()).filter(|i| !i.is_empty());
            rest = tail.trim_start();
        }

        let (status, process) = match rest.split_once(',') {
            Some((status, process)) => (status.trim(), Some(process.trim())),
            None => (rest.trim(), None),
        };
        let Some((goal, state)) = status.split_once('/') else {
            continue;
        };
        let pid = process
            .and_then(|p| p.strip_prefix("process "))
            .and_then(|p| p.trim().parse().ok());

        entries.push(ListEntry {
            job: job.to_string(),
            instance,
            goal: goal.to_string(),
            state: state.to_string(),
            pid,
        });
    }
    entries
}

/// Stanzas whose value is an event expression that may span lines
const CONDITION_STANZAS: [&str; 2] = ["start on ", "stop on "];

/// Logical stanza lines: comments dropped, parenthesised conditions joined.
///
/// Only `start on` and `stop on` continue across lines; a parenthesis in any
/// other stanza is plain text.
fn stanzas(content: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);
        if CONDITION_STANZAS.iter().any(|c| current.starts_with(c)) {
            depth += line.matches('(').count() as i32 - line.matches(')').count() as i32;
        }
        if depth <= 0 {
            result.push(std::mem::take(&mut current));
            depth = 0;
        }
    }
    if !current.is_empty() {
        result.push(current);
    }
    result
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn parse_conf(content: &str) -> JobConf {
    let mut conf = JobConf::default();
    for stanza in stanzas(content) {
        if stanza == MANUAL_STANZA {
            conf.manual = true;
        } else if let Some(v) = stanza.strip_prefix("description ") {
            conf.description = unquote(v);
        } else if let Some(v) = stanza.strip_prefix("author ") {
            conf.author = unquote(v);
        } else if let Some(v) = stanza.strip_prefix("version ") {
            conf.version = unquote(v);
        } else if let Some(v) = stanza.strip_prefix("start on ") {
            conf.start_on = Some(v.trim().to_string());
        } else if let Some(v) = stanza.strip_prefix("stop on ") {
            conf.stop_on = Some(v.trim().to_string());
        } else if let Some(v) = stanza.strip_prefix("env ") {
            // The first stanza for a key is the one edits go to
            if let Some((key, value)) = v.trim().split_once('=') {
                if !conf.env.iter().any(|(k, _)| k == key) {
                    conf.env.push((key.to_string(), value.to_string()));
                }
            }
        }
    }
    conf
}

impl ServiceBackend for UpstartBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn list_jobs(&mut self) -> Result<Vec<String>> {
        let mut jobs: Vec<String> = self.query_list()?.iter().map(ListEntry::full_name).collect();
        jobs.sort();
        jobs.dedup();
        debug!(count = jobs.len(), "UpstartBackend::list_jobs");
        self.jobs = jobs.clone();
        Ok(jobs)
    }

    fn describe(&self, job: &str) -> Result<JobInfo> {
        self.ensure_known(job)?;
        let entry = self.query_list()?.into_iter().find(|e| e.full_name() == job);
        if entry.is_none() {
            warn!(job, "describe: job no longer listed by initctl");
        }
        let conf = self.read_conf(job);

        let mut info = JobInfo::new(job);
        info.description = conf.description;
        info.author = conf.author;
        info.version = conf.version;
        info.automatic = conf.start_on.is_some() && !conf.manual && !self.override_is_manual(job);
        info.running = entry.as_ref().is_some_and(ListEntry::running);
        info.pid = entry.and_then(|e| e.pid);
        info.starton = conf.start_on.into_iter().collect();
        info.stopon = conf.stop_on.into_iter().collect();
        Ok(info)
    }

    fn start(&mut self, job: &str) -> Result<()> {
        self.change_state(job, true)
    }

    fn stop(&mut self, job: &str) -> Result<()> {
        self.change_state(job, false)
    }

    fn set_automatic(&mut self, job: &str, automatic: bool) -> Result<()> {
        self.ensure_known(job)?;
        let path = self.override_path(job);
        let existing = match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(JobServiceError::config_write(&path, e)),
        };

        let mut lines: Vec<&str> = existing
            .as_deref()
            .unwrap_or_default()
            .lines()
            .filter(|l| l.trim() != MANUAL_STANZA)
            .collect();
        if !automatic {
            lines.push(MANUAL_STANZA);
        }
        if existing.is_none() && lines.is_empty() {
            debug!(job, "set_automatic: no override needed");
            return Ok(());
        }

        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        codec::replace_file(&path, &contents)?;
        info!(job, automatic, "Automatic start changed");
        Ok(())
    }

    fn contributed_settings(&self, job: &str, _locale: &str) -> Result<Vec<Setting>> {
        let conf = self.read_conf(job);
        Ok(conf
            .env
            .into_iter()
            .map(|(key, value)| Setting {
                name: format!("{}{}", ENV_PREFIX, key),
                kind: SettingKind::Str,
                description: format!("Environment variable {}", key),
                value,
                values: Vec::new(),
                constraints: BTreeMap::new(),
            })
            .collect())
    }

    fn set_contributed_settings(&mut self, job: &str, values: &BTreeMap<String, String>) -> Result<()> {
        let path = self.conf_path(job);
        for (name, value) in values {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                return Err(JobServiceError::unknown_setting(job, name));
            };
            let pattern = env_pattern(key, &path)?;
            let changed = codec::rewrite_file(&path, |r, w| {
                Ok(codec::write_value(&pattern, None, r, w, value)?)
            })?;
            if !changed {
                return Err(JobServiceError::SettingNotFound {
                    setting: name.clone(),
                    path: path.display().to_string(),
                });
            }
            info!(job, setting = %name, "Environment setting updated");
        }
        Ok(())
    }

    fn validate_contributed_setting(&self, job: &str, key: &str, value: &str) -> bool {
        let Some(var) = key.strip_prefix(ENV_PREFIX) else {
            return false;
        };
        if value.contains(['\n', '\r']) {
            return false;
        }
        self.read_conf(job).env.iter().any(|(k, _)| k == var)
    }
}

/// Commented-out `env` lines are ignored when parsing, so edits skip them too
fn env_pattern(key: &str, path: &Path) -> Result<Pattern> {
    Pattern::parse(&format!("env {}={}", key, codec::MARKER))
        .map(Pattern::active_only)
        .map_err(|reason| JobServiceError::invalid_descriptor(path, reason))
}
