//! Init system backends
//!
//! A backend integrates one service-management technology. Every backend
//! implements [`ServiceBackend`]; which ones run is decided by configuration
//! through [`build_backends`], never by loading code at run time.

pub mod sysv;
pub mod upstart;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, info};

use crate::config::{BackendSelection, ServiceConfig};
use crate::error::Result;
use crate::exec::run_command;
use crate::sls::Setting;

pub use sysv::SysvBackend;
pub use upstart::UpstartBackend;

/// Backend implementations known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Script-based init (`/etc/init.d` + `rcN.d` links)
    Sysv,
    /// Event-based init daemon driven through `initctl`
    Upstart,
}

/// Descriptive and status information for one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub running: bool,
    pub automatic: bool,
    pub pid: Option<u32>,
    /// Conditions (runlevels, events) that start the job
    pub starton: Vec<String>,
    /// Conditions that stop the job
    pub stopon: Vec<String>,
    /// Name of the owning backend, filled in by the proxy
    #[serde(default)]
    pub backend: String,
    /// A settings descriptor exists for this job
    #[serde(default)]
    pub descriptor_settings: bool,
    /// The owning backend contributes settings for this job
    #[serde(default)]
    pub backend_settings: bool,
}

impl JobInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Capability set of an init system integration.
///
/// Start and stop are idempotent: starting a running job or stopping a stopped
/// one succeeds without doing anything. A failing underlying action is a
/// `BackendExecution` error.
pub trait ServiceBackend {
    /// Display name, e.g. "System V"
    fn name(&self) -> &str;

    /// Names of all jobs this backend manages; refreshes internal caches
    fn list_jobs(&mut self) -> Result<Vec<String>>;

    /// Description and live status of a job
    fn describe(&self, job: &str) -> Result<JobInfo>;

    fn start(&mut self, job: &str) -> Result<()>;

    fn stop(&mut self, job: &str) -> Result<()>;

    /// Flip whether the job starts automatically. Does not start or stop it.
    fn set_automatic(&mut self, job: &str, automatic: bool) -> Result<()>;

    /// Settings the backend itself exposes, independent of any descriptor
    fn contributed_settings(&self, _job: &str, _locale: &str) -> Result<Vec<Setting>> {
        Ok(Vec::new())
    }

    /// Apply contributed settings. Only called with keys that validated.
    fn set_contributed_settings(&mut self, _job: &str, _values: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// Whether `value` is acceptable for contributed setting `key`
    fn validate_contributed_setting(&self, _job: &str, _key: &str, _value: &str) -> bool {
        false
    }
}

/// Construct backends in registration order from configuration.
///
/// Registration order decides which backend owns a job name reported by more
/// than one backend.
pub fn build_backends(config: &ServiceConfig) -> Vec<Box<dyn ServiceBackend>> {
    let kinds = match &config.backends {
        BackendSelection::List(kinds) => kinds.clone(),
        BackendSelection::Auto(_) => detect_backends(&config.upstart.initctl, config.command_timeout()),
    };
    info!(backends = ?kinds, "Registering backends");
    kinds.into_iter().map(|kind| create_backend(kind, config)).collect()
}

/// Build one backend
pub fn create_backend(kind: BackendKind, config: &ServiceConfig) -> Box<dyn ServiceBackend> {
    match kind {
        BackendKind::Sysv => Box::new(SysvBackend::new(config.sysv.clone(), config.command_timeout())),
        BackendKind::Upstart => Box::new(UpstartBackend::new(
            config.upstart.clone(),
            config.command_timeout(),
        )),
    }
}

/// Probe the running init system. Upstart, when present, is registered ahead
/// of the script-based backend, which is always available.
pub fn detect_backends(initctl: &str, timeout: Duration) -> Vec<BackendKind> {
    let mut kinds = Vec::new();
    let probes: [(&str, &[&str]); 2] = [(initctl, &["version"]), ("init", &["--version"])];
    for (program, args) in probes {
        let mut cmd = Command::new(program);
        cmd.args(args);
        match run_command(&mut cmd, None, timeout) {
            Ok(output) if output.stdout.contains("upstart") => {
                debug!(program, "detect_backends: upstart detected");
                kinds.push(BackendKind::Upstart);
                break;
            }
            Ok(_) => {}
            Err(e) => debug!(program, error = %e, "detect_backends: probe failed"),
        }
    }
    kinds.push(BackendKind::Sysv);
    kinds
}
