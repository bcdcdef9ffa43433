//! Service configuration
//!
//! Where descriptors live, which backends to load, and how long external
//! commands may run. Stored as JSON; every field has a default so a partial
//! file only needs to name what it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::BackendKind;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobservice/config.json";

/// Placeholder replaced by the job base name in descriptor location templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub sls: SlsLocations,
    pub backends: BackendSelection,
    /// Upper bound for descriptor helper programs, in seconds
    pub helper_timeout_secs: u64,
    /// Upper bound for init system control commands, in seconds
    pub command_timeout_secs: u64,
    pub sysv: SysvConfig,
    pub upstart: UpstartConfig,
}

/// Descriptor location templates, tried in field order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlsLocations {
    /// Local override, e.g. administrator-provided descriptors
    pub local: Option<String>,
    /// Descriptors installed alongside the services themselves
    pub system: Option<String>,
    /// Defaults shipped with jobservice
    pub default: Option<String>,
}

/// Which backends to register, in registration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendSelection {
    /// `"auto"`: probe the running init system
    Auto(AutoTag),
    /// Explicit ordered list
    List(Vec<BackendKind>),
}

/// The literal `"auto"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoTag {
    Auto,
}

/// Settings for the script-based init backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysvConfig {
    pub init_dir: PathBuf,
    /// Directory holding the `rcN.d` link directories
    pub rc_dir: PathBuf,
    /// Fixed active runlevel; queried with `runlevel` when unset
    pub runlevel: Option<String>,
    pub update_rc: String,
    /// Directory searched for `<name>.pid`
    pub pid_dir: PathBuf,
}

/// Settings for the event-based init backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstartConfig {
    pub conf_dir: PathBuf,
    pub initctl: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sls: SlsLocations::default(),
            backends: BackendSelection::Auto(AutoTag::Auto),
            helper_timeout_secs: 10,
            command_timeout_secs: 30,
            sysv: SysvConfig::default(),
            upstart: UpstartConfig::default(),
        }
    }
}

impl Default for SlsLocations {
    fn default() -> Self {
        Self {
            local: Some("/etc/jobservice/sls/{name}.json".to_string()),
            system: Some("/usr/share/jobservice/sls/{name}.json".to_string()),
            default: Some("/usr/share/jobservice/default/{name}.json".to_string()),
        }
    }
}

impl Default for SysvConfig {
    fn default() -> Self {
        Self {
            init_dir: PathBuf::from("/etc/init.d"),
            rc_dir: PathBuf::from("/etc"),
            runlevel: None,
            update_rc: "update-rc.d".to_string(),
            pid_dir: PathBuf::from("/run"),
        }
    }
}

impl Default for UpstartConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/init"),
            initctl: "initctl".to_string(),
        }
    }
}

impl SlsLocations {
    /// Non-empty templates in priority order
    pub fn templates(&self) -> Vec<&str> {
        [&self.local, &self.system, &self.default]
            .into_iter()
            .filter_map(|t| t.as_deref())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl ServiceConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)
            }
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sls.templates().is_empty() {
            anyhow::bail!("At least one descriptor location must be configured");
        }
        for template in self.sls.templates() {
            if !template.contains(NAME_PLACEHOLDER) {
                anyhow::bail!(
                    "Descriptor location '{}' must contain {}",
                    template,
                    NAME_PLACEHOLDER
                );
            }
        }

        if self.helper_timeout_secs == 0 {
            anyhow::bail!("helper_timeout_secs must be greater than zero");
        }
        if self.command_timeout_secs == 0 {
            anyhow::bail!("command_timeout_secs must be greater than zero");
        }

        if let BackendSelection::List(kinds) = &self.backends {
            if kinds.is_empty() {
                anyhow::bail!("Backend list must not be empty");
            }
            let mut seen = HashSet::new();
            for kind in kinds {
                if !seen.insert(kind) {
                    anyhow::bail!("Duplicate backend: {}", kind);
                }
            }
        }

        if self.upstart.initctl.trim().is_empty() {
            anyhow::bail!("upstart.initctl must name a program");
        }
        if self.sysv.update_rc.trim().is_empty() {
            anyhow::bail!("sysv.update_rc must name a program");
        }

        Ok(())
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
