//! Service-level settings (SLS)
//!
//! [`ServiceSettings`] exposes typed get/set/validate for one job's settings,
//! driven entirely by the job's [`SettingsDescriptor`]. Values are resolved
//! through the descriptor's data sources: a literal, a line in a file read
//! with the [`codec`], or an [`ExternalHelper`] command.

pub mod codec;
pub mod descriptor;
pub mod helper;
pub mod types;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{JobServiceError, Result};
use codec::Pattern;
use descriptor::{DataSource, DescriptorLoader, SettingDescriptor, SettingsDescriptor};
use helper::ExternalHelper;
use types::SettingKind;

/// A setting as presented to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SettingKind,
    pub description: String,
    /// Current value, translated to its display name where one is declared
    pub value: String,
    pub values: Vec<SettingValue>,
    pub constraints: BTreeMap<String, String>,
}

/// One of a setting's named values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingValue {
    pub name: String,
    pub description: String,
}

/// Typed settings for one job
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    job: String,
    descriptor: Arc<SettingsDescriptor>,
    helper: ExternalHelper,
}

impl ServiceSettings {
    pub fn new(job: impl Into<String>, descriptor: Arc<SettingsDescriptor>, helper: ExternalHelper) -> Self {
        Self {
            job: job.into(),
            descriptor,
            helper,
        }
    }

    /// Load the descriptor for `job` and wrap it
    pub fn load(job: &str, loader: &DescriptorLoader, helper: ExternalHelper) -> Result<Self> {
        let descriptor = loader.load(job)?;
        Ok(Self::new(job, Arc::new(descriptor), helper))
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Setting names in declared order
    pub fn setting_names(&self) -> Vec<String> {
        self.descriptor.names()
    }

    pub fn declares(&self, name: &str) -> bool {
        self.descriptor.contains(name)
    }

    fn descriptor_for(&self, name: &str) -> Result<&SettingDescriptor> {
        self.descriptor
            .get(name)
            .ok_or_else(|| JobServiceError::unknown_setting(&self.job, name))
    }

    /// Full record for one setting, with its current value
    pub fn get_setting(&self, name: &str, locale: &str) -> Result<Setting> {
        let setting = self.descriptor_for(name)?;
        let raw = self.read_raw(setting)?;
        Ok(Setting {
            name: setting.name.clone(),
            kind: setting.kind,
            description: setting.localized_description(locale).to_string(),
            value: setting.display_value(&raw),
            values: setting
                .values
                .iter()
                .map(|v| SettingValue {
                    name: v.name.clone(),
                    description: v.localized_description(locale).to_string(),
                })
                .collect(),
            constraints: setting.constraints.clone(),
        })
    }

    /// Every declared setting, in declared order
    pub fn get_settings(&self, locale: &str) -> Result<Vec<Setting>> {
        self.descriptor
            .settings
            .iter()
            .map(|s| self.get_setting(&s.name, locale))
            .collect()
    }

    /// Check `value` against the setting's type without touching anything
    pub fn validate_setting(&self, name: &str, value: &str) -> Result<()> {
        let setting = self.descriptor_for(name)?;
        let setting_type = setting
            .setting_type()
            .map_err(|e| JobServiceError::validation(name, e.reason))?;
        setting_type
            .validate(value)
            .map_err(|e| JobServiceError::validation(name, e.reason))
    }

    /// Fail unless a write of `name` could succeed.
    ///
    /// `SettingNotWritable` when no source accepts writes. For a file target,
    /// `SettingNotFound` when the file or the line to replace is missing.
    pub fn check_writable(&self, name: &str) -> Result<()> {
        let setting = self.descriptor_for(name)?;
        let target = write_target(setting)
            .ok_or_else(|| JobServiceError::SettingNotWritable(name.to_string()))?;
        if let DataSource::File { path, parse, prescan } = target {
            let pattern = parse_pattern(parse, name)?;
            let found = path.exists()
                && codec::read_file_value(path, &pattern, prescan.as_deref())?.is_some();
            if !found {
                return Err(JobServiceError::SettingNotFound {
                    setting: name.to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Write a human-facing value through the setting's data source
    pub fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        let setting = self.descriptor_for(name)?;
        let target = write_target(setting)
            .ok_or_else(|| JobServiceError::SettingNotWritable(name.to_string()))?;
        let raw = setting.raw_value(value);
        debug!(job = %self.job, setting = name, raw = %raw, "ServiceSettings::set_setting");

        match target {
            DataSource::File { path, parse, prescan } => {
                let pattern = parse_pattern(parse, name)?;
                let changed = codec::rewrite_file(path, |r, w| {
                    Ok(codec::write_value(&pattern, prescan.as_deref(), r, w, &raw)?)
                })?;
                if !changed {
                    return Err(JobServiceError::SettingNotFound {
                        setting: name.to_string(),
                        path: path.display().to_string(),
                    });
                }
            }
            DataSource::Exec { set: Some(command), .. } => self.helper.push(command, &raw)?,
            DataSource::Exec { set: None, .. } | DataSource::Fixed { .. } => {
                return Err(JobServiceError::SettingNotWritable(name.to_string()));
            }
        }

        info!(job = %self.job, setting = name, "Setting updated");
        Ok(())
    }

    /// Enable or disable a file-backed setting's line.
    ///
    /// Enabling rewrites the line with its current value, which always yields
    /// an uncommented line. Disabling comments the line out.
    pub fn toggle_setting(&self, name: &str, enabled: bool) -> Result<()> {
        let setting = self.descriptor_for(name)?;
        let Some(DataSource::File { path, parse, prescan }) = write_target(setting) else {
            return Err(JobServiceError::SettingNotWritable(name.to_string()));
        };
        let pattern = parse_pattern(parse, name)?;
        let prescan = prescan.as_deref();

        let changed = if enabled {
            let current = codec::read_file_value(path, &pattern, prescan)?.unwrap_or_default();
            codec::rewrite_file(path, |r, w| {
                Ok(codec::write_value(&pattern, prescan, r, w, &current)?)
            })?
        } else {
            codec::rewrite_file(path, |r, w| Ok(codec::comment_out(&pattern, prescan, r, w)?))?
        };

        if !changed {
            return Err(JobServiceError::SettingNotFound {
                setting: name.to_string(),
                path: path.display().to_string(),
            });
        }
        info!(job = %self.job, setting = name, enabled, "Setting line toggled");
        Ok(())
    }

    /// Resolve the raw value from the first available source.
    ///
    /// A file that does not exist defers to the next source; a file without a
    /// matching line, or no usable source at all, yields an empty value.
    fn read_raw(&self, setting: &SettingDescriptor) -> Result<String> {
        for source in setting.sources() {
            match source {
                DataSource::Fixed { value } => return Ok(value.clone()),
                DataSource::File { path, parse, prescan } => {
                    if !path.exists() {
                        debug!(path = %path.display(), "read_raw: file missing, trying next source");
                        continue;
                    }
                    let pattern = parse_pattern(parse, &setting.name)?;
                    let value = codec::read_file_value(path, &pattern, prescan.as_deref())?;
                    return Ok(value.unwrap_or_default());
                }
                DataSource::Exec { get: Some(command), .. } => return self.helper.fetch(command),
                DataSource::Exec { get: None, .. } => continue,
            }
        }
        Ok(String::new())
    }
}

/// First writable source, preferring files that exist
fn write_target(setting: &SettingDescriptor) -> Option<&DataSource> {
    let writable: Vec<&DataSource> = setting
        .sources()
        .into_iter()
        .take_while(|s| !matches!(s, DataSource::Fixed { .. }))
        .filter(|s| s.is_writable())
        .collect();
    writable
        .iter()
        .find(|s| match s {
            DataSource::File { path, .. } => path.exists(),
            _ => true,
        })
        .or_else(|| writable.first())
        .copied()
}

fn parse_pattern(parse: &str, setting: &str) -> Result<Pattern> {
    Pattern::parse(parse).map_err(|reason| JobServiceError::InvalidDescriptor {
        path: format!("setting {}", setting),
        reason,
    })
}
