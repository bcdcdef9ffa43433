//! Settings descriptors
//!
//! A descriptor is a JSON document, one per job base name, declaring the
//! job's settings in display order:
//!
//! ```json
//! {
//!   "settings": [
//!     {
//!       "name": "auto_update",
//!       "type": "bool",
//!       "description": "Install updates automatically",
//!       "data": [{ "source": "file", "path": "/etc/foo.conf", "parse": "AUTO=%s" }],
//!       "values": [
//!         { "name": "true", "raw": "yes" },
//!         { "name": "false", "raw": "no" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Descriptors are only read. The files they point at are what gets edited.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{SlsLocations, NAME_PLACEHOLDER};
use crate::error::{JobServiceError, Result};
use crate::sls::codec::Pattern;
use crate::sls::types::{SettingKind, SettingType, ValidationError};

/// All settings declared for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDescriptor {
    pub settings: Vec<SettingDescriptor>,
}

/// One declared setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDescriptor {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: SettingKind,

    #[serde(default)]
    pub description: String,

    /// Translations of `description`, keyed by locale or language
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,

    /// Where the value lives, as a priority list
    #[serde(default)]
    pub data: Vec<DataSource>,

    /// Named values, in display order
    #[serde(default)]
    pub values: Vec<NamedValue>,

    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
}

/// Where a setting's raw value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum DataSource {
    /// A literal; never writable
    Fixed { value: String },
    /// A line in a text file
    File {
        path: PathBuf,
        parse: String,
        /// Matching starts after a line containing this marker
        #[serde(default)]
        prescan: Option<String>,
    },
    /// Helper commands printing / accepting the value
    Exec {
        #[serde(default)]
        get: Option<String>,
        #[serde(default)]
        set: Option<String>,
    },
}

impl DataSource {
    fn precedence(&self) -> u8 {
        match self {
            Self::Fixed { .. } => 0,
            Self::File { .. } | Self::Exec { .. } => 1,
        }
    }

    /// Whether this source could accept a write
    pub fn is_writable(&self) -> bool {
        match self {
            Self::Fixed { .. } => false,
            Self::File { .. } => true,
            Self::Exec { set, .. } => set.is_some(),
        }
    }
}

/// A human-facing name for a raw on-disk token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,

    /// On-disk token; defaults to `name`
    #[serde(default)]
    pub raw: Option<String>,
}

impl NamedValue {
    pub fn raw(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.name)
    }

    pub fn localized_description(&self, locale: &str) -> &str {
        localize(&self.descriptions, &self.description, locale)
    }
}

impl SettingDescriptor {
    pub fn localized_description(&self, locale: &str) -> &str {
        localize(&self.descriptions, &self.description, locale)
    }

    /// The validating type for this setting
    pub fn setting_type(&self) -> std::result::Result<SettingType, ValidationError> {
        let names: Vec<&str> = self.values.iter().map(|v| v.name.as_str()).collect();
        SettingType::new(self.kind, &names, &self.constraints)
    }

    /// Data sources in the order they are tried: literals first, then the
    /// remaining sources as declared.
    pub fn sources(&self) -> Vec<&DataSource> {
        let mut sources: Vec<&DataSource> = self.data.iter().collect();
        sources.sort_by_key(|s| s.precedence());
        sources
    }

    /// Translate a raw token to its display name, if one is declared
    pub fn display_value(&self, raw: &str) -> String {
        self.values
            .iter()
            .find(|v| v.raw() == raw)
            .map(|v| v.name.clone())
            .unwrap_or_else(|| raw.to_string())
    }

    /// Translate a display name to its raw token, if one is declared
    pub fn raw_value(&self, value: &str) -> String {
        self.values
            .iter()
            .find(|v| v.name == value)
            .map(|v| v.raw().to_string())
            .unwrap_or_else(|| value.to_string())
    }
}

/// Pick `locale`, then its language, then the untranslated text
fn localize<'a>(translations: &'a BTreeMap<String, String>, default: &'a str, locale: &str) -> &'a str {
    if locale.is_empty() {
        return default;
    }
    let without_encoding = locale.split('.').next().unwrap_or(locale);
    let language = without_encoding.split('_').next().unwrap_or(without_encoding);
    [locale, without_encoding, language]
        .into_iter()
        .find_map(|key| translations.get(key))
        .map(String::as_str)
        .unwrap_or(default)
}

impl SettingsDescriptor {
    /// Load and check a descriptor file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Parse and check a descriptor from JSON; `origin` names it in errors
    pub fn parse(json: &str, origin: &Path) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(json)
            .map_err(|e| JobServiceError::invalid_descriptor(origin, e))?;
        descriptor
            .validate_structure()
            .map_err(|reason| JobServiceError::invalid_descriptor(origin, reason))?;
        Ok(descriptor)
    }

    fn validate_structure(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for setting in &self.settings {
            if !seen.insert(setting.name.as_str()) {
                return Err(format!("Duplicate setting: {}", setting.name));
            }
            setting
                .setting_type()
                .map_err(|e| format!("setting '{}': {}", setting.name, e))?;
            for source in &setting.data {
                if let DataSource::File { parse, .. } = source {
                    Pattern::parse(parse)
                        .map_err(|e| format!("setting '{}': {}", setting.name, e))?;
                }
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.settings.iter().map(|s| s.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&SettingDescriptor> {
        self.settings.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Finds the descriptor for a job among the configured locations
#[derive(Debug, Clone)]
pub struct DescriptorLoader {
    templates: Vec<String>,
}

impl DescriptorLoader {
    /// `templates` contain `{name}` and are tried in order
    pub fn new(templates: Vec<String>) -> Self {
        Self { templates }
    }

    pub fn from_locations(locations: &SlsLocations) -> Self {
        Self::new(locations.templates().into_iter().map(String::from).collect())
    }

    /// Descriptor name for a job: instances share their parent job's descriptor
    pub fn base_name(job: &str) -> &str {
        job.split('/').next().unwrap_or(job)
    }

    /// First existing descriptor path for `job`
    pub fn locate(&self, job: &str) -> Option<PathBuf> {
        let base = Self::base_name(job);
        self.templates
            .iter()
            .map(|t| PathBuf::from(t.replace(NAME_PLACEHOLDER, base)))
            .find(|p| p.exists())
    }

    /// Load the descriptor for `job`.
    ///
    /// `DescriptorNotFound` means the job declares no settings.
    pub fn load(&self, job: &str) -> Result<SettingsDescriptor> {
        let path = self
            .locate(job)
            .ok_or_else(|| JobServiceError::DescriptorNotFound(job.to_string()))?;
        debug!(job, path = %path.display(), "DescriptorLoader::load: using descriptor");
        SettingsDescriptor::from_file(&path)
    }
}
