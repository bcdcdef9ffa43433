//! Setting value types
//!
//! A descriptor tags each setting with a [`SettingKind`]. Combined with the
//! setting's named values and constraints, that becomes a [`SettingType`]
//! carrying exactly the payload its validation needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// A rejected value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Type tag as written in descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SettingKind {
    /// Literal "true"/"false"
    Bool,
    Int,
    Float,
    Str,
    /// Display-only text, carries no data
    Label,
    /// One of the declared named values
    Choice,
    File,
    Dir,
    User,
    Group,
    /// Suggests an external program should be used to edit this setting
    Exec,
}

/// A setting's type with its constraint payload
#[derive(Debug, Clone, PartialEq)]
pub enum SettingType {
    Bool,
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Str,
    Label,
    Choice { choices: Vec<String> },
    File { must_exist: bool },
    Dir { must_exist: bool },
    User,
    Group,
    Exec,
}

impl SettingType {
    /// Build the type for `kind` from a setting's named values and constraints.
    ///
    /// Fails when a numeric bound does not parse as the kind's number type.
    pub fn new(
        kind: SettingKind,
        value_names: &[&str],
        constraints: &BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let must_exist = constraints.get("exists").is_some_and(|v| v == "true");
        Ok(match kind {
            SettingKind::Bool => Self::Bool,
            SettingKind::Int => Self::Int {
                min: parse_bound(constraints, "min")?,
                max: parse_bound(constraints, "max")?,
            },
            SettingKind::Float => Self::Float {
                min: parse_bound(constraints, "min")?,
                max: parse_bound(constraints, "max")?,
            },
            SettingKind::Str => Self::Str,
            SettingKind::Label => Self::Label,
            SettingKind::Choice => Self::Choice {
                choices: value_names.iter().map(|s| s.to_string()).collect(),
            },
            SettingKind::File => Self::File { must_exist },
            SettingKind::Dir => Self::Dir { must_exist },
            SettingKind::User => Self::User,
            SettingKind::Group => Self::Group,
            SettingKind::Exec => Self::Exec,
        })
    }

    /// The descriptor tag this type was built from
    pub fn kind(&self) -> SettingKind {
        match self {
            Self::Bool => SettingKind::Bool,
            Self::Int { .. } => SettingKind::Int,
            Self::Float { .. } => SettingKind::Float,
            Self::Str => SettingKind::Str,
            Self::Label => SettingKind::Label,
            Self::Choice { .. } => SettingKind::Choice,
            Self::File { .. } => SettingKind::File,
            Self::Dir { .. } => SettingKind::Dir,
            Self::User => SettingKind::User,
            Self::Group => SettingKind::Group,
            Self::Exec => SettingKind::Exec,
        }
    }

    /// Check a human-facing value against this type
    pub fn validate(&self, value: &str) -> Result<(), ValidationError> {
        match self {
            Self::Bool => {
                if value != "true" && value != "false" {
                    return Err(ValidationError::new("Invalid boolean value."));
                }
            }
            Self::Int { min, max } => {
                let n: i64 = value
                    .trim()
                    .parse()
                    .map_err(|_| ValidationError::new(format!("'{}' is not an integer", value)))?;
                check_range(n, *min, *max)?;
            }
            Self::Float { min, max } => {
                let n: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| ValidationError::new(format!("'{}' is not a number", value)))?;
                if n.is_nan() {
                    return Err(ValidationError::new("NaN is not a valid number"));
                }
                check_range(n, *min, *max)?;
            }
            Self::Choice { choices } => {
                if !choices.iter().any(|c| c == value) {
                    return Err(ValidationError::new("Not a valid choice."));
                }
            }
            Self::File { must_exist } | Self::Dir { must_exist } => {
                if *must_exist && !Path::new(value).exists() {
                    return Err(ValidationError::new(format!("{} does not exist.", value)));
                }
            }
            // No intrinsic constraint; Exec defers to its external tool
            Self::Str | Self::Label | Self::User | Self::Group | Self::Exec => {}
        }
        Ok(())
    }
}

fn parse_bound<T: std::str::FromStr>(
    constraints: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ValidationError> {
    constraints
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ValidationError::new(format!("constraint {}='{}' is not a number", key, raw)))
        })
        .transpose()
}

fn check_range<T>(n: T, min: Option<T>, max: Option<T>) -> Result<(), ValidationError>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if let Some(min) = min {
        if n < min {
            return Err(ValidationError::new(format!("Out of bounds: {} < {}", n, min)));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(ValidationError::new(format!("Out of bounds: {} > {}", n, max)));
        }
    }
    Ok(())
}
