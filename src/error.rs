//! Error handling for jobservice
//!
//! Every fallible library operation returns [`Result`] with a [`JobServiceError`].
//! The variants follow the kinds of failure a caller has to tell apart: unknown
//! names, rejected values, missing raw values, and failures of the outside world
//! (files, helper programs, init system commands).

use thiserror::Error;

/// Main error type for jobservice
#[derive(Error, Debug)]
pub enum JobServiceError {
    /// No registered backend reports this job
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// None of the descriptor locations exist for this job.
    ///
    /// Callers treat this as "the job declares no settings", not as a failure.
    #[error("No settings descriptor for job: {0}")]
    DescriptorNotFound(String),

    /// A descriptor exists but cannot be used
    #[error("Invalid settings descriptor {path}: {reason}")]
    InvalidDescriptor { path: String, reason: String },

    /// Neither the descriptor nor the owning backend knows this setting
    #[error("Unknown setting '{setting}' for job {job}")]
    UnknownSetting { job: String, setting: String },

    /// A proposed value was rejected
    #[error("Invalid value for setting '{setting}': {reason}")]
    Validation { setting: String, reason: String },

    /// The pattern for a setting matched no line in its target file
    #[error("Setting '{setting}' not found in {path}")]
    SettingNotFound { setting: String, path: String },

    /// The setting has no data source that accepts writes
    #[error("Setting '{0}' is not writable")]
    SettingNotWritable(String),

    /// Atomic rewrite of a configuration file failed; the original is intact
    #[error("Failed to write {path}: {reason}")]
    ConfigWrite { path: String, reason: String },

    /// External helper command failed or timed out
    #[error("Helper command '{command}' failed: {reason}")]
    HelperExecution { command: String, reason: String },

    /// Start/stop/enable failed inside a backend
    #[error("{backend} backend failed: {reason}")]
    BackendExecution { backend: String, reason: String },

    /// IO errors outside the atomic write path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for jobservice operations
pub type Result<T> = std::result::Result<T, JobServiceError>;

// Convenient error constructors
impl JobServiceError {
    /// Create an unknown-setting error
    pub fn unknown_setting(job: impl Into<String>, setting: impl Into<String>) -> Self {
        Self::UnknownSetting {
            job: job.into(),
            setting: setting.into(),
        }
    }

    /// Create a validation error for one setting key
    pub fn validation(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            setting: setting.into(),
            reason: reason.into(),
        }
    }

    /// Create a config write error
    pub fn config_write(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::ConfigWrite {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a helper execution error
    pub fn helper(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HelperExecution {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend execution error
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendExecution {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-descriptor error
    pub fn invalid_descriptor(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::InvalidDescriptor {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error only means "no settings declared"
    pub fn is_descriptor_not_found(&self) -> bool {
        matches!(self, Self::DescriptorNotFound(_))
    }
}
