//! jobservice library
//!
//! Service-level settings for system jobs, plus a proxy that merges several
//! init system backends into one job catalog.

pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod proxy;
pub mod sls;

pub use backends::{BackendKind, JobInfo, ServiceBackend};
pub use config::ServiceConfig;
pub use error::{JobServiceError, Result};
pub use exec::{run_command, CommandOutput, CommandProcessGroup, ExecError};
pub use proxy::{PendingSettings, ServiceProxy};
pub use sls::descriptor::{DescriptorLoader, SettingsDescriptor};
pub use sls::helper::ExternalHelper;
pub use sls::types::{SettingKind, SettingType, ValidationError};
pub use sls::{ServiceSettings, Setting, SettingValue};
