//! Aggregation proxy
//!
//! Merges the job catalogs of every registered backend into one view and
//! routes each job operation to the backend that owns the job. Settings are
//! served from the job's descriptor first and from the owning backend second.
//!
//! Settings updates are transactional in the validate-everything-first sense:
//! [`ServiceProxy::set_settings`] builds a [`PendingSettings`] in which every
//! proposed key has been validated and found writable, and only then applies
//! it. A single rejected key aborts the call with nothing written.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backends::{build_backends, JobInfo, ServiceBackend};
use crate::config::ServiceConfig;
use crate::error::{JobServiceError, Result};
use crate::sls::descriptor::{DescriptorLoader, SettingsDescriptor};
use crate::sls::helper::ExternalHelper;
use crate::sls::{ServiceSettings, Setting};

/// A validated settings update, split by the engine that will apply it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSettings {
    /// Keys declared by the job's descriptor, in proposal order
    pub descriptor: Vec<(String, String)>,
    /// Keys contributed by the owning backend
    pub backend: BTreeMap<String, String>,
}

impl PendingSettings {
    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty() && self.backend.is_empty()
    }

    pub fn len(&self) -> usize {
        self.descriptor.len() + self.backend.len()
    }
}

/// Merged view over all registered backends
pub struct ServiceProxy {
    backends: Vec<Box<dyn ServiceBackend>>,
    loader: DescriptorLoader,
    helper: ExternalHelper,
    /// Job names in catalog order
    jobs: Vec<String>,
    /// Job name -> index of the owning backend
    owners: HashMap<String, usize>,
    /// Settings engines for jobs that have a descriptor
    settings: HashMap<String, ServiceSettings>,
}

impl ServiceProxy {
    /// Backends are given in registration order
    pub fn new(backends: Vec<Box<dyn ServiceBackend>>, loader: DescriptorLoader, helper: ExternalHelper) -> Self {
        Self {
            backends,
            loader,
            helper,
            jobs: Vec::new(),
            owners: HashMap::new(),
            settings: HashMap::new(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            build_backends(config),
            DescriptorLoader::from_locations(&config.sls),
            ExternalHelper::new(config.helper_timeout()),
        )
    }

    /// Names of registered backends, in registration order
    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Catalog from the last [`enumerate`](Self::enumerate)
    pub fn jobs(&self) -> &[String] {
        &self.jobs
    }

    /// Rebuild the job catalog from every backend.
    ///
    /// The first backend to report a name owns it. A backend that fails to
    /// enumerate is skipped with a warning. Descriptors are loaded for every
    /// job; a job without one simply has no descriptor settings.
    pub fn enumerate(&mut self) -> Vec<String> {
        self.jobs.clear();
        self.owners.clear();
        self.settings.clear();

        for (index, backend) in self.backends.iter_mut().enumerate() {
            let names = match backend.list_jobs() {
                Ok(names) => names,
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Backend enumeration failed, skipping");
                    continue;
                }
            };
            for name in names {
                if self.owners.contains_key(&name) {
                    debug!(job = %name, backend = backend.name(), "enumerate: name already owned, dropping");
                    continue;
                }
                self.owners.insert(name.clone(), index);
                self.jobs.push(name);
            }
        }

        let mut descriptors: HashMap<String, Option<Arc<SettingsDescriptor>>> = HashMap::new();
        for job in &self.jobs {
            let base = DescriptorLoader::base_name(job).to_string();
            let descriptor = descriptors
                .entry(base)
                .or_insert_with(|| match self.loader.load(job) {
                    Ok(descriptor) => Some(Arc::new(descriptor)),
                    Err(e) if e.is_descriptor_not_found() => None,
                    Err(e) => {
                        warn!(job = %job, error = %e, "Ignoring unusable settings descriptor");
                        None
                    }
                })
                .clone();
            if let Some(descriptor) = descriptor {
                self.settings.insert(
                    job.clone(),
                    ServiceSettings::new(job.as_str(), descriptor, self.helper.clone()),
                );
            }
        }

        info!(
            jobs = self.jobs.len(),
            with_settings = self.settings.len(),
            "Job catalog rebuilt"
        );
        self.jobs.clone()
    }

    fn owner_index(&self, job: &str) -> Result<usize> {
        self.owners
            .get(job)
            .copied()
            .ok_or_else(|| JobServiceError::UnknownJob(job.to_string()))
    }

    fn owner(&self, job: &str) -> Result<&dyn ServiceBackend> {
        let index = self.owner_index(job)?;
        Ok(self.backends[index].as_ref())
    }

    fn owner_mut(&mut self, job: &str) -> Result<&mut Box<dyn ServiceBackend>> {
        let index = self.owner_index(job)?;
        Ok(&mut self.backends[index])
    }

    /// Owning backend's description, annotated with where settings come from
    pub fn describe(&self, job: &str) -> Result<JobInfo> {
        let backend = self.owner(job)?;
        let mut info = backend.describe(job)?;
        info.backend = backend.name().to_string();
        info.descriptor_settings = self.settings.contains_key(job);
        info.backend_settings = match backend.contributed_settings(job, "") {
            Ok(contributed) => !contributed.is_empty(),
            Err(e) => {
                debug!(job, error = %e, "describe: contributed settings unavailable");
                false
            }
        };
        Ok(info)
    }

    pub fn start(&mut self, job: &str) -> Result<()> {
        self.owner_mut(job)?.start(job)
    }

    pub fn stop(&mut self, job: &str) -> Result<()> {
        self.owner_mut(job)?.stop(job)
    }

    pub fn set_automatic(&mut self, job: &str, automatic: bool) -> Result<()> {
        self.owner_mut(job)?.set_automatic(job, automatic)
    }

    /// Descriptor settings in declared order, then backend settings whose
    /// names the descriptor does not use
    pub fn get_settings(&self, job: &str, locale: &str) -> Result<Vec<Setting>> {
        let backend = self.owner(job)?;
        let mut result = match self.settings.get(job) {
            Some(engine) => engine.get_settings(locale)?,
            None => Vec::new(),
        };
        for setting in backend.contributed_settings(job, locale)? {
            if result.iter().any(|s| s.name == setting.name) {
                debug!(job, setting = %setting.name, "get_settings: descriptor shadows backend setting");
                continue;
            }
            result.push(setting);
        }
        Ok(result)
    }

    /// Check one value without side effects
    pub fn validate_setting(&self, job: &str, key: &str, value: &str) -> Result<()> {
        let backend = self.owner(job)?;
        if let Some(engine) = self.settings.get(job).filter(|e| e.declares(key)) {
            return engine.validate_setting(key, value);
        }
        validate_contributed(backend, job, key, value)
    }

    /// Validate every proposed value and check that it can be written.
    ///
    /// Nothing is written. The first failure is returned as is.
    pub fn prepare_settings(&self, job: &str, proposed: &BTreeMap<String, String>) -> Result<PendingSettings> {
        let backend = self.owner(job)?;
        let engine = self.settings.get(job);
        let mut pending = PendingSettings::default();

        for (key, value) in proposed {
            match engine.filter(|e| e.declares(key)) {
                Some(engine) => {
                    engine.validate_setting(key, value)?;
                    engine.check_writable(key)?;
                    pending.descriptor.push((key.clone(), value.clone()));
                }
                None => {
                    validate_contributed(backend, job, key, value)?;
                    pending.backend.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(pending)
    }

    /// Apply an update built by [`prepare_settings`](Self::prepare_settings).
    ///
    /// Descriptor keys are written first, then backend keys in one call.
    /// Writes already made are not undone if a later one fails.
    pub fn apply_settings(&mut self, job: &str, pending: PendingSettings) -> Result<()> {
        let index = self.owner_index(job)?;
        if let Some(engine) = self.settings.get(job) {
            for (key, value) in &pending.descriptor {
                engine.set_setting(key, value)?;
            }
        } else if let Some((key, _)) = pending.descriptor.first() {
            return Err(JobServiceError::unknown_setting(job, key.as_str()));
        }
        if !pending.backend.is_empty() {
            self.backends[index].set_contributed_settings(job, &pending.backend)?;
        }
        Ok(())
    }

    /// All-or-nothing settings update
    pub fn set_settings(&mut self, job: &str, proposed: &BTreeMap<String, String>) -> Result<()> {
        let pending = self.prepare_settings(job, proposed)?;
        let count = pending.len();
        self.apply_settings(job, pending)?;
        info!(job, count, "Settings applied");
        Ok(())
    }

    /// Comment out or restore the line of a file-backed descriptor setting
    pub fn toggle_setting(&self, job: &str, key: &str, enabled: bool) -> Result<()> {
        self.owner_index(job)?;
        match self.settings.get(job) {
            Some(engine) => engine.toggle_setting(key, enabled),
            None => Err(JobServiceError::unknown_setting(job, key)),
        }
    }
}

/// Route a key the descriptor does not declare to the backend validator
fn validate_contributed(backend: &dyn ServiceBackend, job: &str, key: &str, value: &str) -> Result<()> {
    if backend.validate_contributed_setting(job, key, value) {
        return Ok(());
    }
    let known = backend
        .contributed_settings(job, "")
        .map(|settings| settings.iter().any(|s| s.name == key))
        .unwrap_or(false);
    if known {
        Err(JobServiceError::validation(
            key,
            format!("rejected by {} backend", backend.name()),
        ))
    } else {
        Err(JobServiceError::unknown_setting(job, key))
    }
}
