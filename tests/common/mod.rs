#![allow(dead_code, unused_imports)]
//! Shared fixtures for the integration tests

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use jobservice::backends::{JobInfo, ServiceBackend};
use jobservice::error::{JobServiceError, Result};
use jobservice::sls::types::SettingKind;
use jobservice::{DescriptorLoader, ExternalHelper, ServiceProxy, Setting};

pub use tempfile::TempDir;

/// What a [`MockBackend`] reports and what was done to it
#[derive(Debug, Default)]
pub struct MockState {
    pub jobs: Vec<String>,
    pub fail_listing: bool,
    /// Contributed settings: name -> value
    pub contributed: BTreeMap<String, String>,
    /// Contributed values the validator rejects
    pub rejected_values: Vec<String>,
    pub calls: Vec<String>,
    pub applied: Vec<BTreeMap<String, String>>,
}

/// In-memory backend; state is shared so tests can inspect it after the
/// proxy takes ownership
pub struct MockBackend {
    name: String,
    state: Rc<RefCell<MockState>>,
}

impl MockBackend {
    pub fn new(name: &str, jobs: &[&str]) -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState {
            jobs: jobs.iter().map(|j| j.to_string()).collect(),
            ..MockState::default()
        }));
        (
            Self {
                name: name.to_string(),
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl ServiceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_jobs(&mut self) -> Result<Vec<String>> {
        let state = self.state.borrow();
        if state.fail_listing {
            return Err(JobServiceError::backend(&self.name, "listing failed"));
        }
        Ok(state.jobs.clone())
    }

    fn describe(&self, job: &str) -> Result<JobInfo> {
        let mut info = JobInfo::new(job);
        info.description = format!("{} from {}", job, self.name);
        Ok(info)
    }

    fn start(&mut self, job: &str) -> Result<()> {
        self.state.borrow_mut().calls.push(format!("start {}", job));
        Ok(())
    }

    fn stop(&mut self, job: &str) -> Result<()> {
        self.state.borrow_mut().calls.push(format!("stop {}", job));
        Ok(())
    }

    fn set_automatic(&mut self, job: &str, automatic: bool) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(format!("automatic {} {}", job, automatic));
        Ok(())
    }

    fn contributed_settings(&self, _job: &str, _locale: &str) -> Result<Vec<Setting>> {
        Ok(self
            .state
            .borrow()
            .contributed
            .iter()
            .map(|(name, value)| Setting {
                name: name.clone(),
                kind: SettingKind::Str,
                description: format!("{} backend setting", self.name),
                value: value.clone(),
                values: Vec::new(),
                constraints: BTreeMap::new(),
            })
            .collect())
    }

    fn set_contributed_settings(&mut self, _job: &str, values: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for (k, v) in values {
            state.contributed.insert(k.clone(), v.clone());
        }
        state.applied.push(values.clone());
        Ok(())
    }

    fn validate_contributed_setting(&self, _job: &str, key: &str, value: &str) -> bool {
        let state = self.state.borrow();
        state.contributed.contains_key(key) && !state.rejected_values.iter().any(|r| r == value)
    }
}

/// Directory holding `<name>.json` descriptors
pub struct DescriptorDir {
    pub dir: TempDir,
}

impl DescriptorDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn add(&self, job: &str, json: &str) {
        fs::write(self.dir.path().join(format!("{}.json", job)), json).unwrap();
    }

    pub fn loader(&self) -> DescriptorLoader {
        DescriptorLoader::new(vec![format!("{}/{{name}}.json", self.dir.path().display())])
    }
}

/// Proxy over the given backends, enumerated
pub fn proxy_with(descriptors: &DescriptorDir, backends: Vec<Box<dyn ServiceBackend>>) -> ServiceProxy {
    let mut proxy = ServiceProxy::new(backends, descriptors.loader(), ExternalHelper::default());
    proxy.enumerate();
    proxy
}

/// Bool setting stored as `AUTO=yes|no` in `file`
pub fn auto_update_descriptor(file: &Path) -> String {
    format!(
        r#"{{"settings": [{{
            "name": "auto_update",
            "type": "bool",
            "description": "Install updates automatically",
            "data": [{{"source": "file", "path": "{}", "parse": "AUTO=%s"}}],
            "values": [
                {{"name": "true", "description": "Enabled", "raw": "yes"}},
                {{"name": "false", "description": "Disabled", "raw": "no"}}
            ]
        }}]}}"#,
        file.display()
    )
}

/// Int setting `name` stored as `<line>%s` in `file`, bounded to [1, 100]
pub fn int_setting(name: &str, file: &Path, line: &str) -> String {
    format!(
        r#"{{
            "name": "{}",
            "type": "int",
            "data": [{{"source": "file", "path": "{}", "parse": "{}%s"}}],
            "constraints": {{"min": "1", "max": "100"}}
        }}"#,
        name,
        file.display(),
        line
    )
}
