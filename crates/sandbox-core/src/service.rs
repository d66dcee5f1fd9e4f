//! Application and service descriptions.
//!
//! These records come out of the manifest loader, which lives outside this
//! crate; the CLI reads them from a JSON plan file. Orchestrators only read
//! them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SandboxConfig;
use crate::revspec::{RevisionSpec, RevisionSpecError, LATEST_TAG};

/// Service types the builder knows how to build.
pub const BUILDABLE_TYPES: &[&str] = &["python", "python-worker", "custom"];

/// Errors produced while loading or checking an application.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("can't read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid application plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid application: {0}")]
    Invalid(String),

    #[error(transparent)]
    RevisionSpec(#[from] RevisionSpecError),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// One service of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    /// Overrides the type-based buildable detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildable: Option<bool>,
    /// Declared ports: name to protocol (`tcp`, `udp` or `http`).
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_path: Option<String>,
    /// Pre-rendered archives uploaded along with the application files.
    #[serde(default)]
    pub upload_archives: Vec<PathBuf>,
    #[serde(default, rename = "systempackages", alias = "system_packages")]
    pub system_packages: Vec<String>,
    /// Keys the core doesn't interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            buildable: None,
            ports: BTreeMap::new(),
            environment: BTreeMap::new(),
            extract_path: None,
            upload_archives: Vec::new(),
            system_packages: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn is_buildable(&self) -> bool {
        self.buildable
            .unwrap_or_else(|| BUILDABLE_TYPES.contains(&self.service_type.as_str()))
    }

    /// Workers don't serve HTTP.
    pub fn is_worker(&self) -> bool {
        self.service_type.contains("worker")
    }

    /// Where the service bundle is unpacked inside the container.
    pub fn extract_path(&self, config: &SandboxConfig) -> String {
        match &self.extract_path {
            Some(path) => path.clone(),
            None if self.service_type == "custom" => config.custom_extract_path.clone(),
            None => config.home_dir.clone(),
        }
    }

    /// Path of `file` under the extract path.
    pub fn extracted(&self, config: &SandboxConfig, file: &str) -> String {
        Path::new(&self.extract_path(config))
            .join(file)
            .to_string_lossy()
            .into_owned()
    }

    /// Container ports for the declared ports, in name order, from `start`.
    pub fn custom_ports(&self, start: u16) -> BTreeMap<String, u16> {
        self.ports
            .keys()
            .zip(start..)
            .map(|(name, port)| (name.clone(), port))
            .collect()
    }

    /// Whether an `http` port is declared on a type that already has one.
    pub fn has_redundant_http_port(&self) -> bool {
        let http_ports = self.ports.values().filter(|proto| *proto == "http").count();
        let brings_own_http = !(self.service_type == "custom"
            || (self.service_type.ends_with("worker") && self.service_type.len() > "worker".len()));
        (brings_own_http && http_ports > 0) || (self.is_worker() && http_ports > 1)
    }

    /// Ports published when the service runs.
    pub fn published_ports(&self, config: &SandboxConfig) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .custom_ports(config.custom_ports_start)
            .into_values()
            .collect();
        ports.push(config.admin_port);
        if !self.is_worker() {
            ports.push(config.http_port);
        }
        ports
    }

    /// Image repository holding builds of this service.
    pub fn image_repository(&self, application: &str) -> String {
        format!("{application}-{}", self.name).to_lowercase()
    }

    /// Spec a build started at `timestamp` (unix seconds) commits into.
    pub fn result_spec(&self, application: &str, timestamp: i64) -> Result<RevisionSpec> {
        Ok(RevisionSpec::parse(&format!(
            "{}:ts-{timestamp}",
            self.image_repository(application)
        ))?)
    }

    /// Spec of the latest successful build.
    pub fn latest_spec(&self, application: &str) -> Result<RevisionSpec> {
        Ok(RevisionSpec::parse(&format!(
            "{}:{LATEST_TAG}",
            self.image_repository(application)
        ))?)
    }

    /// Environment seen by the service: application variables, service
    /// variables, identity and `PORT_<NAME>` for each declared port.
    pub fn full_environment(
        &self,
        application: &Application,
        config: &SandboxConfig,
    ) -> BTreeMap<String, String> {
        let mut env = application.environment.clone();
        env.extend(self.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("DOTCLOUD_SERVICE_NAME".to_string(), self.name.clone());
        env.insert("DOTCLOUD_SERVICE_ID".to_string(), "0".to_string());
        for (name, port) in self.custom_ports(config.custom_ports_start) {
            env.insert(format!("PORT_{}", name.to_uppercase()), port.to_string());
        }
        env
    }
}

/// A multi-service application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Files shared by every service bundle.
    #[serde(default)]
    pub upload_files: Vec<PathBuf>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: BTreeMap::new(),
            services: Vec::new(),
            upload_files: Vec::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let application: Application = serde_json::from_str(text)?;
        application.check()?;
        Ok(application)
    }

    /// Read a JSON plan. Relative upload paths are resolved against the
    /// plan's directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ServiceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut application = Self::from_json(&text)?;
        if let Some(base) = path.parent() {
            application.resolve_paths(base);
        }
        Ok(application)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.upload_files.iter_mut().for_each(&resolve);
        for service in &mut self.services {
            service.upload_archives.iter_mut().for_each(&resolve);
        }
    }

    /// Reject unusable plans and warn about questionable ones.
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ServiceError::Invalid("application has no name".into()));
        }
        let mut seen = BTreeSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ServiceError::Invalid(format!(
                    "a {} service has no name",
                    service.service_type
                )));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ServiceError::Invalid(format!(
                    "service {} is defined twice",
                    service.name
                )));
            }
            if service.has_redundant_http_port() {
                warn!(
                    service = %service.name,
                    service_type = %service.service_type,
                    "a http port was already defined for this service"
                );
            }
        }
        Ok(())
    }

    pub fn buildable_services(&self) -> Vec<&ServiceConfig> {
        self.services.iter().filter(|s| s.is_buildable()).collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Fill in the platform variables unless the plan already sets them.
    pub fn with_default_environment(mut self, username: &str) -> Self {
        let defaults = [
            ("DOTCLOUD_PROJECT", self.name.clone()),
            ("DOTCLOUD_ENVIRONMENT", "default".to_string()),
            ("DOTCLOUD_FLAVOR", "microsandbox".to_string()),
            ("DOTCLOUD_USERNAME", username.to_string()),
        ];
        for (key, value) in defaults {
            self.environment.entry(key.to_string()).or_insert(value);
        }
        self
    }

    /// Add or override environment variables.
    pub fn merge_environment<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.environment.extend(vars);
    }
}
