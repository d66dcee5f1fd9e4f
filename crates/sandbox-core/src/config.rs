//! Runtime settings shared by the build and run orchestrators.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine program used when nothing else is configured.
pub const DEFAULT_ENGINE_PROGRAM: &str = "docker";

/// Environment variable overriding [`SandboxConfig::engine_program`].
pub const ENGINE_ENV_VAR: &str = "SANDBOX_ENGINE";

/// Settings for talking to the engine and laying out service containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Engine executable, looked up in `PATH`.
    pub engine_program: String,
    /// Builder program installed in the base image.
    pub builder_path: String,
    /// Bootstrap script name, relative to the service extract path.
    pub bootstrap_script: String,
    /// Supervisor config name, relative to the service extract path.
    pub supervisor_config: String,
    /// User builds and services run as.
    pub service_user: String,
    /// HOME inside service containers; also the default extract path.
    pub home_dir: String,
    /// Extract path for `custom` services.
    pub custom_extract_path: String,
    /// Port every service publishes for administration.
    pub admin_port: u16,
    /// Port every non-worker service publishes for HTTP.
    pub http_port: u16,
    /// First port handed out to services declaring custom ports.
    pub custom_ports_start: u16,
    /// Grace period given to containers when stopping them (seconds).
    pub stop_grace_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine_program: DEFAULT_ENGINE_PROGRAM.to_string(),
            builder_path: "/usr/local/bin/udotcloud.builder".to_string(),
            bootstrap_script: "bootstrap.sh".to_string(),
            supervisor_config: "supervisor.conf".to_string(),
            service_user: "dotcloud".to_string(),
            home_dir: "/home/dotcloud".to_string(),
            custom_extract_path: "/tmp".to_string(),
            admin_port: 2222,
            http_port: 8080,
            custom_ports_start: 42800,
            stop_grace_secs: 10,
        }
    }
}

impl SandboxConfig {
    /// Defaults, with the engine program taken from `SANDBOX_ENGINE` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var(ENGINE_ENV_VAR) {
            if !program.trim().is_empty() {
                config.engine_program = program.trim().to_string();
            }
        }
        config
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.engine_program, "docker");
        assert_eq!(config.admin_port, 2222);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.custom_ports_start, 42800);
        assert_eq!(config.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.home_dir, "/home/dotcloud");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"engine_program": "podman", "stop_grace_secs": 3}"#).unwrap();
        assert_eq!(config.engine_program, "podman");
        assert_eq!(config.stop_grace_secs, 3);
        assert_eq!(config.service_user, "dotcloud");
    }
}
