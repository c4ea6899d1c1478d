//! Run configuration and registry credentials.
//!
//! Everything the core needs from the outside world is resolved once, at
//! startup, into an immutable [`RunConfig`]. Core logic never reads the
//! process environment itself.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapPolicy;
use crate::error::ConfigError;
use crate::spec::MatrixSpec;

fn default_job_timeout_secs() -> u64 {
    1_800
}

fn default_env_passthrough() -> Vec<String> {
    vec!["PATH".to_string(), "HOME".to_string(), "LANG".to_string()]
}

fn default_username_env() -> String {
    "DOCKER_USERNAME".to_string()
}

fn default_password_env() -> String {
    "DOCKER_PASSWORD".to_string()
}

/// `[run]` section of the matrix file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    /// Limit for a whole job, 0 disables.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Concurrent jobs per stage, 0 = unbounded.
    #[serde(default)]
    pub max_parallel: usize,

    /// Directory steps run in; defaults to the current directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Variables copied from the runner's environment into every job.
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout_secs(),
            max_parallel: 0,
            workdir: None,
            env_passthrough: default_env_passthrough(),
        }
    }
}

impl RunSettings {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = self.env_passthrough.iter().find(|n| n.trim().is_empty()) {
            return Err(ConfigError::InvalidSetting(format!(
                "run.env_passthrough contains an empty name: {:?}",
                name
            )));
        }
        Ok(())
    }
}

/// `[credentials]`: names of the variables holding the registry secrets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialSettings {
    #[serde(default = "default_username_env")]
    pub username_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            username_env: default_username_env(),
            password_env: default_password_env(),
        }
    }
}

impl CredentialSettings {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.username_env.trim().is_empty() || self.password_env.trim().is_empty() {
            return Err(ConfigError::InvalidSetting(
                "credentials variable names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[registry]`: pre-flight login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistrySettings {
    /// Runs once before any job with `REGISTRY_USERNAME` and
    /// `REGISTRY_PASSWORD` in its environment.
    pub login_command: String,
}

impl RegistrySettings {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.login_command.trim().is_empty() {
            return Err(ConfigError::InvalidSetting(
                "registry.login_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// An opaque secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value; only for handing to a child process.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// Registry username and password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: Secret,
    pub password: Secret,
}

impl RegistryCredentials {
    /// Resolve both secrets through `lookup`. Unset and empty are both
    /// treated as missing.
    pub fn resolve<F>(settings: &CredentialSettings, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .map(Secret::new)
                .ok_or_else(|| ConfigError::MissingSecret(name.to_string()))
        };
        Ok(Self {
            username: fetch(&settings.username_env)?,
            password: fetch(&settings.password_env)?,
        })
    }

    /// Resolve from the process environment.
    pub fn from_env(settings: &CredentialSettings) -> Result<Self, ConfigError> {
        Self::resolve(settings, |name| std::env::var(name).ok())
    }

    /// Variables handed to the registry login command.
    pub fn login_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "REGISTRY_USERNAME".to_string(),
            self.username.expose().to_string(),
        );
        env.insert(
            "REGISTRY_PASSWORD".to_string(),
            self.password.expose().to_string(),
        );
        env
    }
}

/// Command-line overrides applied on top of the matrix file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub workdir: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub job_timeout_secs: Option<u64>,
}

/// Immutable configuration of one run, injected into the stage gate.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub credentials: RegistryCredentials,
    pub registry_login: Option<String>,
    pub bootstrap: Option<BootstrapPolicy>,
    pub workdir: PathBuf,
    /// 0 = no limit.
    pub job_timeout_secs: u64,
    /// 0 = unbounded.
    pub max_parallel: usize,
    /// Variables every job inherits, captured at startup.
    pub base_env: BTreeMap<String, String>,
}

impl RunConfig {
    /// Build from a validated spec and already-resolved inputs.
    pub fn new<F>(
        spec: &MatrixSpec,
        credentials: RegistryCredentials,
        overrides: RunOverrides,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = spec.run_settings();
        let base_env = settings
            .env_passthrough
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
            .collect();

        Self {
            credentials,
            registry_login: spec.registry().map(|r| r.login_command.clone()),
            bootstrap: spec.bootstrap().cloned(),
            workdir: overrides
                .workdir
                .or_else(|| settings.workdir.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            job_timeout_secs: overrides
                .job_timeout_secs
                .unwrap_or(settings.job_timeout_secs),
            max_parallel: overrides.max_parallel.unwrap_or(settings.max_parallel),
            base_env,
        }
    }

    /// Resolve secrets and pass-through variables from the process
    /// environment. Fails before any job if a secret is missing.
    pub fn from_env(spec: &MatrixSpec, overrides: RunOverrides) -> Result<Self, ConfigError> {
        let credentials = RegistryCredentials::from_env(spec.credentials())?;
        Ok(Self::new(spec, credentials, overrides, |name| {
            std::env::var(name).ok()
        }))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");

        let creds = RegistryCredentials {
            username: Secret::new("bot"),
            password: Secret::new("hunter2"),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("bot"));
    }

    #[test]
    fn test_resolve_both_secrets() {
        let vars = env(&[("DOCKER_USERNAME", "bot"), ("DOCKER_PASSWORD", "pw")]);
        let creds =
            RegistryCredentials::resolve(&CredentialSettings::default(), |n| vars.get(n).cloned())
                .expect("both secrets present");
        assert_eq!(creds.username.expose(), "bot");
        assert_eq!(creds.password.expose(), "pw");
    }

    #[test]
    fn test_missing_password_is_configuration_error() {
        let vars = env(&[("DOCKER_USERNAME", "bot")]);
        let err =
            RegistryCredentials::resolve(&CredentialSettings::default(), |n| vars.get(n).cloned())
                .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(name) if name == "DOCKER_PASSWORD"));
    }

    #[test]
    fn test_empty_username_counts_as_missing() {
        let vars = env(&[("DOCKER_USERNAME", ""), ("DOCKER_PASSWORD", "pw")]);
        let err =
            RegistryCredentials::resolve(&CredentialSettings::default(), |n| vars.get(n).cloned())
                .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(name) if name == "DOCKER_USERNAME"));
    }

    #[test]
    fn test_custom_variable_names() {
        let settings = CredentialSettings {
            username_env: "REG_USER".to_string(),
            password_env: "REG_PASS".to_string(),
        };
        let vars = env(&[("REG_USER", "u"), ("REG_PASS", "p")]);
        let creds = RegistryCredentials::resolve(&settings, |n| vars.get(n).cloned()).unwrap();
        let login = creds.login_env();
        assert_eq!(login["REGISTRY_USERNAME"], "u");
        assert_eq!(login["REGISTRY_PASSWORD"], "p");
    }

    #[test]
    fn test_run_config_overrides_and_passthrough() {
        let spec = MatrixSpec::from_toml_str(
            r#"
version = 1
[run]
job_timeout_secs = 600
max_parallel = 2
env_passthrough = ["PATH", "MISSING_VAR"]
[matrix]
interpreter_versions = ["3.8"]
[matrix.unit]
test = "pytest"
"#,
        )
        .unwrap();
        let creds = RegistryCredentials {
            username: Secret::new("u"),
            password: Secret::new("p"),
        };
        let vars = env(&[("PATH", "/usr/bin")]);
        let config = RunConfig::new(
            &spec,
            creds,
            RunOverrides {
                max_parallel: Some(8),
                ..Default::default()
            },
            |n| vars.get(n).cloned(),
        );

        assert_eq!(config.job_timeout_secs, 600);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.workdir, PathBuf::from("."));
        assert_eq!(config.base_env.len(), 1);
        assert_eq!(config.base_env["PATH"], "/usr/bin");
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(600)));
    }
}
