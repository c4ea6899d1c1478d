//! Matrix definition: the on-disk TOML format, its expansion into
//! [`JobDefinition`]s and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bootstrap::BootstrapPolicy;
use crate::config::{CredentialSettings, RegistrySettings, RunSettings};
use crate::error::ConfigError;
use crate::job::JobDefinition;
use crate::stage::Stage;

/// Matrix file schema version understood by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Raw matrix file as deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixFile {
    pub version: u32,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub run: RunSettings,

    #[serde(default)]
    pub credentials: CredentialSettings,

    #[serde(default)]
    pub registry: Option<RegistrySettings>,

    #[serde(default)]
    pub bootstrap: Option<BootstrapPolicy>,

    #[serde(default)]
    pub matrix: Option<MatrixTemplate>,

    #[serde(default)]
    pub jobs: Vec<ExplicitJob>,
}

fn default_name() -> String {
    "matrix".to_string()
}

/// `[matrix]`: interpreter versions crossed with per-stage templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixTemplate {
    #[serde(default)]
    pub interpreter_versions: Vec<String>,

    /// Prefix before the version in generated job names (`py` -> `unit/py3.7`).
    #[serde(default)]
    pub label: String,

    /// Environment shared by every generated job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub unit: Option<StageTemplate>,

    #[serde(default)]
    pub integration: Option<StageTemplate>,
}

impl MatrixTemplate {
    fn template(&self, stage: Stage) -> Option<&StageTemplate> {
        match stage {
            Stage::Unit => self.unit.as_ref(),
            Stage::Integration => self.integration.as_ref(),
        }
    }
}

/// Install and test commands for one stage of the matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageTemplate {
    #[serde(default)]
    pub install: Vec<String>,
    pub test: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[[jobs]]`: a job declared outside the version matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplicitJob {
    pub name: String,
    pub stage: Stage,
    pub interpreter_version: String,
    #[serde(default)]
    pub install: Vec<String>,
    pub test: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A validated matrix, ready to run.
///
/// Jobs are fixed at construction; the digest identifies this exact job list.
#[derive(Debug, Clone)]
pub struct MatrixSpec {
    name: String,
    jobs: Vec<JobDefinition>,
    digest: String,
    run: RunSettings,
    credentials: CredentialSettings,
    registry: Option<RegistrySettings>,
    bootstrap: Option<BootstrapPolicy>,
}

impl MatrixSpec {
    /// Read, parse and validate a matrix file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate matrix TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: MatrixFile = toml::from_str(text)?;
        Self::from_file(file)
    }

    /// Expand and validate a parsed matrix file.
    pub fn from_file(file: MatrixFile) -> Result<Self, ConfigError> {
        if file.version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: file.version,
                expected: SCHEMA_VERSION,
            });
        }

        file.run.validate()?;
        file.credentials.validate()?;
        if let Some(registry) = &file.registry {
            registry.validate()?;
        }

        let jobs = expand_jobs(&file)?;
        validate_jobs(&jobs)?;

        let has_integration = jobs.iter().any(|j| j.stage.requires_service());
        match &file.bootstrap {
            Some(policy) if policy.command.trim().is_empty() => {
                return Err(ConfigError::InvalidSetting(
                    "bootstrap.command must not be empty".to_string(),
                ));
            }
            Some(policy) if policy.attempts == 0 => {
                return Err(ConfigError::InvalidSetting(
                    "bootstrap.attempts must be at least 1".to_string(),
                ));
            }
            None if has_integration => return Err(ConfigError::MissingBootstrap),
            _ => {}
        }

        let digest = compute_jobs_digest(&jobs);

        Ok(Self {
            name: file.name,
            jobs,
            digest,
            run: file.run,
            credentials: file.credentials,
            registry: file.registry,
            bootstrap: file.bootstrap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All jobs in declaration order.
    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    /// Jobs of one stage, in declaration order.
    pub fn jobs_for(&self, stage: Stage) -> Vec<JobDefinition> {
        self.jobs
            .iter()
            .filter(|j| j.stage == stage)
            .cloned()
            .collect()
    }

    /// SHA-256 (hex) of the ordered job list.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn run_settings(&self) -> &RunSettings {
        &self.run
    }

    pub fn credentials(&self) -> &CredentialSettings {
        &self.credentials
    }

    pub fn registry(&self) -> Option<&RegistrySettings> {
        self.registry.as_ref()
    }

    pub fn bootstrap(&self) -> Option<&BootstrapPolicy> {
        self.bootstrap.as_ref()
    }
}

fn expand_jobs(file: &MatrixFile) -> Result<Vec<JobDefinition>, ConfigError> {
    let mut jobs = Vec::new();

    if let Some(matrix) = &file.matrix {
        let has_templates = matrix.unit.is_some() || matrix.integration.is_some();
        if has_templates && matrix.interpreter_versions.is_empty() {
            return Err(ConfigError::InvalidJob(
                "[matrix] stage templates need at least one interpreter version".to_string(),
            ));
        }

        for stage in Stage::ORDER {
            let Some(template) = matrix.template(stage) else {
                continue;
            };
            for version in &matrix.interpreter_versions {
                let mut env = matrix.env.clone();
                env.extend(template.env.clone());
                jobs.push(
                    JobDefinition::new(
                        format!("{}/{}{}", stage.name(), matrix.label, version),
                        stage,
                        version.clone(),
                        template.install.clone(),
                        template.test.clone(),
                    )
                    .with_env(env),
                );
            }
        }
    }

    for job in &file.jobs {
        jobs.push(
            JobDefinition::new(
                job.name.clone(),
                job.stage,
                job.interpreter_version.clone(),
                job.install.clone(),
                job.test.clone(),
            )
            .with_env(job.env.clone()),
        );
    }

    Ok(jobs)
}

/// Check a job list for completeness before anything executes.
pub fn validate_jobs(jobs: &[JobDefinition]) -> Result<(), ConfigError> {
    if jobs.is_empty() {
        return Err(ConfigError::EmptyMatrix);
    }

    let mut seen = HashSet::new();
    for job in jobs {
        if job.name.trim().is_empty() {
            return Err(ConfigError::InvalidJob("job name must not be empty".to_string()));
        }
        if job.interpreter_version.trim().is_empty() {
            return Err(ConfigError::InvalidJob(format!(
                "job {} has an empty interpreter version",
                job.name
            )));
        }
        if job.test_command.trim().is_empty() {
            return Err(ConfigError::InvalidJob(format!(
                "job {} has an empty test command",
                job.name
            )));
        }
        if let Some(pos) = job.install_steps.iter().position(|s| s.trim().is_empty()) {
            return Err(ConfigError::InvalidJob(format!(
                "job {} has an empty install step at position {}",
                job.name,
                pos + 1
            )));
        }
        if !seen.insert(job.name.as_str()) {
            return Err(ConfigError::DuplicateJob(job.name.clone()));
        }
    }

    Ok(())
}

/// Compute deterministic digest of the ordered job list.
///
/// Every string is length-prefixed and every list count-prefixed, so no two
/// distinct job lists share an encoding.
fn compute_jobs_digest(jobs: &[JobDefinition]) -> String {
    fn field(hasher: &mut Sha256, bytes: &[u8]) {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Sha256::new();
    hasher.update((jobs.len() as u64).to_le_bytes());
    for job in jobs {
        field(&mut hasher, job.stage.name().as_bytes());
        field(&mut hasher, job.name.as_bytes());
        field(&mut hasher, job.interpreter_version.as_bytes());
        hasher.update((job.install_steps.len() as u64).to_le_bytes());
        for step in &job.install_steps {
            field(&mut hasher, step.as_bytes());
        }
        field(&mut hasher, job.test_command.as_bytes());
        hasher.update((job.env.len() as u64).to_le_bytes());
        for (key, value) in &job.env {
            field(&mut hasher, key.as_bytes());
            field(&mut hasher, value.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX: &str = r#"
version = 1
name = "client-tests"

[bootstrap]
command = "./ci/start_service.sh"

[matrix]
interpreter_versions = ["3.6", "3.7", "3.8", "3.9"]
label = "py"
env = { CI = "true" }

[matrix.unit]
install = ["pip install -r requirements.txt"]
test = "python -m unittest discover test"

[matrix.integration]
install = ["pip install -r requirements.txt"]
test = "python integration/client_functions.py"
env = { SERVICE_URL = "http://localhost:8080" }
"#;

    #[test]
    fn test_matrix_expands_versions_per_stage() {
        let spec = MatrixSpec::from_toml_str(MATRIX).expect("valid matrix");
        assert_eq!(spec.name(), "client-tests");
        assert_eq!(spec.jobs().len(), 8);
        assert_eq!(spec.jobs_for(Stage::Unit).len(), 4);
        assert_eq!(spec.jobs_for(Stage::Integration).len(), 4);

        let first = &spec.jobs()[0];
        assert_eq!(first.name, "unit/py3.6");
        assert_eq!(first.interpreter_version, "3.6");
        assert_eq!(first.env.get("CI").map(String::as_str), Some("true"));

        let integration = &spec.jobs_for(Stage::Integration)[1];
        assert_eq!(integration.name, "integration/py3.7");
        assert!(integration.env.contains_key("SERVICE_URL"));
    }

    #[test]
    fn test_explicit_jobs_are_appended() {
        let text = format!(
            "{}\n[[jobs]]\nname = \"unit/lint\"\nstage = \"unit\"\ninterpreter_version = \"3.9\"\ntest = \"flake8\"\n",
            MATRIX
        );
        let spec = MatrixSpec::from_toml_str(&text).expect("valid matrix");
        assert_eq!(spec.jobs().len(), 9);
        assert_eq!(spec.jobs().last().unwrap().name, "unit/lint");
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let text = MATRIX.replace("version = 1", "version = 2");
        let err = MatrixSpec::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 2, .. }));
    }

    #[test]
    fn test_empty_test_command_rejected() {
        let text = MATRIX.replace("test = \"python -m unittest discover test\"", "test = \"  \"");
        let err = MatrixSpec::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJob(msg) if msg.contains("empty test command")));
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let text = format!(
            "{}\n[[jobs]]\nname = \"unit/py3.6\"\nstage = \"unit\"\ninterpreter_version = \"3.6\"\ntest = \"true\"\n",
            MATRIX
        );
        let err = MatrixSpec::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateJob(name) if name == "unit/py3.6"));
    }

    #[test]
    fn test_integration_without_bootstrap_rejected() {
        let text = MATRIX.replace("[bootstrap]\ncommand = \"./ci/start_service.sh\"\n", "");
        let err = MatrixSpec::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBootstrap));
    }

    #[test]
    fn test_unit_only_matrix_needs_no_bootstrap() {
        let text = r#"
version = 1
[matrix]
interpreter_versions = ["3.8"]
[matrix.unit]
test = "pytest"
"#;
        let spec = MatrixSpec::from_toml_str(text).expect("valid matrix");
        assert_eq!(spec.jobs().len(), 1);
        assert_eq!(spec.jobs()[0].name, "unit/3.8");
        assert!(spec.bootstrap().is_none());
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let err = MatrixSpec::from_toml_str("version = 1").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyMatrix));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = format!("{}\nunknown_key = true\n", "version = 1");
        let err = MatrixSpec::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_digest_deterministic_and_order_sensitive() {
        let a = MatrixSpec::from_toml_str(MATRIX).unwrap();
        let b = MatrixSpec::from_toml_str(MATRIX).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let reordered = MATRIX.replace(
            "[\"3.6\", \"3.7\", \"3.8\", \"3.9\"]",
            "[\"3.7\", \"3.6\", \"3.8\", \"3.9\"]",
        );
        let c = MatrixSpec::from_toml_str(&reordered).unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_digest_separates_install_test_and_env() {
        let mut env = BTreeMap::new();
        env.insert("k".to_string(), "v".to_string());
        let with_env = JobDefinition::new("unit/x", Stage::Unit, "1", vec![], "a").with_env(env);
        let with_install =
            JobDefinition::new("unit/x", Stage::Unit, "1", vec!["a".to_string()], "k=v");

        assert_ne!(
            compute_jobs_digest(&[with_env]),
            compute_jobs_digest(&[with_install])
        );
    }
}
