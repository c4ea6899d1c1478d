//! Error taxonomy for matrix runs.
//!
//! Run-level problems (bad configuration, missing secrets, a failed registry
//! login) are errors and abort the run before any job starts. Job-level
//! problems are not errors: they are recorded as [`JobFailure`] values in the
//! stage results so sibling jobs keep running.

use serde::{Deserialize, Serialize};

/// Problems detected while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unsupported matrix schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("matrix defines no jobs")]
    EmptyMatrix,

    #[error("integration jobs are declared but no [bootstrap] command is configured")]
    MissingBootstrap,

    #[error("missing secret: environment variable {0} is unset or empty")]
    MissingSecret(String),

    #[error("invalid run setting: {0}")]
    InvalidSetting(String),
}

/// Failure to run a single process step.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("step command is empty")]
    EmptyCommand,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step timed out after {0}s")]
    Timeout(u64),

    #[error("failed to prepare job environment: {0}")]
    Environment(#[source] std::io::Error),
}

/// Errors that abort a whole matrix run.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("registry login failed: {0}")]
    RegistryLogin(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MatrixError {
    /// Process exit code for a run aborted by this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MatrixError::Configuration(_) => 2,
            MatrixError::RegistryLogin(_) => 3,
            MatrixError::Serialization(_) | MatrixError::Io(_) => 1,
        }
    }
}

/// Result type for matrix operations.
pub type Result<T> = std::result::Result<T, MatrixError>;

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// An install step exited non-zero; the test command was skipped.
    InstallFailure { step: usize, exit_code: i32 },

    /// The backing service did not come up; nothing else ran.
    ServiceBootstrapFailure { reason: String, exit_code: i32 },

    /// The test command exited non-zero.
    TestFailure { exit_code: i32 },

    /// The job exceeded its time budget.
    Timeout { limit_secs: u64 },

    /// A step could not be started at all.
    Spawn { reason: String },
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::InstallFailure { step, exit_code } => {
                write!(f, "install step {} exited with code {}", step + 1, exit_code)
            }
            JobFailure::ServiceBootstrapFailure { reason, .. } => {
                write!(f, "service bootstrap failed: {}", reason)
            }
            JobFailure::TestFailure { exit_code } => {
                write!(f, "test command exited with code {}", exit_code)
            }
            JobFailure::Timeout { limit_secs } => {
                write!(f, "job timed out after {}s", limit_secs)
            }
            JobFailure::Spawn { reason } => write!(f, "step could not start: {}", reason),
        }
    }
}

impl JobFailure {
    /// Exit code reported in the job's [`crate::job::ExitStatus`].
    pub fn exit_code(&self) -> i32 {
        match self {
            JobFailure::InstallFailure { exit_code, .. }
            | JobFailure::ServiceBootstrapFailure { exit_code, .. }
            | JobFailure::TestFailure { exit_code } => *exit_code,
            JobFailure::Timeout { .. } | JobFailure::Spawn { .. } => -1,
        }
    }
}
