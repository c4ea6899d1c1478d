//! Job definitions and per-job outcomes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::JobFailure;
use crate::stage::Stage;

/// One (interpreter version x stage) unit of work.
///
/// Constructed only through [`crate::spec::MatrixSpec::jobs`], which
/// validates the whole set before anything runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDefinition {
    /// Unique job name, e.g. `unit/py3.7`.
    pub name: String,

    /// Interpreter version this job targets.
    pub interpreter_version: String,

    /// Shell commands run in order before the test command.
    pub install_steps: Vec<String>,

    /// Shell command whose exit status decides the job.
    pub test_command: String,

    /// Stage this job belongs to.
    pub stage: Stage,

    /// Extra environment exported to every step of the job.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobDefinition {
    /// Create a job with no extra environment.
    pub fn new(
        name: impl Into<String>,
        stage: Stage,
        interpreter_version: impl Into<String>,
        install_steps: Vec<String>,
        test_command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            interpreter_version: interpreter_version.into(),
            install_steps,
            test_command: test_command.into(),
            stage,
            env: BTreeMap::new(),
        }
    }

    /// Attach extra environment variables.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Final exit status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitStatus {
    pub succeeded: bool,
    /// Exit code of the deciding process, `-1` if none was produced.
    pub exit_code: i32,
}

impl ExitStatus {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            succeeded: false,
            exit_code,
        }
    }
}

/// Which part of a job a step belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum StepKind {
    Login,
    Bootstrap,
    Install(usize),
    Test,
    Teardown,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Login => f.write_str("login"),
            StepKind::Bootstrap => f.write_str("bootstrap"),
            StepKind::Install(i) => write!(f, "install[{}]", i),
            StepKind::Test => f.write_str("test"),
            StepKind::Teardown => f.write_str("teardown"),
        }
    }
}

/// Record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub kind: StepKind,
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Last lines of combined output, kept for failure reports.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

/// Everything known about a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub job_name: String,
    pub interpreter_version: String,
    pub status: ExitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Whether the job passed.
    pub fn passed(&self) -> bool {
        self.status.succeeded
    }

    /// Whether the test command was started.
    pub fn test_invoked(&self) -> bool {
        self.steps.iter().any(|s| s.kind == StepKind::Test)
    }
}
