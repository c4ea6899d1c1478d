//! Stage gate: orders stages and decides whether the next one may start.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::bootstrap::{ScriptBootstrapper, ServiceBootstrapper};
use crate::config::{RegistryCredentials, RunConfig, RunOverrides};
use crate::error::{ConfigError, Result};
use crate::exec::StepExecutor;
use crate::login;
use crate::obs;
use crate::report::{HaltReason, RunReport};
use crate::runner::{MatrixRunner, StageResult};
use crate::spec::MatrixSpec;
use crate::stage::Stage;

/// Gate evaluation verdict for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub stage: Stage,

    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    /// Evaluate whether every job of a stage passed.
    pub fn evaluate(result: &StageResult) -> Self {
        let violations: Vec<String> = result
            .failed_jobs()
            .iter()
            .map(|outcome| match &outcome.failure {
                Some(failure) => format!("Job '{}' failed: {}", outcome.job_name, failure),
                None => format!(
                    "Job '{}' exited with code {}",
                    outcome.job_name, outcome.status.exit_code
                ),
            })
            .collect();

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} jobs passed", result.stage())
        } else {
            format!(
                "{} gate failed with {} violation(s)",
                result.stage(),
                violations.len()
            )
        };

        Self {
            stage: result.stage(),
            passed,
            violations,
            message,
        }
    }
}

/// Runs the stages of a matrix in order, stopping at the first failed stage.
pub struct StageGate<'a> {
    config: &'a RunConfig,
    executor: &'a dyn StepExecutor,
    bootstrapper: Option<&'a dyn ServiceBootstrapper>,
}

impl<'a> StageGate<'a> {
    /// Gate using `executor` for every step and the configured bootstrap
    /// script for integration jobs.
    pub fn new(config: &'a RunConfig, executor: &'a dyn StepExecutor) -> Self {
        Self {
            config,
            executor,
            bootstrapper: None,
        }
    }

    /// Use `bootstrapper` instead of the configured bootstrap script.
    pub fn with_bootstrapper(mut self, bootstrapper: &'a dyn ServiceBootstrapper) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
    }

    /// Execute the whole matrix.
    ///
    /// Order: registry login, then each stage of [`Stage::ORDER`]. A stage
    /// starts only if every job of the previous stage succeeded; otherwise
    /// the run halts and the report names the failed jobs.
    pub async fn run(&self, spec: &MatrixSpec) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = obs::run_span(&run_id.to_string(), spec.name());
        self.run_stages(run_id, spec).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid, spec: &MatrixSpec) -> Result<RunReport> {
        let started_at = Utc::now();

        let configured = self
            .config
            .bootstrap
            .clone()
            .map(|policy| ScriptBootstrapper::new(policy, self.executor));
        let bootstrapper: Option<&dyn ServiceBootstrapper> = match self.bootstrapper {
            Some(b) => Some(b),
            None => configured.as_ref().map(|b| b as &dyn ServiceBootstrapper),
        };

        let needs_service = spec.jobs().iter().any(|j| j.stage.requires_service());
        if needs_service && bootstrapper.is_none() {
            return Err(ConfigError::MissingBootstrap.into());
        }

        obs::emit_run_started(&run_id.to_string(), spec.digest(), spec.jobs().len());

        let login = login::registry_login(self.config, self.executor).await?;

        let runner = MatrixRunner::new(self.executor, self.config);
        let mut stages = Vec::new();
        let mut halted = None;

        for stage in Stage::ORDER {
            let jobs = spec.jobs_for(stage);
            let hook = if stage.requires_service() {
                bootstrapper
            } else {
                None
            };

            let result = runner.run_stage(stage, &jobs, hook).await;
            let verdict = GateVerdict::evaluate(&result);
            stages.push(result);

            if verdict.passed {
                info!(stage = %stage, "{}", verdict.message);
                continue;
            }

            if let Some(next) = stage.next() {
                obs::emit_gate_blocked(stage, next, verdict.violations.len());
                let failed_jobs = stages
                    .last()
                    .map(|r| {
                        r.failed_jobs()
                            .iter()
                            .map(|o| o.job_name.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                halted = Some(HaltReason {
                    stage,
                    blocked: next,
                    failed_jobs,
                });
            }
            break;
        }

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let success = halted.is_none() && stages.iter().all(StageResult::succeeded);
        obs::emit_run_finished(&run_id.to_string(), duration_ms, success);

        Ok(RunReport {
            run_id,
            matrix: spec.name().to_string(),
            matrix_digest: spec.digest().to_string(),
            started_at,
            finished_at,
            duration_ms,
            login,
            stages,
            halted,
            success,
        })
    }
}

/// Resolve credentials through `lookup`, build the run configuration and run
/// the matrix. A missing secret fails here, before any step executes.
pub async fn run_matrix<F>(
    spec: &MatrixSpec,
    overrides: RunOverrides,
    lookup: F,
    executor: &dyn StepExecutor,
) -> Result<RunReport>
where
    F: Fn(&str) -> Option<String>,
{
    let credentials = RegistryCredentials::resolve(spec.credentials(), &lookup)?;
    let config = RunConfig::new(spec, credentials, overrides, &lookup);
    StageGate::new(&config, executor).run(spec).await
}
