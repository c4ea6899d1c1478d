//! Matrix runner: executes the jobs of one stage.
//!
//! Jobs of a stage run concurrently (bounded by `max_parallel`) and share
//! nothing: each gets its own scratch directory and a freshly built
//! environment. Inside a job, steps are strictly sequential and the first
//! failing step ends the job.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::ServiceBootstrapper;
use crate::config::RunConfig;
use crate::error::{ExecError, JobFailure};
use crate::exec::{StepExecutor, StepRequest};
use crate::job::{ExitStatus, JobDefinition, JobOutcome, StepKind, StepRecord};
use crate::obs;
use crate::stage::Stage;

/// Result of running every job of one stage.
///
/// Built once by [`MatrixRunner::run_stage`]; read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    stage: Stage,
    job_results: BTreeMap<String, JobOutcome>,
    duration_ms: u64,
}

impl StageResult {
    fn new(stage: Stage, outcomes: Vec<JobOutcome>, duration_ms: u64) -> Self {
        Self {
            stage,
            job_results: outcomes
                .into_iter()
                .map(|o| (o.job_name.clone(), o))
                .collect(),
            duration_ms,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Per-job outcomes keyed by job name.
    pub fn job_results(&self) -> &BTreeMap<String, JobOutcome> {
        &self.job_results
    }

    /// Exit status of a single job.
    pub fn exit_status(&self, job_name: &str) -> Option<ExitStatus> {
        self.job_results.get(job_name).map(|o| o.status)
    }

    /// Job name to exit status, for every job of the stage.
    pub fn statuses(&self) -> BTreeMap<&str, ExitStatus> {
        self.job_results
            .iter()
            .map(|(name, o)| (name.as_str(), o.status))
            .collect()
    }

    /// Whether every job succeeded. An empty stage succeeds.
    pub fn succeeded(&self) -> bool {
        self.job_results.values().all(JobOutcome::passed)
    }

    pub fn passed_count(&self) -> usize {
        self.job_results.values().filter(|o| o.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.job_results.values().filter(|o| !o.passed()).count()
    }

    /// Failed jobs in name order.
    pub fn failed_jobs(&self) -> Vec<&JobOutcome> {
        self.job_results.values().filter(|o| !o.passed()).collect()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

/// Runs the jobs of a stage through a [`StepExecutor`].
pub struct MatrixRunner<'a> {
    executor: &'a dyn StepExecutor,
    config: &'a RunConfig,
}

impl<'a> MatrixRunner<'a> {
    pub fn new(executor: &'a dyn StepExecutor, config: &'a RunConfig) -> Self {
        Self { executor, config }
    }

    /// Run all `jobs` of `stage` and wait for every one of them.
    ///
    /// When `bootstrapper` is given, each job first brings its service up and
    /// tears it down afterwards. Job names must be unique, as
    /// [`crate::spec::validate_jobs`] guarantees; results are keyed by name.
    pub async fn run_stage(
        &self,
        stage: Stage,
        jobs: &[JobDefinition],
        bootstrapper: Option<&dyn ServiceBootstrapper>,
    ) -> StageResult {
        debug_assert!(
            jobs.iter().map(|j| j.name.as_str()).collect::<HashSet<_>>().len() == jobs.len(),
            "duplicate job name in stage {}",
            stage
        );
        let start = Instant::now();
        obs::emit_stage_started(stage, jobs.len());

        let limit = match self.config.max_parallel {
            0 => jobs.len().max(1),
            n => n,
        };

        let outcomes: Vec<JobOutcome> = stream::iter(jobs)
            .map(|job| self.run_job(job, bootstrapper))
            .buffer_unordered(limit)
            .collect()
            .await;

        let result = StageResult::new(stage, outcomes, start.elapsed().as_millis() as u64);
        obs::emit_stage_finished(
            stage,
            result.passed_count(),
            result.failed_count(),
            result.duration_ms(),
        );
        result
    }

    /// Run a single job to completion, timeout included.
    pub async fn run_job(
        &self,
        job: &JobDefinition,
        bootstrapper: Option<&dyn ServiceBootstrapper>,
    ) -> JobOutcome {
        let start = Instant::now();
        let mut steps = Vec::new();

        let scratch = match tempfile::Builder::new().prefix("ci-matrix-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let failure = JobFailure::Spawn {
                    reason: ExecError::Environment(e).to_string(),
                };
                return finish(job, start, steps, Err(failure));
            }
        };

        let base = StepRequest::new(
            &job.name,
            self.config.workdir.clone(),
            self.job_env(job, scratch.path()),
        );

        let result = match self.config.job_timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, self.drive(job, &base, bootstrapper, &mut steps))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(JobFailure::Timeout {
                        limit_secs: self.config.job_timeout_secs,
                    }),
                }
            }
            None => self.drive(job, &base, bootstrapper, &mut steps).await,
        };

        if let Some(bootstrapper) = bootstrapper {
            if let Some(record) = bootstrapper.teardown(job, &base).await {
                steps.push(record);
            }
        }

        finish(job, start, steps, result)
    }

    async fn drive(
        &self,
        job: &JobDefinition,
        base: &StepRequest,
        bootstrapper: Option<&dyn ServiceBootstrapper>,
        steps: &mut Vec<StepRecord>,
    ) -> Result<(), JobFailure> {
        if let Some(bootstrapper) = bootstrapper {
            match bootstrapper.bootstrap(job, base).await {
                Ok(records) => steps.extend(records),
                Err(failure) => {
                    steps.extend(failure.steps);
                    return Err(JobFailure::ServiceBootstrapFailure {
                        reason: failure.reason,
                        exit_code: failure.exit_code,
                    });
                }
            }
        }

        for (index, command) in job.install_steps.iter().enumerate() {
            let exit_code = self
                .run_step(base.for_step(StepKind::Install(index), command), steps)
                .await?;
            if exit_code != 0 {
                return Err(JobFailure::InstallFailure {
                    step: index,
                    exit_code,
                });
            }
        }

        let exit_code = self
            .run_step(base.for_step(StepKind::Test, &job.test_command), steps)
            .await?;
        if exit_code != 0 {
            return Err(JobFailure::TestFailure { exit_code });
        }
        Ok(())
    }

    async fn run_step(
        &self,
        request: StepRequest,
        steps: &mut Vec<StepRecord>,
    ) -> Result<i32, JobFailure> {
        debug!(job = %request.job_name, step = %request.kind, "Running step");
        match self.executor.execute(&request).await {
            Ok(output) => {
                let exit_code = output.exit_code;
                steps.push(output.into_record(&request));
                Ok(exit_code)
            }
            Err(e) => {
                steps.push(StepRecord {
                    kind: request.kind,
                    command: request.command.clone(),
                    exit_code: -1,
                    duration_ms: 0,
                    output_tail: e.to_string(),
                });
                Err(match e {
                    ExecError::Timeout(limit_secs) => JobFailure::Timeout { limit_secs },
                    other => JobFailure::Spawn {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Environment of every step of `job`. Nothing else is inherited.
    fn job_env(&self, job: &JobDefinition, scratch: &Path) -> BTreeMap<String, String> {
        let mut env = self.config.base_env.clone();
        env.extend(job.env.clone());
        let scratch = scratch.display().to_string();
        env.insert("MATRIX_JOB_NAME".to_string(), job.name.clone());
        env.insert("MATRIX_STAGE".to_string(), job.stage.name().to_string());
        env.insert(
            "MATRIX_INTERPRETER_VERSION".to_string(),
            job.interpreter_version.clone(),
        );
        env.insert("MATRIX_SCRATCH_DIR".to_string(), scratch.clone());
        env.insert("TMPDIR".to_string(), scratch);
        env
    }
}

fn finish(
    job: &JobDefinition,
    start: Instant,
    steps: Vec<StepRecord>,
    result: Result<(), JobFailure>,
) -> JobOutcome {
    let duration_ms = start.elapsed().as_millis() as u64;
    let (status, failure) = match result {
        Ok(()) => (ExitStatus::success(), None),
        Err(failure) => (ExitStatus::failed(failure.exit_code()), Some(failure)),
    };
    obs::emit_job_finished(&job.name, status.succeeded, status.exit_code, duration_ms);

    JobOutcome {
        job_name: job.name.clone(),
        interpreter_version: job.interpreter_version.clone(),
        status,
        failure,
        steps,
        duration_ms,
    }
}
