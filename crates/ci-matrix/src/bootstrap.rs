//! Service bootstrapper: starts the backing service for integration jobs.
//!
//! The bootstrap contract is a plain script: exit code 0 means the service is
//! ready, anything else means it is unavailable. Flaky scripts are handled by
//! a configurable retry policy with exponential backoff; the default is a
//! single attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exec::{StepExecutor, StepRequest};
use crate::job::{JobDefinition, StepKind, StepRecord};
use crate::obs;

fn default_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_timeout_secs() -> u64 {
    300
}

/// `[bootstrap]` section of the matrix file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootstrapPolicy {
    /// Script that starts the service.
    pub command: String,

    /// Optional script run after each integration job, whatever its outcome.
    #[serde(default)]
    pub teardown_command: Option<String>,

    /// Total attempts (1 = no retry).
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Base delay between attempts; doubles after each failure.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Limit for a single attempt (0 = none).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BootstrapPolicy {
    /// Single-attempt policy for `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            teardown_command: None,
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.attempts = attempts;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_teardown(mut self, command: impl Into<String>) -> Self {
        self.teardown_command = Some(command.into());
        self
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Failed bootstrap, with the steps that were attempted.
#[derive(Debug, Clone)]
pub struct BootstrapFailure {
    pub reason: String,
    pub exit_code: i32,
    pub steps: Vec<StepRecord>,
}

/// Starts (and optionally stops) the backing service around one job.
#[async_trait]
pub trait ServiceBootstrapper: Send + Sync {
    /// Bring the service up for `job`. Returns the executed steps.
    async fn bootstrap(
        &self,
        job: &JobDefinition,
        base: &StepRequest,
    ) -> Result<Vec<StepRecord>, BootstrapFailure>;

    /// Release the service after `job` finished. Best-effort.
    async fn teardown(&self, _job: &JobDefinition, _base: &StepRequest) -> Option<StepRecord> {
        None
    }
}

/// Bootstrapper that runs the configured scripts through a [`StepExecutor`].
pub struct ScriptBootstrapper<'a> {
    policy: BootstrapPolicy,
    executor: &'a dyn StepExecutor,
}

impl<'a> ScriptBootstrapper<'a> {
    pub fn new(policy: BootstrapPolicy, executor: &'a dyn StepExecutor) -> Self {
        Self { policy, executor }
    }

    pub fn policy(&self) -> &BootstrapPolicy {
        &self.policy
    }
}

#[async_trait]
impl ServiceBootstrapper for ScriptBootstrapper<'_> {
    async fn bootstrap(
        &self,
        job: &JobDefinition,
        base: &StepRequest,
    ) -> Result<Vec<StepRecord>, BootstrapFailure> {
        let max_attempts = self.policy.attempts.max(1);
        let mut steps = Vec::new();
        let mut last_reason = String::new();
        let mut last_code = -1;

        for attempt in 1..=max_attempts {
            obs::emit_bootstrap_attempt(&job.name, attempt, max_attempts);

            let request = base
                .for_step(StepKind::Bootstrap, &self.policy.command)
                .with_timeout_secs(self.policy.timeout_secs);

            match self.executor.execute(&request).await {
                Ok(output) => {
                    let succeeded = output.succeeded();
                    last_code = output.exit_code;
                    steps.push(output.into_record(&request));
                    if succeeded {
                        return Ok(steps);
                    }
                    last_reason = format!("bootstrap script exited with code {}", last_code);
                }
                Err(e) => {
                    last_code = -1;
                    last_reason = e.to_string();
                    steps.push(StepRecord {
                        kind: StepKind::Bootstrap,
                        command: self.policy.command.clone(),
                        exit_code: -1,
                        duration_ms: 0,
                        output_tail: e.to_string(),
                    });
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff(attempt);
                warn!(
                    event = "bootstrap.retry",
                    job = %job.name,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %last_reason,
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(BootstrapFailure {
            reason: format!("{} after {} attempt(s)", last_reason, max_attempts),
            exit_code: last_code,
            steps,
        })
    }

    async fn teardown(&self, job: &JobDefinition, base: &StepRequest) -> Option<StepRecord> {
        let command = self.policy.teardown_command.as_deref()?;
        let request = base
            .for_step(StepKind::Teardown, command)
            .with_timeout_secs(self.policy.timeout_secs);

        match self.executor.execute(&request).await {
            Ok(output) => {
                if !output.succeeded() {
                    warn!(
                        event = "bootstrap.teardown_failed",
                        job = %job.name,
                        exit_code = output.exit_code,
                    );
                }
                Some(output.into_record(&request))
            }
            Err(e) => {
                warn!(event = "bootstrap.teardown_failed", job = %job.name, error = %e);
                None
            }
        }
    }
}
