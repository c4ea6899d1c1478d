//! In-memory test doubles for the executor and bootstrapper seams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::bootstrap::{BootstrapFailure, ServiceBootstrapper};
use crate::config::{RegistryCredentials, RunConfig, Secret};
use crate::error::ExecError;
use crate::exec::{StepExecutor, StepOutput, StepRequest};
use crate::job::{JobDefinition, StepKind, StepRecord};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Exit with `code` for the next `remaining` calls (None = forever).
    Exit { code: i32, remaining: Option<u32> },
    /// Exit 0 after `Duration` of tokio time.
    Sleep(Duration),
    /// Never finish.
    Hang,
}

/// Executor that records every request and answers from a script.
///
/// Unscripted commands exit 0. Rules can target a command everywhere or only
/// within one job.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<HashMap<(Option<String>, String), Behavior>>,
    calls: Mutex<Vec<StepRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_rule(self, job: Option<&str>, command: &str, behavior: Behavior) -> Self {
        self.rules
            .lock()
            .expect("rules lock")
            .insert((job.map(str::to_string), command.to_string()), behavior);
        self
    }

    /// `command` always exits with `code`.
    pub fn fail_command(self, command: &str, code: i32) -> Self {
        self.with_rule(
            None,
            command,
            Behavior::Exit {
                code,
                remaining: None,
            },
        )
    }

    /// `command` exits with `code` for its first `times` calls, then 0.
    pub fn fail_command_times(self, command: &str, code: i32, times: u32) -> Self {
        self.with_rule(
            None,
            command,
            Behavior::Exit {
                code,
                remaining: Some(times),
            },
        )
    }

    /// `command` exits with `code`, but only inside `job`.
    pub fn fail_command_for_job(self, job: &str, command: &str, code: i32) -> Self {
        self.with_rule(
            Some(job),
            command,
            Behavior::Exit {
                code,
                remaining: None,
            },
        )
    }

    /// `command` takes `duration` and then succeeds.
    pub fn delay_command(self, command: &str, duration: Duration) -> Self {
        self.with_rule(None, command, Behavior::Sleep(duration))
    }

    /// `command` never completes.
    pub fn hang_command(self, command: &str) -> Self {
        self.with_rule(None, command, Behavior::Hang)
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<StepRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// How many times `command` ran, across all jobs.
    pub fn count_command(&self, command: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.command == command)
            .count()
    }

    /// Commands run for `job`, in order.
    pub fn commands_for_job(&self, job: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|r| r.job_name == job)
            .map(|r| r.command)
            .collect()
    }

    /// Step kinds run for `job`, in order.
    pub fn kinds_for_job(&self, job: &str) -> Vec<StepKind> {
        self.calls()
            .into_iter()
            .filter(|r| r.job_name == job)
            .map(|r| r.kind)
            .collect()
    }

    fn next_behavior(&self, request: &StepRequest) -> Option<Behavior> {
        let mut rules = self.rules.lock().expect("rules lock");
        let job_key = (Some(request.job_name.clone()), request.command.clone());
        let any_key = (None, request.command.clone());
        let key = if rules.contains_key(&job_key) {
            job_key
        } else {
            any_key
        };

        let behavior = rules.get_mut(&key)?;
        match behavior {
            Behavior::Exit {
                remaining: Some(0), ..
            } => None,
            Behavior::Exit {
                code,
                remaining: Some(n),
            } => {
                *n -= 1;
                Some(Behavior::Exit {
                    code: *code,
                    remaining: None,
                })
            }
            other => Some(*other),
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, ExecError> {
        self.calls.lock().expect("calls lock").push(request.clone());

        match self.next_behavior(request) {
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(StepOutput::default())
            }
            Some(Behavior::Exit { code, .. }) => Ok(StepOutput {
                exit_code: code,
                stderr: format!("{} failed", request.command),
                ..Default::default()
            }),
            None => Ok(StepOutput::default()),
        }
    }
}

/// Bootstrapper that records calls and fails for chosen jobs.
#[derive(Default)]
pub struct FakeBootstrapper {
    fail_jobs: HashSet<String>,
    bootstrapped: Mutex<Vec<String>>,
    torn_down: Mutex<Vec<String>>,
}

impl FakeBootstrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap for `job` exits 1.
    pub fn fail_for(mut self, job: &str) -> Self {
        self.fail_jobs.insert(job.to_string());
        self
    }

    /// Jobs bootstrap was invoked for, in call order.
    pub fn bootstrapped(&self) -> Vec<String> {
        self.bootstrapped.lock().expect("bootstrap lock").clone()
    }

    /// Jobs teardown was invoked for, in call order.
    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().expect("teardown lock").clone()
    }
}

#[async_trait]
impl ServiceBootstrapper for FakeBootstrapper {
    async fn bootstrap(
        &self,
        job: &JobDefinition,
        _base: &StepRequest,
    ) -> Result<Vec<StepRecord>, BootstrapFailure> {
        self.bootstrapped
            .lock()
            .expect("bootstrap lock")
            .push(job.name.clone());

        let exit_code = if self.fail_jobs.contains(&job.name) { 1 } else { 0 };
        let record = StepRecord {
            kind: StepKind::Bootstrap,
            command: "fake-bootstrap".to_string(),
            exit_code,
            duration_ms: 0,
            output_tail: String::new(),
        };
        if exit_code == 0 {
            Ok(vec![record])
        } else {
            Err(BootstrapFailure {
                reason: "bootstrap script exited with code 1".to_string(),
                exit_code,
                steps: vec![record],
            })
        }
    }

    async fn teardown(&self, job: &JobDefinition, _base: &StepRequest) -> Option<StepRecord> {
        self.torn_down
            .lock()
            .expect("teardown lock")
            .push(job.name.clone());
        None
    }
}

/// Credentials for tests.
pub fn credentials() -> RegistryCredentials {
    RegistryCredentials {
        username: Secret::new("ci-bot"),
        password: Secret::new("s3cr3t-registry-pass"),
    }
}

/// A run configuration with no timeout, no login and no bootstrap.
pub fn run_config() -> RunConfig {
    RunConfig {
        credentials: credentials(),
        registry_login: None,
        bootstrap: None,
        workdir: PathBuf::from("."),
        job_timeout_secs: 0,
        max_parallel: 0,
        base_env: BTreeMap::new(),
    }
}
