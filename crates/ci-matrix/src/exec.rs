//! Step execution.
//!
//! Every process the runner starts (login, bootstrap, install, test,
//! teardown) goes through a [`StepExecutor`]. [`ShellExecutor`] runs the
//! command with `sh -c` in a cleared environment; tests swap in
//! [`crate::fakes::ScriptedExecutor`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;
use crate::job::{StepKind, StepRecord};

/// Lines of output kept in a failed step's record.
const OUTPUT_TAIL_LINES: usize = 20;

/// A single process invocation.
#[derive(Clone)]
pub struct StepRequest {
    pub job_name: String,
    pub kind: StepKind,
    pub command: String,
    pub workdir: PathBuf,
    /// Complete environment of the child; nothing else is inherited.
    pub env: BTreeMap<String, String>,
    /// 0 = no limit.
    pub timeout_secs: u64,
}

impl StepRequest {
    /// Base request for a job; specialise with [`StepRequest::for_step`].
    pub fn new(job_name: &str, workdir: PathBuf, env: BTreeMap<String, String>) -> Self {
        Self {
            job_name: job_name.to_string(),
            kind: StepKind::Test,
            command: String::new(),
            workdir,
            env,
            timeout_secs: 0,
        }
    }

    /// Copy of this request running `command` as `kind`.
    pub fn for_step(&self, kind: StepKind, command: &str) -> Self {
        Self {
            kind,
            command: command.to_string(),
            ..self.clone()
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

// Environment values may carry registry secrets, so only keys are shown.
impl std::fmt::Debug for StepRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRequest")
            .field("job_name", &self.job_name)
            .field("kind", &self.kind)
            .field("command", &self.command)
            .field("workdir", &self.workdir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StepOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert into a report record; output is kept only for failures.
    pub fn into_record(self, request: &StepRequest) -> StepRecord {
        let output_tail = if self.succeeded() {
            String::new()
        } else {
            tail_lines(&format!("{}{}", self.stdout, self.stderr), OUTPUT_TAIL_LINES)
        };
        StepRecord {
            kind: request.kind,
            command: request.command.clone(),
            exit_code: self.exit_code,
            duration_ms: self.duration_ms,
            output_tail,
        }
    }
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}

/// Kills a step's process group unless disarmed.
///
/// Each step's shell leads its own group, so subshells, pipelines and
/// background children go down with it.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// The shell exited normally. Background children it started (a
    /// service launched by a bootstrap script) keep running.
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    // SAFETY: killpg has no memory effects; a stale group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "process group already exited");
    } else {
        debug!(pgid, "killed step process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: i32) {}

/// Runs step processes.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step to completion. A non-zero exit is `Ok`; `Err` means the
    /// process never produced an exit code.
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, ExecError>;
}

/// Executes steps as `<shell> -c <command>` child processes.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, ExecError> {
        let start = Instant::now();

        if request.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        debug!(job = %request.job_name, step = %request.kind, command = %request.command, "Spawning step");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ExecError::Spawn {
            command: request.command.clone(),
            source,
        })?;
        // Armed until the shell exits on its own; a timeout or a dropped
        // future kills everything the shell forked.
        let group = ProcessGroupGuard::new(child.id());

        let waited = if request.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(request.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ExecError::Timeout(request.timeout_secs))?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|source| ExecError::Spawn {
            command: request.command.clone(),
            source,
        })?;
        group.disarm();

        Ok(StepOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
