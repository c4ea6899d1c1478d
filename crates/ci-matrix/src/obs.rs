//! Structured observability hooks for the matrix run lifecycle.
//!
//! This module provides:
//! - A run-scoped span via [`run_span`], attached with `Instrument`
//! - Emission functions for key lifecycle events: run start/finish, stage
//!   start/finish, job finish, gate decisions and bootstrap attempts
//!
//! Events carry a stable `event` field so JSON log consumers can filter on it.
//! Secrets never pass through here.

use tracing::{info, warn};

use crate::stage::Stage;

/// Span tagged with the run id and matrix name.
///
/// # Example
///
/// ```ignore
/// gate.run_stages(spec).instrument(run_span("6f1c...", "client-tests")).await
/// // every event inside carries run_id and matrix
/// ```
pub fn run_span(run_id: &str, matrix: &str) -> tracing::Span {
    tracing::info_span!("ci_matrix.run", run_id = %run_id, matrix = %matrix)
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, matrix_digest: &str, total_jobs: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        matrix_digest = %matrix_digest,
        total_jobs = total_jobs,
    );
}

/// Emit event: run finished with duration and success status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: registry login outcome. Only the exit code is logged.
pub fn emit_registry_login(exit_code: i32) {
    if exit_code == 0 {
        info!(event = "registry.login", success = true);
    } else {
        warn!(event = "registry.login", success = false, exit_code = exit_code);
    }
}

/// Emit event: stage started.
pub fn emit_stage_started(stage: Stage, jobs: usize) {
    info!(event = "stage.started", stage = %stage, jobs = jobs);
}

/// Emit event: stage finished with pass/fail counts.
pub fn emit_stage_finished(stage: Stage, passed: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        passed = passed,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: a job finished.
pub fn emit_job_finished(job: &str, succeeded: bool, exit_code: i32, duration_ms: u64) {
    if succeeded {
        info!(event = "job.finished", job = %job, success = true, duration_ms = duration_ms);
    } else {
        warn!(
            event = "job.finished",
            job = %job,
            success = false,
            exit_code = exit_code,
            duration_ms = duration_ms,
        );
    }
}

/// Emit event: the gate refused to start the next stage.
pub fn emit_gate_blocked(stage: Stage, next: Stage, failed_jobs: usize) {
    warn!(
        event = "gate.blocked",
        stage = %stage,
        next = %next,
        failed_jobs = failed_jobs,
    );
}

/// Emit event: one bootstrap attempt is starting.
pub fn emit_bootstrap_attempt(job: &str, attempt: u32, max_attempts: u32) {
    info!(
        event = "bootstrap.attempt",
        job = %job,
        attempt = attempt,
        max_attempts = max_attempts,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_emit_run_started_logs_digest() {
        emit_run_started("run-123", "abc123", 8);
        assert!(logs_contain("run.started"));
        assert!(logs_contain("abc123"));
    }

    #[traced_test]
    #[test]
    fn test_emit_gate_blocked_names_both_stages() {
        emit_gate_blocked(Stage::Unit, Stage::Integration, 2);
        assert!(logs_contain("gate.blocked"));
        assert!(logs_contain("integration"));
    }

    #[traced_test]
    #[test]
    fn test_emit_job_finished_failure_includes_exit_code() {
        emit_job_finished("unit/py3.6", false, 4, 10);
        assert!(logs_contain("exit_code=4"));
    }

    #[traced_test]
    #[test]
    fn test_run_span_tags_events() {
        let _entered = run_span("test-run-id", "matrix").entered();
        emit_stage_started(Stage::Unit, 4);
        assert!(logs_contain("test-run-id"));
        assert!(logs_contain("stage.started"));
    }
}
