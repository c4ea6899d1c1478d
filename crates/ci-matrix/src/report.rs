//! Aggregated run report.
//!
//! The report is the single source of the process exit code and can be
//! written as JSON for downstream tooling.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::gate::GateVerdict;
use crate::job::StepRecord;
use crate::runner::StageResult;
use crate::stage::Stage;

/// Why the run stopped before its last stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HaltReason {
    /// Stage that failed.
    pub stage: Stage,
    /// Stage that was never started.
    pub blocked: Stage,
    pub failed_jobs: Vec<String>,
}

/// Outcome of a complete matrix run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub matrix: String,
    pub matrix_digest: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<StepRecord>,
    /// Executed stages, in order.
    pub stages: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<HaltReason>,
    pub success: bool,
}

impl RunReport {
    /// Result of `stage`, if it ran.
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage() == stage)
    }

    /// Jobs attempted across all executed stages.
    pub fn total_jobs(&self) -> usize {
        self.stages.iter().map(|s| s.job_results().len()).sum()
    }

    pub fn passed_count(&self) -> usize {
        self.stages.iter().map(StageResult::passed_count).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.stages.iter().map(StageResult::failed_count).sum()
    }

    /// 0 iff every job of every executed stage succeeded, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }

    /// Gate verdict for each executed stage.
    pub fn verdicts(&self) -> Vec<GateVerdict> {
        self.stages.iter().map(GateVerdict::evaluate).collect()
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let digest_short: String = self.matrix_digest.chars().take(12).collect();

        let _ = writeln!(out, "Run ID: {}", self.run_id);
        let _ = writeln!(out, "Matrix: {} ({})", self.matrix, digest_short);
        let _ = writeln!(
            out,
            "Status: {}",
            if self.success { "✓ PASSED" } else { "✗ FAILED" }
        );
        let _ = writeln!(out, "Duration: {}ms", self.duration_ms);

        for stage in &self.stages {
            let _ = writeln!(
                out,
                "\n[{}] {}: {}/{} jobs passed",
                stage.stage(),
                stage.stage().title(),
                stage.passed_count(),
                stage.job_results().len()
            );
            for outcome in stage.job_results().values() {
                if outcome.passed() {
                    let _ = writeln!(out, "  ✓ {} ({}ms)", outcome.job_name, outcome.duration_ms);
                    continue;
                }
                let _ = write!(
                    out,
                    "  ✗ {} ({}ms, exit code: {})",
                    outcome.job_name, outcome.duration_ms, outcome.status.exit_code
                );
                match &outcome.failure {
                    Some(failure) => {
                        let _ = writeln!(out, ": {}", failure);
                    }
                    None => out.push('\n'),
                }
                if let Some(step) = outcome.steps.iter().rev().find(|s| !s.output_tail.is_empty()) {
                    for line in step.output_tail.lines() {
                        let _ = writeln!(out, "      {}", line);
                    }
                }
            }
        }

        if let Some(halt) = &self.halted {
            let _ = writeln!(
                out,
                "\nGate: {} stage not started, {} {} job(s) failed: {}",
                halt.blocked,
                halt.failed_jobs.len(),
                halt.stage,
                halt.failed_jobs.join(", ")
            );
        }

        let _ = writeln!(
            out,
            "\nSummary: {}/{} jobs passed",
            self.passed_count(),
            self.total_jobs()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, ScriptedExecutor};
    use crate::job::JobDefinition;
    use crate::runner::MatrixRunner;

    async fn unit_stage(fail: Option<&str>) -> StageResult {
        let mut executor = ScriptedExecutor::new();
        if let Some(job) = fail {
            executor = executor.fail_command_for_job(job, "pytest", 1);
        }
        let config = fakes::run_config();
        let jobs = vec![
            JobDefinition::new("unit/py3.6", Stage::Unit, "3.6", vec![], "pytest"),
            JobDefinition::new("unit/py3.7", Stage::Unit, "3.7", vec![], "pytest"),
        ];
        MatrixRunner::new(&executor, &config)
            .run_stage(Stage::Unit, &jobs, None)
            .await
    }

    fn report(stages: Vec<StageResult>, halted: Option<HaltReason>) -> RunReport {
        let success = halted.is_none() && stages.iter().all(StageResult::succeeded);
        RunReport {
            run_id: Uuid::new_v4(),
            matrix: "client-tests".to_string(),
            matrix_digest: "0123456789abcdef0123".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 42,
            login: None,
            stages,
            halted,
            success,
        }
    }

    #[tokio::test]
    async fn test_counts_and_exit_code() {
        let ok = report(vec![unit_stage(None).await], None);
        assert_eq!(ok.total_jobs(), 2);
        assert_eq!(ok.passed_count(), 2);
        assert_eq!(ok.exit_code(), 0);

        let halted = HaltReason {
            stage: Stage::Unit,
            blocked: Stage::Integration,
            failed_jobs: vec!["unit/py3.7".to_string()],
        };
        let failed = report(vec![unit_stage(Some("unit/py3.7")).await], Some(halted));
        assert_eq!(failed.failed_count(), 1);
        assert_eq!(failed.exit_code(), 1);
        assert!(failed.stage(Stage::Integration).is_none());
    }

    #[tokio::test]
    async fn test_render_text_lists_failures_and_gate() {
        let halted = HaltReason {
            stage: Stage::Unit,
            blocked: Stage::Integration,
            failed_jobs: vec!["unit/py3.7".to_string()],
        };
        let text = report(vec![unit_stage(Some("unit/py3.7")).await], Some(halted)).render_text();

        assert!(text.contains("Matrix: client-tests (0123456789ab)"));
        assert!(text.contains("✓ unit/py3.6"));
        assert!(text.contains("✗ unit/py3.7"));
        assert!(text.contains("test command exited with code 1"));
        assert!(text.contains("pytest failed"));
        assert!(text.contains("integration stage not started"));
        assert!(text.contains("Summary: 1/2 jobs passed"));
    }

    #[test]
    fn test_render_text_with_non_ascii_digest() {
        let mut loaded = report(vec![], None);
        loaded.matrix_digest = "é".repeat(20);

        let text = loaded.render_text();
        assert!(text.contains(&format!("Matrix: client-tests ({})", "é".repeat(12))));
    }

    #[tokio::test]
    async fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report(vec![unit_stage(None).await], None)
            .write_json(&path)
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["matrix"], "client-tests");
        assert_eq!(value["success"], true);
        assert_eq!(value["stages"][0]["stage"], "unit");
        assert_eq!(
            value["stages"][0]["job_results"]["unit/py3.6"]["status"]["succeeded"],
            true
        );
        assert!(value.get("halted").is_none());
    }
}
