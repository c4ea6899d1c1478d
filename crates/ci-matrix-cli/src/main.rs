//! ci-matrix - staged test-matrix runner CLI
//!
//! ## Commands
//!
//! - `run`: Execute the matrix (unit stage, then integration stage if green)
//! - `plan`: Print the expanded job list without running anything
//! - `validate`: Check the matrix file and that registry secrets are present

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn, Level};

use ci_matrix::{
    run_matrix, ConfigError, JobDefinition, MatrixError, MatrixSpec, RegistryCredentials,
    RunOverrides, ShellExecutor, Stage,
};

/// Exit code when the run is interrupted.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "ci-matrix")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged test-matrix runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the matrix
    Run {
        /// Matrix file
        #[arg(short, long, env = "CI_MATRIX_CONFIG", default_value = "ci-matrix.toml")]
        config: PathBuf,

        /// Directory steps run in (overrides run.workdir)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Concurrent jobs per stage, 0 = unbounded (overrides run.max_parallel)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Per-job timeout in seconds, 0 disables (overrides run.job_timeout_secs)
        #[arg(long)]
        job_timeout: Option<u64>,

        /// Write the JSON run report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Show the jobs a run would execute
    Plan {
        /// Matrix file
        #[arg(short, long, env = "CI_MATRIX_CONFIG", default_value = "ci-matrix.toml")]
        config: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: PlanFormat,
    },

    /// Validate the matrix file and registry secrets
    Validate {
        /// Matrix file
        #[arg(short, long, env = "CI_MATRIX_CONFIG", default_value = "ci-matrix.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PlanFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    matrix: &'a str,
    digest: &'a str,
    jobs: &'a [JobDefinition],
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ci_matrix::init_tracing(cli.json, level);

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for(&err)
        }
    };
    ExitCode::from(code as u8)
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            workdir,
            max_parallel,
            job_timeout,
            report,
        } => {
            let overrides = RunOverrides {
                workdir,
                max_parallel,
                job_timeout_secs: job_timeout,
            };
            cmd_run(&config, overrides, report.as_deref()).await
        }
        Commands::Plan { config, format } => {
            let spec = load_spec(&config)?;
            print!("{}", render_plan(&spec, format)?);
            Ok(0)
        }
        Commands::Validate { config } => {
            let spec = load_spec(&config)?;
            println!("{}", cmd_validate(&spec, |name| std::env::var(name).ok())?);
            Ok(0)
        }
    }
}

fn load_spec(path: &Path) -> Result<MatrixSpec> {
    MatrixSpec::load(path)
        .map_err(MatrixError::from)
        .with_context(|| format!("Failed to load matrix file {}", path.display()))
}

/// Run the matrix, print the report and return the process exit code.
async fn cmd_run(config: &Path, overrides: RunOverrides, report_path: Option<&Path>) -> Result<i32> {
    let spec = load_spec(config)?;
    info!(matrix = %spec.name(), jobs = spec.jobs().len(), "Loaded matrix");

    let executor = ShellExecutor::default();
    let run = run_matrix(
        &spec,
        overrides,
        |name| std::env::var(name).ok(),
        &executor,
    );

    // Dropping the run future kills every child process still running.
    let report = tokio::select! {
        result = run => result.context("Matrix run failed")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping all jobs");
            eprintln!("Interrupted");
            return Ok(EXIT_INTERRUPTED);
        }
    };

    print!("{}", report.render_text());

    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run report");
    }

    Ok(report.exit_code())
}

/// Expanded job list, grouped by stage.
fn render_plan(spec: &MatrixSpec, format: PlanFormat) -> Result<String> {
    if format == PlanFormat::Json {
        let plan = PlanOutput {
            matrix: spec.name(),
            digest: spec.digest(),
            jobs: spec.jobs(),
        };
        let mut json = serde_json::to_string_pretty(&plan)?;
        json.push('\n');
        return Ok(json);
    }

    let mut out = String::new();
    writeln!(out, "Matrix: {} ({})", spec.name(), spec.digest())?;
    for stage in Stage::ORDER {
        let jobs = spec.jobs_for(stage);
        writeln!(out, "\n[{}] {} ({} jobs)", stage, stage.title(), jobs.len())?;
        for job in &jobs {
            writeln!(out, "  {} (version {})", job.name, job.interpreter_version)?;
            for step in &job.install_steps {
                writeln!(out, "      install: {}", step)?;
            }
            writeln!(out, "      test:    {}", job.test_command)?;
        }
    }
    Ok(out)
}

/// Check that both registry secrets resolve. Never prints their values.
fn cmd_validate<F>(spec: &MatrixSpec, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    RegistryCredentials::resolve(spec.credentials(), lookup)
        .map_err(MatrixError::from)
        .context("Registry credentials are incomplete")?;

    Ok(format!(
        "✓ {}: {} unit job(s), {} integration job(s), credentials present",
        spec.name(),
        spec.jobs_for(Stage::Unit).len(),
        spec.jobs_for(Stage::Integration).len()
    ))
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<MatrixError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return 2;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MATRIX: &str = r#"
version = 1
name = "client-tests"

[bootstrap]
command = "./ci/start_service.sh"

[matrix]
interpreter_versions = ["3.6", "3.7"]
label = "py"

[matrix.unit]
install = ["pip install -r requirements.txt"]
test = "python -m unittest discover test"

[matrix.integration]
test = "python integration/client_functions.py"
"#;

    fn write_matrix(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("ci-matrix.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "ci-matrix",
            "--json",
            "run",
            "--config",
            "m.toml",
            "--max-parallel",
            "2",
            "--job-timeout",
            "60",
            "--report",
            "out.json",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Run {
                config,
                max_parallel,
                job_timeout,
                report,
                workdir,
            } => {
                assert_eq!(config, PathBuf::from("m.toml"));
                assert_eq!(max_parallel, Some(2));
                assert_eq!(job_timeout, Some(60));
                assert_eq!(report, Some(PathBuf::from("out.json")));
                assert!(workdir.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_plan_format() {
        let cli = Cli::try_parse_from(["ci-matrix", "plan", "-c", "m.toml", "--format", "json"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Plan {
                format: PlanFormat::Json,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["ci-matrix", "plan", "--format", "yaml"]).is_err());
    }

    #[test]
    fn test_plan_text_lists_every_job() {
        let spec = MatrixSpec::from_toml_str(MATRIX).unwrap();
        let text = render_plan(&spec, PlanFormat::Text).unwrap();

        assert!(text.starts_with("Matrix: client-tests ("));
        assert!(text.contains("[unit] Unit tests (2 jobs)"));
        assert!(text.contains("[integration] Integration Test (2 jobs)"));
        assert!(text.contains("unit/py3.6 (version 3.6)"));
        assert!(text.contains("install: pip install -r requirements.txt"));
        assert!(text.contains("test:    python integration/client_functions.py"));
    }

    #[test]
    fn test_plan_json_output() {
        let spec = MatrixSpec::from_toml_str(MATRIX).unwrap();
        let json = render_plan(&spec, PlanFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["matrix"], "client-tests");
        assert_eq!(value["digest"], spec.digest());
        assert_eq!(value["jobs"].as_array().unwrap().len(), 4);
        assert_eq!(value["jobs"][0]["name"], "unit/py3.6");
        assert_eq!(value["jobs"][0]["stage"], "unit");
    }

    #[test]
    fn test_validate_requires_both_secrets() {
        let spec = MatrixSpec::from_toml_str(MATRIX).unwrap();

        let vars: HashMap<&str, &str> =
            [("DOCKER_USERNAME", "bot"), ("DOCKER_PASSWORD", "hunter2")].into();
        let message = cmd_validate(&spec, |n| vars.get(n).map(|v| v.to_string())).unwrap();
        assert!(message.contains("2 unit job(s), 2 integration job(s)"));
        assert!(!message.contains("hunter2"));

        let err = cmd_validate(&spec, |n| {
            (n == "DOCKER_USERNAME").then(|| "bot".to_string())
        })
        .unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert!(format!("{err:#}").contains("DOCKER_PASSWORD"));
    }

    #[test]
    fn test_load_errors_map_to_configuration_exit_code() {
        let dir = tempfile::tempdir().unwrap();

        let err = load_spec(&dir.path().join("missing.toml")).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);

        let path = write_matrix(dir.path(), "version = 2\n");
        let err = load_spec(&path).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert!(format!("{err:#}").contains("Failed to load matrix file"));
    }

    #[test]
    fn test_demo_matrix_plans() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/ci-matrix.toml");
        let spec = load_spec(&path).unwrap();

        assert_eq!(spec.jobs_for(Stage::Unit).len(), 5);
        assert_eq!(spec.jobs_for(Stage::Integration).len(), 4);
        assert_eq!(spec.bootstrap().map(|b| b.attempts), Some(3));

        let text = render_plan(&spec, PlanFormat::Text).unwrap();
        assert!(text.contains("unit/lint (version 3.9)"));
        assert!(text.contains("integration/py3.9 (version 3.9)"));
    }

    #[test]
    fn test_exit_code_for_other_errors() {
        assert_eq!(
            exit_code_for(&anyhow::Error::from(MatrixError::RegistryLogin("x".into()))),
            3
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("unexpected")), 1);
    }
}
