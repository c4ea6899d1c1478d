//! ci-matrix - staged test-matrix runner
//!
//! Runs a matrix of (interpreter version x stage) jobs:
//! - Resolves registry credentials once and performs an optional login
//! - Runs all unit jobs concurrently, each in a fresh environment
//! - Starts integration jobs only if every unit job passed, bootstrapping
//!   the backing service before each one
//! - Aggregates everything into a [`RunReport`] whose exit code is 0 iff
//!   every executed job succeeded

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod gate;
pub mod job;
pub mod login;
pub mod obs;
pub mod report;
pub mod runner;
pub mod spec;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use bootstrap::{BootstrapPolicy, ScriptBootstrapper, ServiceBootstrapper};
pub use config::{RegistryCredentials, RunConfig, RunOverrides, Secret};
pub use error::{ConfigError, ExecError, JobFailure, MatrixError, Result};
pub use exec::{ShellExecutor, StepExecutor, StepOutput, StepRequest};
pub use gate::{run_matrix, GateVerdict, StageGate};
pub use job::{ExitStatus, JobDefinition, JobOutcome, StepKind, StepRecord};
pub use report::{HaltReason, RunReport};
pub use runner::{MatrixRunner, StageResult};
pub use spec::MatrixSpec;
pub use stage::Stage;
pub use telemetry::init_tracing;
