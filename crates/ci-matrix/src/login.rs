//! Pre-flight registry login.

use crate::config::RunConfig;
use crate::error::{MatrixError, Result};
use crate::exec::{StepExecutor, StepRequest};
use crate::job::{StepKind, StepRecord};
use crate::obs;

/// Step name used for the login request.
const LOGIN_JOB: &str = "registry-login";

const LOGIN_TIMEOUT_SECS: u64 = 300;

/// Run the configured login command once, with the registry secrets in its
/// environment. `Ok(None)` when no login is configured.
///
/// Errors never include the command's output, which may echo secrets.
pub async fn registry_login(
    config: &RunConfig,
    executor: &dyn StepExecutor,
) -> Result<Option<StepRecord>> {
    let Some(command) = config.registry_login.as_deref() else {
        return Ok(None);
    };

    let mut env = config.base_env.clone();
    env.extend(config.credentials.login_env());

    let request = StepRequest::new(LOGIN_JOB, config.workdir.clone(), env)
        .for_step(StepKind::Login, command)
        .with_timeout_secs(LOGIN_TIMEOUT_SECS);

    let output = executor
        .execute(&request)
        .await
        .map_err(|e| MatrixError::RegistryLogin(e.to_string()))?;

    obs::emit_registry_login(output.exit_code);

    if !output.succeeded() {
        return Err(MatrixError::RegistryLogin(format!(
            "login command exited with code {}",
            output.exit_code
        )));
    }

    let mut record = output.into_record(&request);
    record.output_tail.clear();
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, ScriptedExecutor};
    use tracing_test::traced_test;

    const LOGIN: &str = "echo \"$REGISTRY_PASSWORD\" | docker login -u \"$REGISTRY_USERNAME\" --password-stdin";

    #[tokio::test]
    async fn test_no_login_configured() {
        let executor = ScriptedExecutor::new();
        let config = fakes::run_config();
        let record = registry_login(&config, &executor).await.unwrap();
        assert!(record.is_none());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_login_receives_secrets_through_env() {
        let executor = ScriptedExecutor::new();
        let mut config = fakes::run_config();
        config.registry_login = Some(LOGIN.to_string());

        let record = registry_login(&config, &executor)
            .await
            .unwrap()
            .expect("login record");
        assert_eq!(record.kind, StepKind::Login);

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].env["REGISTRY_USERNAME"], "ci-bot");
        assert_eq!(calls[0].env["REGISTRY_PASSWORD"], "s3cr3t-registry-pass");
        assert!(!calls[0].command.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_login_failure_is_fatal() {
        let executor = ScriptedExecutor::new().fail_command(LOGIN, 1);
        let mut config = fakes::run_config();
        config.registry_login = Some(LOGIN.to_string());

        let err = registry_login(&config, &executor).await.unwrap_err();
        assert!(matches!(err, MatrixError::RegistryLogin(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_login_never_logs_secrets() {
        let executor = ScriptedExecutor::new();
        let mut config = fakes::run_config();
        config.registry_login = Some(LOGIN.to_string());

        registry_login(&config, &executor).await.unwrap();

        assert!(logs_contain("registry.login"));
        assert!(!logs_contain("s3cr3t-registry-pass"));
        assert!(!logs_contain("ci-bot"));
    }
}
