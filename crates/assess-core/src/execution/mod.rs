#[cfg(unix)]
pub mod tokio_process;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, ProviderName, RunId};

#[cfg(unix)]
pub use tokio_process::TokioProcessExecutor;

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self, provider: &ProviderName) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(
                provider,
                "command program path must not be empty",
            ));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid_input(
                provider,
                "command args must not contain NUL bytes",
            ));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                provider,
                "environment keys must be non-empty and entries must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub provider: ProviderName,
    pub run: Option<RunId>,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
}

impl ProcessSpawnRequest {
    pub fn new(provider: ProviderName, command: CommandSpec) -> Self {
        Self {
            provider,
            run: None,
            command,
            timeout: None,
        }
    }

    pub fn run(mut self, run: RunId) -> Self {
        self.run = Some(run);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command.validate(&self.provider)?;

        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(invalid_input(
                &self.provider,
                "timeout must be greater than zero when provided",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

/// A spawned child. Dropping the future returned by `wait` kills the child.
pub trait RunningProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

fn invalid_input(provider: &ProviderName, message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message).for_provider(provider)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CommandSpec, ProcessSpawnRequest};
    use crate::models::{CoreErrorKind, ProviderName};

    #[test]
    fn validation_rejects_empty_program_and_zero_timeout() {
        let provider = ProviderName::new("screenshot");

        let error = ProcessSpawnRequest::new(provider.clone(), CommandSpec::new(""))
            .validate()
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.provider, Some(provider.clone()));

        let error = ProcessSpawnRequest::new(provider, CommandSpec::new("/bin/true"))
            .timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(error.message.contains("timeout"));
    }

    #[test]
    fn validation_rejects_nul_in_env() {
        let provider = ProviderName::new("screenshot");
        let request = ProcessSpawnRequest::new(
            provider,
            CommandSpec::new("/bin/true").env("TOKEN", "a\0b"),
        );
        assert!(request.validate().is_err());
    }
}
