use std::sync::Arc;
use std::time::Duration;

use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, CostInfo, ProviderResult, QueueClass};
use crate::providers::{
    AdapterResult, InvocationContext, InvokeFuture, ProviderAdapter, ProviderDescriptor,
    ProviderInput,
};

/// sysexits(3) codes providers use to report why they gave up.
const EXIT_DATAERR: i32 = 65;
const EXIT_TEMPFAIL: i32 = 75;
const EXIT_NOPERM: i32 = 77;

const STDERR_EXCERPT_LIMIT: usize = 512;

/// Runs an external command per attempt and reads its stdout as the provider payload.
pub struct ProcessProvider {
    descriptor: ProviderDescriptor,
    command: CommandSpec,
    executor: Arc<dyn ProcessExecutor>,
    cost_per_call_micros: u64,
}

impl ProcessProvider {
    pub fn new(
        name: &str,
        queue_class: QueueClass,
        command: CommandSpec,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(name, queue_class),
            command,
            executor,
            cost_per_call_micros: 0,
        }
    }

    pub fn with_cost_per_call(mut self, cost_micros: u64) -> Self {
        self.cost_per_call_micros = cost_micros;
        self
    }

    fn request(&self, context: &InvocationContext, input: &ProviderInput) -> ProcessSpawnRequest {
        let command = self
            .command
            .clone()
            .env("ASSESS_SUBJECT", input.subject.as_str())
            .env("ASSESS_RUN_ID", context.run.to_string())
            .env("ASSESS_PROVIDER", context.provider.as_str())
            .env("ASSESS_ATTEMPT", context.attempt.to_string())
            .env("ASSESS_IDEMPOTENCY_KEY", context.idempotency_key.as_str());

        ProcessSpawnRequest::new(context.provider.clone(), command)
            .run(context.run)
            .timeout(context.deadline)
    }

    fn result_from_output(&self, output: ProcessOutput) -> AdapterResult<ProviderResult> {
        let cost = CostInfo {
            cost_micros: self.cost_per_call_micros,
            latency: output
                .finished_at
                .duration_since(output.started_at)
                .unwrap_or(Duration::ZERO),
            peak_memory_bytes: None,
        };
        if let Some(error) = exit_status_error(output.status, &output.stderr) {
            return Err(error.for_provider(&self.descriptor.name).with_cost(cost));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        let payload = serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()));

        Ok(ProviderResult { payload, cost })
    }
}

impl ProviderAdapter for ProcessProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn invoke<'a>(&'a self, context: InvocationContext, input: ProviderInput) -> InvokeFuture<'a> {
        Box::pin(async move {
            let request = self.request(&context, &input);
            let process = spawn_validated(self.executor.as_ref(), request)?;
            tracing::debug!(
                run_id = %context.run,
                provider = %context.provider,
                attempt = context.attempt,
                pid = ?process.pid(),
                "provider process spawned"
            );

            // Dropping the wait future kills the child.
            let output = tokio::select! {
                _ = context.cancellation.cancelled() => {
                    return Err(CoreError::new(CoreErrorKind::Cancelled, "run cancelled")
                        .for_run(context.run)
                        .for_provider(&context.provider));
                }
                output = process.wait() => output?,
            };

            self.result_from_output(output)
                .map_err(|error| error.for_run(context.run))
        })
    }
}

/// Maps a provider process exit code to the error it reports, if any.
pub fn exit_code_error(code: i32, stderr: &[u8]) -> Option<CoreError> {
    if code == 0 {
        return None;
    }

    let kind = match code {
        EXIT_DATAERR => CoreErrorKind::MalformedInput,
        EXIT_TEMPFAIL => CoreErrorKind::Upstream,
        EXIT_NOPERM => CoreErrorKind::AuthFailure,
        _ => CoreErrorKind::ProcessFailure,
    };
    Some(CoreError::new(
        kind,
        format!("provider exited with code {code}{}", stderr_excerpt(stderr)),
    ))
}

fn exit_status_error(status: ProcessExitStatus, stderr: &[u8]) -> Option<CoreError> {
    match status {
        ProcessExitStatus::ExitCode(code) => exit_code_error(code, stderr),
        ProcessExitStatus::Terminated => Some(CoreError::new(
            CoreErrorKind::ProcessFailure,
            format!("provider terminated by signal{}", stderr_excerpt(stderr)),
        )),
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let mut end = text.len().min(STDERR_EXCERPT_LIMIT);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(": {}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::{exit_code_error, stderr_excerpt};
    use crate::models::CoreErrorKind;

    #[test]
    fn exit_codes_map_to_error_kinds() {
        assert!(exit_code_error(0, b"").is_none());
        assert_eq!(
            exit_code_error(65, b"").map(|error| error.kind),
            Some(CoreErrorKind::MalformedInput)
        );
        assert_eq!(
            exit_code_error(75, b"").map(|error| error.kind),
            Some(CoreErrorKind::Upstream)
        );
        assert_eq!(
            exit_code_error(77, b"").map(|error| error.kind),
            Some(CoreErrorKind::AuthFailure)
        );
        assert_eq!(
            exit_code_error(1, b"boom").map(|error| error.kind),
            Some(CoreErrorKind::ProcessFailure)
        );
    }

    #[test]
    fn stderr_excerpt_is_trimmed_and_bounded() {
        assert_eq!(stderr_excerpt(b"  \n"), "");
        assert_eq!(stderr_excerpt(b"rate limit hit\n"), ": rate limit hit");
        let long = "é".repeat(400);
        assert!(stderr_excerpt(long.as_bytes()).len() <= 514);
    }
}
