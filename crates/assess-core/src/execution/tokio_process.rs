use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, ProviderName, RunId};

const OUTPUT_READ_WINDOW: Duration = Duration::from_millis(250);

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|error| {
            process_failure(
                &request.provider,
                request.run,
                format!("failed to spawn '{}': {error}", request.command.program.display()),
            )
        })?;

        Ok(Box::new(TokioRunningProcess {
            pid: child.id(),
            child: Mutex::new(Some(child)),
            started_at: SystemTime::now(),
            timeout: request.timeout,
            provider: request.provider,
            run: request.run,
        }))
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    provider: ProviderName,
    run: Option<RunId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let child = self.child.into_inner().ok().flatten();
        let TokioRunningProcess {
            pid,
            started_at,
            timeout,
            provider,
            run,
            ..
        } = *self;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                process_failure(&provider, run, "child process already consumed".to_string())
            })?;

            let stdout_reader = {
                let stdout = child.stdout.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stdout {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };
            let stderr_reader = {
                let stderr = child.stderr.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stderr {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };

            let wait_err = |error: std::io::Error| {
                process_failure(&provider, run, format!("failed to wait for process: {error}"))
            };

            // Exit first, then a bounded read: grandchildren may hold the pipes open.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        kill_process_group(pid);
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        let mut error = CoreError::new(
                            CoreErrorKind::Timeout,
                            format!("process timed out after {}ms", timeout_duration.as_millis()),
                        )
                        .for_provider(&provider);
                        error.run = run;
                        return Err(error);
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let stdout = match tokio::time::timeout(OUTPUT_READ_WINDOW, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(OUTPUT_READ_WINDOW, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: signalling a process group we created; ESRCH is harmless.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

fn process_failure(provider: &ProviderName, run: Option<RunId>, message: String) -> CoreError {
    let mut error = CoreError::new(CoreErrorKind::ProcessFailure, message).for_provider(provider);
    error.run = run;
    error
}
