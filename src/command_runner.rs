//! Remote command runner (spec §4.3 C3): submits an interactive job for
//! `executable arguments…` on the `unlimited` queue, pipes `stdin` in,
//! concurrently drains stdout/stderr (required to avoid deadlocking when a
//! pipe buffer fills — spec §4.3), waits for completion, and records
//! `(stdout, stderr, exitCode)`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::job::JobDescription;
use crate::scheduler::{JobQueueScheduler, QUEUE_UNLIMITED};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// `exitCode == 0 && stderr empty`.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.stderr.is_empty()
    }

    /// `exitCode == 0`, tolerating stderr content (spec §9 open question:
    /// both forms are part of the contract).
    pub fn success_ignore_error(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub struct CommandRunner<'a> {
    scheduler: &'a JobQueueScheduler,
    adaptor_name: String,
}

impl<'a> CommandRunner<'a> {
    pub fn new(scheduler: &'a JobQueueScheduler, adaptor_name: impl Into<String>) -> Self {
        CommandRunner {
            scheduler,
            adaptor_name: adaptor_name.into(),
        }
    }

    /// Run `executable arguments…`, optionally feeding `stdin`, and collect
    /// its full output. Any transport error surfaces as a wrapped failure.
    pub async fn run(
        &self,
        executable: &str,
        arguments: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult> {
        let desc = JobDescription {
            executable: executable.to_string(),
            arguments: arguments.to_vec(),
            queue_name: Some(QUEUE_UNLIMITED.to_string()),
            ..Default::default()
        };

        let mut streams = self.scheduler.submit_interactive_job(desc).await?;
        let job_id = streams.job_identifier.clone();

        let mut stdout_handle = streams.stdout.take().ok_or_else(|| {
            Error::not_connected(&self.adaptor_name, "no stdout stream on interactive job")
        })?;
        let mut stderr_handle = streams.stderr.take().ok_or_else(|| {
            Error::not_connected(&self.adaptor_name, "no stderr stream on interactive job")
        })?;
        let mut stdin_handle = streams.stdin.take();
        let stdin_bytes = stdin.map(|b| b.to_vec());

        // Drain stdout and stderr on independent tasks so neither blocks
        // the other behind a full pipe buffer, while a third task writes
        // stdin and closes it (spec §4.3 / §5 "command runner" suspension
        // points).
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_handle.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_handle.read_to_end(&mut buf).await;
            buf
        });
        let stdin_task = tokio::spawn(async move {
            if let (Some(mut sink), Some(bytes)) = (stdin_handle.take(), stdin_bytes) {
                let _ = sink.write_all(&bytes).await;
                let _ = sink.shutdown().await;
            }
        });

        let (stdout, stderr, _) = tokio::try_join!(stdout_task, stderr_task, stdin_task)
            .map_err(|e| Error::not_connected(&self.adaptor_name, format!("stream task panicked: {e}")))?;

        let status = self.scheduler.wait_until_done(&job_id, 0).await?;

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code: status.exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::LocalProcessFactory;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn local_echo_succeeds() {
        let sched = JobQueueScheduler::new(
            "local",
            std::env::temp_dir(),
            Arc::new(LocalProcessFactory::new("local")),
            4,
            Duration::from_millis(100),
        )
        .unwrap();
        let runner = CommandRunner::new(&sched, "local");
        let result = runner
            .run("/bin/echo", &["hello world".to_string()], None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_string(), "hello world\n");
        assert!(result.stderr.is_empty());
        assert!(result.success());
    }
}
