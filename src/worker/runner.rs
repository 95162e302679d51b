use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::scheduler::job::ResourceClass;

/// What a runner knows about the job it executes.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub version: String,
    pub class: ResourceClass,
    pub resource_id: String,
}

/// `Ok(result_data)` on success, `Err(result_data)` on failure.
pub type RunResult = std::result::Result<String, String>;

/// Performs the actual work of a job against its leased resource.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: &JobContext, payload: &[u8]) -> RunResult;
}

/// Stand-in for real device work: waits, then succeeds with a fixed probability.
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    pub duration: Duration,
    pub success_rate: f64,
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            success_rate: 0.8,
        }
    }
}

impl SimulatedRunner {
    /// `success_rate` is clamped to `[0, 1]`; a non-finite rate counts as 0.
    pub fn new(duration: Duration, success_rate: f64) -> Self {
        let success_rate = if success_rate.is_finite() {
            success_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            duration,
            success_rate,
        }
    }
}

#[async_trait]
impl JobRunner for SimulatedRunner {
    async fn run(&self, ctx: &JobContext, _payload: &[u8]) -> RunResult {
        tracing::info!(job_id = %ctx.job_id, resource = %ctx.resource_id, "Processing job");
        tokio::time::sleep(self.duration).await;

        let success = rand::thread_rng().gen_bool(self.success_rate);
        if success {
            Ok(format!(
                "Task {} completed successfully on {}",
                ctx.job_id, ctx.class
            ))
        } else {
            Err(format!("Task {} failed during processing", ctx.job_id))
        }
    }
}

/// Runs a shell command with the payload on stdin.
///
/// The job is described to the command through environment variables:
/// `BATCH_LB_JOB_ID`, `BATCH_LB_RESOURCE`, `BATCH_LB_VENDOR`,
/// `BATCH_LB_MODEL` and `BATCH_LB_VERSION`. Exit status 0 is success and
/// stdout becomes the result; otherwise stderr (or the exit code) does.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn spawn_and_wait(
        &self,
        ctx: &JobContext,
        payload: &[u8],
    ) -> std::io::Result<std::process::Output> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("BATCH_LB_JOB_ID", ctx.job_id.to_string())
            .env("BATCH_LB_RESOURCE", &ctx.resource_id)
            .env("BATCH_LB_VENDOR", &ctx.class.vendor)
            .env("BATCH_LB_MODEL", &ctx.class.model)
            .env("BATCH_LB_VERSION", &ctx.version)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while stdout and stderr are drained, otherwise a command
        // that echoes a large payload blocks on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(payload).await {
                // The command may exit without reading its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        output
    }

    fn process_output(ctx: &JobContext, result: std::io::Result<std::process::Output>) -> RunResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                tracing::info!(
                    job_id = %ctx.job_id,
                    exit_code = ?exit_code,
                    "Command finished"
                );

                if output.status.success() {
                    Ok(stdout)
                } else if stderr.is_empty() {
                    Err(format!("Exit code: {:?}", exit_code))
                } else {
                    Err(stderr)
                }
            }
            Err(e) => {
                tracing::error!(job_id = %ctx.job_id, error = %e, "Command execution failed");
                Err(format!("Error: {e}"))
            }
        }
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, ctx: &JobContext, payload: &[u8]) -> RunResult {
        tracing::info!(job_id = %ctx.job_id, resource = %ctx.resource_id, command = %self.command, "Executing job");
        let result = self.spawn_and_wait(ctx, payload).await;
        Self::process_output(ctx, result)
    }
}
