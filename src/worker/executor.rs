use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::payload::PayloadStore;
use crate::scheduler::dispatcher::DispatcherHandle;
use crate::scheduler::job::{PayloadRef, ResourceClass};
use crate::worker::runner::{JobContext, JobRunner};

/// A job bound to a leased resource, ready to run.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: Uuid,
    pub version: String,
    pub class: ResourceClass,
    pub resource_id: String,
    pub payload_ref: PayloadRef,
}

/// Outcome of one assignment, reported back to the dispatcher.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub resource_id: String,
    pub success: bool,
    pub result_data: String,
}

/// Bounded pool of worker tasks.
///
/// `start` only enqueues the assignment; it never waits for execution.
#[derive(Debug, Clone)]
pub struct Executor {
    tx: mpsc::Sender<Assignment>,
}

impl Executor {
    /// Spawn `workers` worker tasks. `capacity` bounds the number of
    /// assignments waiting for a free worker.
    pub fn spawn(
        workers: usize,
        capacity: usize,
        runner: Arc<dyn JobRunner>,
        payloads: Arc<dyn PayloadStore>,
        completions: DispatcherHandle,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    rx.clone(),
                    runner.clone(),
                    payloads.clone(),
                    completions.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = workers.max(1), capacity, "Executor started");
        (Self { tx }, handles)
    }

    /// Hand an assignment to the worker pool without blocking.
    pub fn start(&self, assignment: Assignment) -> Result<()> {
        let job_id = assignment.job_id;
        self.tx.try_send(assignment).map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Executor rejected assignment");
            BatchError::ExecutorUnavailable
        })
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Assignment>>>,
    runner: Arc<dyn JobRunner>,
    payloads: Arc<dyn PayloadStore>,
    completions: DispatcherHandle,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");

    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                assignment = rx.recv() => assignment,
                _ = shutdown.cancelled() => None,
            }
        };
        let Some(assignment) = next else {
            break;
        };

        let result = execute(assignment, &runner, &payloads).await;
        let job_id = result.job_id;
        if completions.complete(result).await.is_err() {
            tracing::warn!(worker_id, job_id = %job_id, "Dispatcher gone, dropping completion");
            break;
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
}

/// Run one assignment to an [`ExecutionResult`].
///
/// Payload read errors and runner panics are reported as failures, so every
/// assignment produces exactly one result.
pub async fn execute(
    assignment: Assignment,
    runner: &Arc<dyn JobRunner>,
    payloads: &Arc<dyn PayloadStore>,
) -> ExecutionResult {
    let ctx = JobContext {
        job_id: assignment.job_id,
        version: assignment.version,
        class: assignment.class,
        resource_id: assignment.resource_id.clone(),
    };

    let outcome = match payloads.read(&assignment.payload_ref).await {
        Ok(payload) => {
            let runner = runner.clone();
            let run_ctx = ctx.clone();
            match tokio::spawn(async move { runner.run(&run_ctx, &payload).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(job_id = %ctx.job_id, error = %e, "Runner aborted");
                    Err(format!("Error: {e}"))
                }
            }
        }
        Err(e) => {
            tracing::error!(job_id = %ctx.job_id, error = %e, "Failed to read payload");
            Err(format!("Error: {e}"))
        }
    };

    let (success, result_data) = match outcome {
        Ok(data) => (true, data),
        Err(data) => (false, data),
    };
    tracing::info!(
        job_id = %ctx.job_id,
        resource = %ctx.resource_id,
        success,
        "Job finished"
    );

    ExecutionResult {
        job_id: ctx.job_id,
        resource_id: assignment.resource_id,
        success,
        result_data,
    }
}
