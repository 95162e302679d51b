//! Test harness for service-level integration tests.
//!
//! Provides a runner whose jobs finish only when the test says so, plus
//! helpers for spinning up a [`BatchService`] over a temporary payload store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batch_lb::config::{parse_resources, SchedulerConfig};
use batch_lb::payload::FsPayloadStore;
use batch_lb::scheduler::{AllocationPolicy, Job, JobStatus, QueueMode, ResourceClass};
use batch_lb::service::BatchService;
use batch_lb::worker::{JobContext, JobRunner, RunResult};

/// A job the [`ManualRunner`] has been asked to run.
#[derive(Debug, Clone)]
pub struct StartedJob {
    pub job_id: Uuid,
    pub resource_id: String,
    pub payload: Vec<u8>,
}

/// Runner that parks every job until [`ManualRunner::finish`] is called.
pub struct ManualRunner {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<RunResult>>>,
    started_tx: mpsc::UnboundedSender<StartedJob>,
}

impl ManualRunner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StartedJob>) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            started_tx,
        });
        (runner, started_rx)
    }

    /// Release a parked job with the given outcome. Returns false if the job
    /// is not currently running.
    pub fn finish(&self, job_id: Uuid, result: RunResult) -> bool {
        let tx = self.pending.lock().unwrap().remove(&job_id);
        tx.map(|tx| tx.send(result).is_ok()).unwrap_or(false)
    }

    pub fn running(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait]
impl JobRunner for ManualRunner {
    async fn run(&self, ctx: &JobContext, payload: &[u8]) -> RunResult {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(ctx.job_id, tx);
        let _ = self.started_tx.send(StartedJob {
            job_id: ctx.job_id,
            resource_id: ctx.resource_id.clone(),
            payload: payload.to_vec(),
        });
        rx.await
            .unwrap_or_else(|_| Err("runner dropped".to_string()))
    }
}

/// A running service plus the handles tests need to drive it.
pub struct TestService {
    pub service: Arc<BatchService>,
    pub runner: Arc<ManualRunner>,
    pub started: mpsc::UnboundedReceiver<StartedJob>,
    pub shutdown: CancellationToken,
    pub dir: TempDir,
}

impl TestService {
    pub async fn new(resources: &str) -> Self {
        Self::with_options(resources, AllocationPolicy::FirstFree, QueueMode::PerClass).await
    }

    pub async fn with_options(resources: &str, policy: AllocationPolicy, mode: QueueMode) -> Self {
        let dir = TempDir::new().unwrap();
        let (service, runner, started, shutdown) =
            start_service_in(dir.path(), resources, policy, mode).await;
        Self {
            service,
            runner,
            started,
            shutdown,
            dir,
        }
    }

    /// Submit a small payload for `vendor/model`.
    pub async fn submit(&self, class: &str) -> batch_lb::service::Submission {
        let class: ResourceClass = class.parse().unwrap();
        self.service
            .submit("v1", class, b"hostname test\n")
            .await
            .unwrap()
    }

    /// Wait for the runner to pick up the next job.
    pub async fn next_started(&mut self) -> StartedJob {
        next_started(&mut self.started).await
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.service.store().get(&id).await
    }

    /// Wait until the job reaches `status` in the store.
    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> bool {
        let store = self.service.store().clone();
        wait_for(
            || {
                let store = store.clone();
                async move {
                    store
                        .get(&id)
                        .await
                        .map(|job| job.status == status)
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a service whose payloads live under `root`.
pub async fn start_service_in(
    root: &Path,
    resources: &str,
    policy: AllocationPolicy,
    mode: QueueMode,
) -> (
    Arc<BatchService>,
    Arc<ManualRunner>,
    mpsc::UnboundedReceiver<StartedJob>,
    CancellationToken,
) {
    let config = SchedulerConfig::new(parse_resources(resources).unwrap())
        .with_policy(policy)
        .with_queue_mode(mode);
    let (runner, started) = ManualRunner::new();
    let shutdown = CancellationToken::new();

    let service = BatchService::start(
        &config,
        Arc::new(FsPayloadStore::new(root)),
        runner.clone(),
        shutdown.clone(),
    )
    .await
    .unwrap();

    (Arc::new(service), runner, started, shutdown)
}

pub async fn next_started(rx: &mut mpsc::UnboundedReceiver<StartedJob>) -> StartedJob {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a job to start")
        .expect("runner channel closed")
}

/// Assert that no further job starts within a short window.
pub async fn assert_nothing_started(rx: &mut mpsc::UnboundedReceiver<StartedJob>) {
    let next = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(next.is_err(), "unexpected job start: {:?}", next);
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}
