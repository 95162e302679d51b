use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::{Job, JobStatus, JobUpdate, ResourceClass};
use crate::scheduler::pool::ResourcePool;
use crate::scheduler::queue::{QueueEntry, WorkQueue};
use crate::scheduler::store::JobStore;
use crate::worker::executor::{Assignment, ExecutionResult, Executor};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How a queued job whose class is busy affects the jobs behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// A busy class only holds back later jobs of the same class.
    #[default]
    PerClass,
    /// The queue head blocks every job behind it.
    Strict,
}

/// Messages handled by the dispatcher loop
#[derive(Debug)]
pub enum DispatchMessage {
    /// Queue a freshly created (or recovered) job and try to start it
    Enqueue {
        job_id: Uuid,
        class: ResourceClass,
        response_tx: oneshot::Sender<Option<Placement>>,
    },
    /// A worker finished an assignment
    Completed(ExecutionResult),
    /// Read a job together with its queue position
    Inspect {
        job_id: Uuid,
        response_tx: oneshot::Sender<Option<JobView>>,
    },
    /// Pool and queue overview
    Snapshot {
        response_tx: oneshot::Sender<QueueSnapshot>,
    },
}

/// Where a job ended up right after it was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Running { resource_id: String },
    Queued { position: usize },
}

/// A job record plus its 1-indexed queue position while queued.
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued_count: usize,
    pub running_count: usize,
    pub machines: BTreeMap<String, Option<Uuid>>,
    pub queue_position: BTreeMap<Uuid, usize>,
}

/// Cloneable sender side of the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchMessage>,
}

impl DispatcherHandle {
    pub fn channel() -> (Self, mpsc::Receiver<DispatchMessage>) {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<DispatchMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DispatchMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| BatchError::DispatcherUnavailable)?;
        response_rx
            .await
            .map_err(|_| BatchError::DispatcherUnavailable)
    }

    pub async fn enqueue(&self, job_id: Uuid, class: ResourceClass) -> Result<Option<Placement>> {
        self.request(|response_tx| DispatchMessage::Enqueue {
            job_id,
            class,
            response_tx,
        })
        .await
    }

    pub async fn complete(&self, result: ExecutionResult) -> Result<()> {
        self.tx
            .send(DispatchMessage::Completed(result))
            .await
            .map_err(|_| BatchError::DispatcherUnavailable)
    }

    pub async fn inspect(&self, job_id: Uuid) -> Result<Option<JobView>> {
        self.request(|response_tx| DispatchMessage::Inspect {
            job_id,
            response_tx,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(|response_tx| DispatchMessage::Snapshot { response_tx })
            .await
    }
}

enum DispatchOutcome {
    Started,
    Skipped,
    Stalled,
}

/// Single owner of the work queue and the resource pool.
///
/// Every mutation of queue order and lease state happens inside [`Dispatcher::run`],
/// one message at a time, so allocate/release/validate sequences are atomic.
#[derive(Debug)]
pub struct Dispatcher {
    pool: ResourcePool,
    queue: WorkQueue,
    mode: QueueMode,
    store: Arc<JobStore>,
    executor: Executor,
}

impl Dispatcher {
    pub fn new(pool: ResourcePool, mode: QueueMode, store: Arc<JobStore>, executor: Executor) -> Self {
        Self {
            pool,
            queue: WorkQueue::new(),
            mode,
            store,
            executor,
        }
    }

    /// Process messages until the channel closes or shutdown is requested.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DispatchMessage>, shutdown: CancellationToken) {
        tracing::info!(
            mode = ?self.mode,
            policy = ?self.pool.policy(),
            resources = self.pool.len(),
            "Dispatcher started"
        );
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::info!(queued = self.queue.len(), "Dispatcher stopped");
    }

    pub async fn handle(&mut self, msg: DispatchMessage) {
        match msg {
            DispatchMessage::Enqueue {
                job_id,
                class,
                response_tx,
            } => {
                let placement = self.enqueue(job_id, class).await;
                let _ = response_tx.send(placement);
            }
            DispatchMessage::Completed(result) => self.complete(result).await,
            DispatchMessage::Inspect {
                job_id,
                response_tx,
            } => {
                let view = self.inspect(&job_id).await;
                let _ = response_tx.send(view);
            }
            DispatchMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot());
            }
        }
    }

    async fn enqueue(&mut self, job_id: Uuid, class: ResourceClass) -> Option<Placement> {
        if !self.pool.has_class(&class) {
            tracing::error!(job_id = %job_id, class = %class, "No resources of this class, job not queued");
            return None;
        }
        match self.store.get(&job_id).await {
            Some(job) if job.status == JobStatus::Queued => {}
            Some(job) => {
                tracing::warn!(job_id = %job_id, status = %job.status, "Refusing to enqueue job that is not queued");
                return None;
            }
            None => {
                tracing::warn!(job_id = %job_id, "Refusing to enqueue unknown job");
                return None;
            }
        }

        if !self.queue.enqueue(job_id, class) {
            tracing::debug!(job_id = %job_id, "Job already queued");
        } else {
            tracing::info!(job_id = %job_id, queued = self.queue.len(), "Job enqueued");
        }

        self.try_advance().await;

        if let Some(position) = self.queue.position(&job_id) {
            return Some(Placement::Queued { position });
        }
        self.store
            .get(&job_id)
            .await
            .and_then(|job| job.bound_resource)
            .map(|resource_id| Placement::Running { resource_id })
    }

    /// Start queued jobs until no further allocation succeeds.
    /// Returns the number of jobs handed to the executor.
    pub async fn try_advance(&mut self) -> usize {
        let mut started = 0;
        let mut blocked: HashSet<ResourceClass> = HashSet::new();
        let mut index = 0;

        while let Some(entry) = self.queue.get(index).cloned() {
            if blocked.contains(&entry.class) {
                index += 1;
                continue;
            }

            let Some(resource_id) = self.pool.allocate(entry.job_id, &entry.class) else {
                if self.mode == QueueMode::Strict {
                    break;
                }
                blocked.insert(entry.class);
                index += 1;
                continue;
            };

            self.queue.remove(index);
            match self.dispatch(entry, resource_id).await {
                DispatchOutcome::Started => started += 1,
                DispatchOutcome::Skipped => {}
                DispatchOutcome::Stalled => break,
            }
        }

        if started > 0 {
            tracing::debug!(started, queued = self.queue.len(), "Queue advanced");
        }
        started
    }

    async fn dispatch(&mut self, entry: QueueEntry, resource_id: String) -> DispatchOutcome {
        let job_id = entry.job_id;
        let Some(job) = self.store.get(&job_id).await else {
            tracing::warn!(job_id = %job_id, "Queued job vanished before dispatch");
            self.pool.release(&resource_id);
            return DispatchOutcome::Skipped;
        };
        if !self.store.update(&job_id, JobUpdate::running(&resource_id)).await {
            self.pool.release(&resource_id);
            return DispatchOutcome::Skipped;
        }

        let assignment = Assignment {
            job_id,
            version: job.version,
            class: job.class,
            resource_id: resource_id.clone(),
            payload_ref: job.payload_ref,
        };

        if self.executor.start(assignment).is_err() {
            self.pool.release(&resource_id);
            self.store.update(&job_id, JobUpdate::requeued()).await;
            self.queue.push_front(entry);
            return DispatchOutcome::Stalled;
        }

        tracing::info!(job_id = %job_id, resource = %resource_id, "Job started");
        DispatchOutcome::Started
    }

    /// Apply a completion at most once per job and lease.
    async fn complete(&mut self, result: ExecutionResult) {
        let job_id = result.job_id;
        let resource_id = result.resource_id.as_str();

        let Some(job) = self.store.get(&job_id).await else {
            tracing::warn!(job_id = %job_id, resource = %resource_id, "Completion for unknown job dropped");
            return;
        };
        if job.status != JobStatus::Running || job.bound_resource.as_deref() != Some(resource_id) {
            tracing::warn!(
                job_id = %job_id,
                resource = %resource_id,
                status = %job.status,
                bound = ?job.bound_resource,
                "Duplicate or stale completion dropped"
            );
            return;
        }
        if !self.pool.validate_ownership(job_id, resource_id) {
            tracing::warn!(
                job_id = %job_id,
                resource = %resource_id,
                "Resource is not leased to this job, completion dropped"
            );
            return;
        }

        self.pool.release(resource_id);
        let status = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.store
            .update(&job_id, JobUpdate::finished(result.success, result.result_data))
            .await;
        tracing::info!(job_id = %job_id, status = %status, "Job finished");

        self.try_advance().await;
    }

    async fn inspect(&self, job_id: &Uuid) -> Option<JobView> {
        let job = self.store.get(job_id).await?;
        let position = self.queue.position(job_id);
        Some(JobView { job, position })
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued_count: self.queue.len(),
            running_count: self.pool.running_count(),
            machines: self.pool.status(),
            queue_position: self.queue.positions().collect(),
        }
    }
}
