use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{BatchError, Result};
use crate::payload::PayloadStore;
use crate::scheduler::{
    Dispatcher, DispatcherHandle, Job, JobStore, JobView, Placement, QueueSnapshot, ResourceClass,
    ResourcePool,
};
use crate::worker::{Executor, JobRunner};

/// A job accepted by [`BatchService::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    pub placement: Placement,
}

/// Wires the job store, resource pool, dispatcher and executor together.
pub struct BatchService {
    store: Arc<JobStore>,
    dispatcher: DispatcherHandle,
    classes: BTreeSet<ResourceClass>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchService")
            .field("classes", &self.classes)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl BatchService {
    /// Start the dispatcher and the executor workers, then re-queue any
    /// payloads left over from a previous run.
    ///
    /// # Errors
    ///
    /// Fails if the inventory is invalid or the payload store cannot be scanned.
    pub async fn start(
        config: &SchedulerConfig,
        payloads: Arc<dyn PayloadStore>,
        runner: Arc<dyn JobRunner>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let pool = ResourcePool::new(&config.resources, config.policy)?;
        let store = Arc::new(JobStore::new(payloads.clone()));
        let (dispatcher, dispatch_rx) = DispatcherHandle::channel();

        let (executor, mut tasks) = Executor::spawn(
            config.worker_count(),
            pool.len(),
            runner,
            payloads,
            dispatcher.clone(),
            shutdown.clone(),
        );

        let core = Dispatcher::new(pool, config.queue_mode, store.clone(), executor);
        tasks.push(tokio::spawn(core.run(dispatch_rx, shutdown)));

        let service = Self {
            store,
            dispatcher,
            classes: config.classes(),
            tasks,
        };
        service.recover().await?;
        Ok(service)
    }

    async fn recover(&self) -> Result<usize> {
        let recovered = self.store.reconcile_from_payload_store().await?;
        let mut requeued = 0;

        for job in recovered {
            if !self.classes.contains(&job.class) {
                tracing::warn!(
                    job_id = %job.id,
                    class = %job.class,
                    "Recovered job has no matching resources, leaving payload on disk"
                );
                self.store.forget(&job.id).await;
                continue;
            }
            if self.dispatcher.enqueue(job.id, job.class).await?.is_some() {
                requeued += 1;
            }
        }

        if requeued > 0 {
            tracing::info!(count = requeued, "Reloaded unprocessed jobs from payload store");
        }
        Ok(requeued)
    }

    pub fn classes(&self) -> &BTreeSet<ResourceClass> {
        &self.classes
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Create a job, queue it, and start it if a resource is free.
    pub async fn submit(&self, version: &str, class: ResourceClass, payload: &[u8]) -> Result<Submission> {
        if !self.classes.contains(&class) {
            return Err(BatchError::UnknownResourceClass(class.to_string()));
        }

        let job = self.store.create(version, class.clone(), payload).await?;
        match self.dispatcher.enqueue(job.id, class).await {
            Ok(Some(placement)) => Ok(Submission { job, placement }),
            Ok(None) => {
                self.store.delete(&job.id).await;
                Err(BatchError::DispatcherUnavailable)
            }
            Err(e) => {
                self.store.delete(&job.id).await;
                Err(e)
            }
        }
    }

    /// Look up a job. A job in a terminal state is deleted once it has been read.
    pub async fn result(&self, id: Uuid) -> Result<Option<JobView>> {
        let Some(view) = self.dispatcher.inspect(id).await? else {
            return Ok(None);
        };
        if view.job.status.is_terminal() {
            self.store.delete(&id).await;
        }
        Ok(Some(view))
    }

    pub async fn status(&self) -> Result<QueueSnapshot> {
        self.dispatcher.snapshot().await
    }
}

impl Drop for BatchService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
