use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::payload::PayloadStore;
use crate::scheduler::job::{Job, JobStatus, JobUpdate, ResourceClass};

/// Version recorded for jobs rebuilt from the payload store.
pub const RECOVERED_VERSION: &str = "v1";

/// Owns job records and their payloads.
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    payloads: Arc<dyn PayloadStore>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").finish_non_exhaustive()
    }
}

impl JobStore {
    pub fn new(payloads: Arc<dyn PayloadStore>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            payloads,
        }
    }

    pub fn payloads(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    /// Persist the payload and record a new queued job.
    /// Nothing is recorded if the payload cannot be stored.
    pub async fn create(&self, version: &str, class: ResourceClass, payload: &[u8]) -> Result<Job> {
        let id = Uuid::new_v4();
        let payload_ref = self.payloads.put(&class, id, payload).await?;
        let job = Job::new(id, version.to_string(), class, payload_ref);

        self.jobs.write().await.insert(id, job.clone());
        tracing::info!(job_id = %id, class = %job.class, version, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Apply a partial update. Returns false (and logs) if the job no longer exists.
    pub async fn update(&self, id: &Uuid, update: JobUpdate) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) => {
                job.apply(update);
                true
            }
            None => {
                tracing::debug!(job_id = %id, "Update skipped, job not found");
                false
            }
        }
    }

    /// Remove a job and its payload. Unknown ids are ignored.
    pub async fn delete(&self, id: &Uuid) {
        let Some(job) = self.jobs.write().await.remove(id) else {
            tracing::debug!(job_id = %id, "Delete skipped, job not found");
            return;
        };

        if let Err(e) = self.payloads.remove(&job.payload_ref).await {
            tracing::warn!(job_id = %id, error = %e, "Failed to remove payload");
        }
        tracing::info!(job_id = %id, status = %job.status, "Job deleted");
    }

    /// Drop a record but keep its payload on disk for a later start.
    pub async fn forget(&self, id: &Uuid) -> Option<Job> {
        self.jobs.write().await.remove(id)
    }

    /// Rebuild queued jobs for stored payloads that have no record,
    /// oldest payload first. The caller is responsible for enqueueing them.
    pub async fn reconcile_from_payload_store(&self) -> Result<Vec<Job>> {
        let mut stored = self.payloads.scan().await?;
        stored.sort_by_key(|p| p.modified_at);

        let mut jobs = self.jobs.write().await;
        let mut recovered = Vec::new();
        for payload in stored {
            if jobs.contains_key(&payload.job_id) {
                continue;
            }
            let job = Job::with_enqueued_at(
                payload.job_id,
                RECOVERED_VERSION.to_string(),
                payload.class,
                payload.payload_ref,
                payload.modified_at,
            );
            tracing::info!(job_id = %job.id, class = %job.class, "Recovered job from payload store");
            jobs.insert(job.id, job.clone());
            recovered.push(job);
        }

        Ok(recovered)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Number of records with the given status.
    pub async fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::FsPayloadStore;

    fn c8k() -> ResourceClass {
        ResourceClass::new("cisco", "c8k")
    }

    fn store_in(dir: &std::path::Path) -> JobStore {
        JobStore::new(Arc::new(FsPayloadStore::new(dir)))
    }

    #[tokio::test]
    async fn create_persists_payload_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let job = store.create("v2", c8k(), b"cfg").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.version, "v2");

        let fetched = store.get(&job.id).await.unwrap();
        assert_eq!(fetched.payload_ref, job.payload_ref);
        assert_eq!(store.payloads().read(&job.payload_ref).await.unwrap(), b"cfg");
    }

    #[tokio::test]
    async fn update_missing_job_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.update(&Uuid::new_v4(), JobUpdate::running("m1")).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let job = store.create("v1", c8k(), b"cfg").await.unwrap();

        store.delete(&job.id).await;
        store.delete(&job.id).await;
        store.delete(&Uuid::new_v4()).await;

        assert!(store.get(&job.id).await.is_none());
        assert!(store.payloads().read(&job.payload_ref).await.is_err());
    }

    #[tokio::test]
    async fn reconcile_skips_known_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let known = store.create("v1", c8k(), b"known").await.unwrap();

        let orphan = Uuid::new_v4();
        store.payloads().put(&c8k(), orphan, b"orphan").await.unwrap();

        let recovered = store.reconcile_from_payload_store().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, orphan);
        assert_eq!(recovered[0].status, JobStatus::Queued);
        assert_eq!(recovered[0].version, RECOVERED_VERSION);
        assert!(store.get(&known.id).await.is_some());
        assert_eq!(store.count(JobStatus::Queued).await, 2);
    }
}
