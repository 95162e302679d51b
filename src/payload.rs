//! Storage for job inputs.
//!
//! Payloads are written once when a job is created and read once by the
//! executor. The directory tree is the only state that survives a restart, so
//! it is also the source for recovering unfinished jobs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::scheduler::job::{PayloadRef, ResourceClass};

const PAYLOAD_EXT: &str = "txt";
const PARTIAL_EXT: &str = "tmp";

/// A payload found on disk by [`PayloadStore::scan`].
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub job_id: Uuid,
    pub class: ResourceClass,
    pub payload_ref: PayloadRef,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Persist a payload for a new job.
    async fn put(&self, class: &ResourceClass, job_id: Uuid, data: &[u8]) -> Result<PayloadRef>;

    async fn read(&self, payload_ref: &PayloadRef) -> Result<Vec<u8>>;

    /// Remove a payload. A missing payload is not an error.
    async fn remove(&self, payload_ref: &PayloadRef) -> Result<()>;

    /// List every stored payload.
    async fn scan(&self) -> Result<Vec<StoredPayload>>;
}

/// Payload store laid out as `{root}/{vendor}/{model}/{job_id}.txt`.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    root: PathBuf,
}

impl FsPayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path(class: &ResourceClass, job_id: Uuid) -> String {
        format!("{}/{}/{}.{}", class.vendor, class.model, job_id, PAYLOAD_EXT)
    }

    fn resolve(&self, payload_ref: &PayloadRef) -> PathBuf {
        self.root.join(&payload_ref.0)
    }

    async fn subdirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(BatchError::payload(path, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BatchError::payload(path, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| BatchError::payload(entry.path(), e))?;
            if file_type.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push((name.to_string(), entry.path()));
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, class: &ResourceClass, job_id: Uuid, data: &[u8]) -> Result<PayloadRef> {
        let payload_ref = PayloadRef(Self::relative_path(class, job_id));
        let path = self.resolve(&payload_ref);
        let dir = self.root.join(&class.vendor).join(&class.model);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BatchError::payload(&dir, e))?;

        // Recovery only picks up fully written payloads.
        let partial = path.with_extension(PARTIAL_EXT);
        tokio::fs::write(&partial, data)
            .await
            .map_err(|e| BatchError::payload(&partial, e))?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(BatchError::payload(&path, e));
        }

        tracing::debug!(job_id = %job_id, path = %path.display(), bytes = data.len(), "Payload stored");
        Ok(payload_ref)
    }

    async fn read(&self, payload_ref: &PayloadRef) -> Result<Vec<u8>> {
        let path = self.resolve(payload_ref);
        tokio::fs::read(&path)
            .await
            .map_err(|e| BatchError::payload(path, e))
    }

    async fn remove(&self, payload_ref: &PayloadRef) -> Result<()> {
        let path = self.resolve(payload_ref);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Payload already removed");
                Ok(())
            }
            Err(e) => Err(BatchError::payload(path, e)),
        }
    }

    async fn scan(&self) -> Result<Vec<StoredPayload>> {
        let mut found = Vec::new();

        for (vendor, vendor_dir) in Self::subdirs(&self.root).await? {
            for (model, model_dir) in Self::subdirs(&vendor_dir).await? {
                let class = ResourceClass::new(vendor.clone(), model);
                let mut entries = tokio::fs::read_dir(&model_dir)
                    .await
                    .map_err(|e| BatchError::payload(&model_dir, e))?;

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| BatchError::payload(&model_dir, e))?
                {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(PAYLOAD_EXT) {
                        continue;
                    }
                    let Some(job_id) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| Uuid::parse_str(s).ok())
                    else {
                        tracing::warn!(path = %path.display(), "Skipping payload with non-UUID name");
                        continue;
                    };

                    let modified_at = entry
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());

                    found.push(StoredPayload {
                        job_id,
                        payload_ref: PayloadRef(Self::relative_path(&class, job_id)),
                        class: class.clone(),
                        modified_at,
                    });
                }
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c8k() -> ResourceClass {
        ResourceClass::new("cisco", "c8k")
    }

    #[tokio::test]
    async fn put_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::new(dir.path());
        let id = Uuid::new_v4();

        let payload_ref = store.put(&c8k(), id, b"hostname r1\n").await.unwrap();
        assert_eq!(payload_ref.0, format!("cisco/c8k/{id}.txt"));
        assert!(dir.path().join("cisco/c8k").join(format!("{id}.txt")).exists());
        assert!(!dir.path().join("cisco/c8k").join(format!("{id}.tmp")).exists());

        let data = store.read(&payload_ref).await.unwrap();
        assert_eq!(data, b"hostname r1\n");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::new(dir.path());
        let payload_ref = store.put(&c8k(), Uuid::new_v4(), b"x").await.unwrap();

        store.remove(&payload_ref).await.unwrap();
        store.remove(&payload_ref).await.unwrap();
        assert!(store.read(&payload_ref).await.is_err());
    }

    #[tokio::test]
    async fn scan_finds_payloads_by_class() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::new(dir.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put(&c8k(), a, b"a").await.unwrap();
        store.put(&ResourceClass::new("hp", "5140"), b, b"b").await.unwrap();

        // noise that must be ignored
        std::fs::write(dir.path().join("cisco/c8k/notes.txt"), b"n").unwrap();
        std::fs::write(dir.path().join("cisco/c8k").join(format!("{}.tmp", Uuid::new_v4())), b"p")
            .unwrap();

        let mut found = store.scan().await.unwrap();
        found.sort_by_key(|p| p.class.clone());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].job_id, a);
        assert_eq!(found[0].class, c8k());
        assert_eq!(found[1].job_id, b);
        assert_eq!(found[1].class, ResourceClass::new("hp", "5140"));
    }

    #[tokio::test]
    async fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::new(dir.path().join("does-not-exist"));
        assert!(store.scan().await.unwrap().is_empty());
    }
}
