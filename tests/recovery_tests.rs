//! Rebuilding the queue from payloads left on disk.

mod test_harness;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use uuid::Uuid;

use batch_lb::payload::{FsPayloadStore, PayloadStore};
use batch_lb::scheduler::{AllocationPolicy, JobStatus, JobStore, QueueMode, ResourceClass};
use test_harness::{next_started, start_service_in, wait_for};

/// Write a payload file directly, as a previous run would have left it.
fn write_payload(root: &Path, class: &str, age: Duration) -> Uuid {
    let id = Uuid::new_v4();
    let dir = root.join(class);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{id}.txt"));
    std::fs::write(&path, format!("payload {id}")).unwrap();

    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
    id
}

#[tokio::test]
async fn test_reconcile_rebuilds_queued_jobs_oldest_first() {
    let dir = TempDir::new().unwrap();
    let newest = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(10));
    let oldest = write_payload(dir.path(), "cisco/n9k", Duration::from_secs(300));
    let middle = write_payload(dir.path(), "hp/5140", Duration::from_secs(60));

    let store = JobStore::new(Arc::new(FsPayloadStore::new(dir.path())));
    let recovered = store.reconcile_from_payload_store().await.unwrap();

    let ids: Vec<Uuid> = recovered.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![oldest, middle, newest]);
    for job in &recovered {
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.version, "v1");
        assert!(job.bound_resource.is_none());
    }
    assert_eq!(recovered[0].class, ResourceClass::new("cisco", "n9k"));
    assert_eq!(store.count(JobStatus::Queued).await, 3);

    // Known jobs are not recovered twice.
    assert!(store.reconcile_from_payload_store().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_ignores_foreign_files() {
    let dir = TempDir::new().unwrap();
    let model_dir = dir.path().join("cisco/c8k");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join("notes.txt"), "not a job").unwrap();
    std::fs::write(model_dir.join(format!("{}.tmp", Uuid::new_v4())), "partial").unwrap();
    std::fs::write(dir.path().join("stray.txt"), "top level").unwrap();
    let id = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(1));

    let store = JobStore::new(Arc::new(FsPayloadStore::new(dir.path())));
    let recovered = store.reconcile_from_payload_store().await.unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, id);
}

#[tokio::test]
async fn test_empty_store_recovers_nothing() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::new(Arc::new(FsPayloadStore::new(dir.path().join("missing"))));

    assert!(store.reconcile_from_payload_store().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_startup_requeues_leftover_payloads() {
    let dir = TempDir::new().unwrap();
    let first = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(120));
    let second = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(60));
    let third = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(30));

    let (service, runner, mut started, shutdown) = start_service_in(
        dir.path(),
        "cisco/c8k@m1",
        AllocationPolicy::FirstFree,
        QueueMode::PerClass,
    )
    .await;

    let job = next_started(&mut started).await;
    assert_eq!(job.job_id, first);
    assert_eq!(job.payload, format!("payload {first}").into_bytes());

    let snapshot = service.status().await.unwrap();
    assert_eq!(snapshot.running_count, 1);
    assert_eq!(snapshot.queued_count, 2);
    assert_eq!(snapshot.queue_position.get(&second), Some(&1));
    assert_eq!(snapshot.queue_position.get(&third), Some(&2));

    runner.finish(first, Ok(String::new()));
    assert_eq!(next_started(&mut started).await.job_id, second);

    shutdown.cancel();
}

#[tokio::test]
async fn test_restart_resumes_unread_jobs() {
    let dir = TempDir::new().unwrap();
    let resources = "cisco/c8k@m1";
    let class: ResourceClass = "cisco/c8k".parse().unwrap();

    let (service, runner, mut started, shutdown) = start_service_in(
        dir.path(),
        resources,
        AllocationPolicy::FirstFree,
        QueueMode::PerClass,
    )
    .await;

    let done = service.submit("v3", class.clone(), b"one").await.unwrap().job.id;
    let pending_a = service.submit("v3", class.clone(), b"two").await.unwrap().job.id;
    let pending_b = service.submit("v3", class.clone(), b"three").await.unwrap().job.id;

    assert_eq!(next_started(&mut started).await.job_id, done);
    runner.finish(done, Ok("ok".to_string()));
    assert_eq!(next_started(&mut started).await.job_id, pending_a);

    // Reading a finished job removes its payload, so it is not run again.
    let view = service.result(done).await.unwrap().unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);

    shutdown.cancel();
    drop(service);

    let (service, _runner, mut started, shutdown) = start_service_in(
        dir.path(),
        resources,
        AllocationPolicy::FirstFree,
        QueueMode::PerClass,
    )
    .await;

    let store = service.store().clone();
    assert!(
        wait_for(
            || {
                let store = store.clone();
                async move { store.len().await == 2 }
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    );
    assert!(store.get(&done).await.is_none());

    let restarted = next_started(&mut started).await;
    assert!(restarted.job_id == pending_a || restarted.job_id == pending_b);
    assert_eq!(store.get(&pending_a).await.unwrap().version, "v1");

    shutdown.cancel();
}

#[tokio::test]
async fn test_payloads_without_resources_stay_on_disk() {
    let dir = TempDir::new().unwrap();
    let orphan = write_payload(dir.path(), "juniper/mx", Duration::from_secs(5));
    let known = write_payload(dir.path(), "cisco/c8k", Duration::from_secs(5));

    let (service, _runner, mut started, shutdown) = start_service_in(
        dir.path(),
        "cisco/c8k@m1",
        AllocationPolicy::FirstFree,
        QueueMode::PerClass,
    )
    .await;

    assert_eq!(next_started(&mut started).await.job_id, known);
    assert!(service.store().get(&orphan).await.is_none());

    let payloads = FsPayloadStore::new(dir.path());
    let stored: Vec<Uuid> = payloads
        .scan()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.job_id)
        .collect();
    assert!(stored.contains(&orphan));

    shutdown.cancel();
}
