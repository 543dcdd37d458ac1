//! Full job runs through the driver: selection, locking, engine wiring
//! and retention, against an in-memory object store.

use std::sync::Arc;

use object_store::memory::InMemory;
use tokio_util::sync::CancellationToken;

use vbk_api_types::{JobConfig, PathsConfig, RetentionPolicy, StoreConfig};
use vbk_datastore::Store;

use velbackuper::config::{Config, LockBackend, LockConfig};
use velbackuper::run::{list_backups, prune_jobs, run_jobs, JobSelection, RunContext};

fn files_job(name: &str, source: &std::path::Path) -> JobConfig {
    let mut job = JobConfig::new(name);
    job.paths = Some(PathsConfig {
        include: vec![source.to_string_lossy().into_owned()],
        exclude: Vec::new(),
        follow_symlinks: false,
    });
    job.retention = Some(RetentionPolicy::new(7, 0, 0));
    job
}

fn context(mode: &str, jobs: Vec<JobConfig>, lock_dir: &std::path::Path) -> RunContext {
    let config = Config {
        mode: mode.to_string(),
        s3: StoreConfig {
            endpoint: "http://unused.example".to_string(),
            bucket: "unused".to_string(),
            ..Default::default()
        },
        lock: LockConfig {
            backend: LockBackend::Local,
            dir: Some(lock_dir.to_string_lossy().into_owned()),
            ttl_minutes: 60,
        },
        jobs,
        notifications: None,
    };
    let cancel = CancellationToken::new();
    RunContext {
        config,
        store: Store::with_prefix(Arc::new(InMemory::new()), "")
            .with_cancellation(cancel.clone()),
        notifier: None,
        cancel,
        host: "testhost".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_job_run_and_list() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("f.txt"), b"payload").unwrap();
    let locks = tempfile::tempdir().unwrap();

    let ctx = context("archive", vec![files_job("web", source.path())], locks.path());

    run_jobs(&ctx, &JobSelection::One("web".to_string())).await.unwrap();

    let entries = list_backups(&ctx, Some("web")).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job, "web");
    assert_eq!(entries[0].id.len(), 14);
    assert!(entries[0].size > 0);

    // the run lock was released
    assert!(!locks.path().join("web.lock").exists());

    // nothing is younger than the 7 day horizon, prune removes nothing
    let outcomes = prune_jobs(&ctx, &JobSelection::All, false).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].deleted, 0);
    assert_eq!(outcomes[0].retained, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_job_reuses_chunks_across_runs() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("big.bin"), vec![b'x'; 1024 * 1024]).unwrap();
    let locks = tempfile::tempdir().unwrap();

    let ctx = context("incremental", vec![files_job("data", source.path())], locks.path());

    run_jobs(&ctx, &JobSelection::All).await.unwrap();
    let first_chunks = ctx.store.list("objects/", 0).await.unwrap();
    assert!(!first_chunks.is_empty());

    // identical source, two seconds apart for a distinct run timestamp
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    run_jobs(&ctx, &JobSelection::All).await.unwrap();

    let snapshots = ctx.store.list("snapshots/data/", 0).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    let indexes = ctx.store.list("indexes/data/", 0).await.unwrap();
    assert_eq!(indexes.len(), 2);

    // dedup across runs: the chunk set did not grow
    let second_chunks = ctx.store.list("objects/", 0).await.unwrap();
    assert_eq!(first_chunks, second_chunks);

    let entries = list_backups(&ctx, Some("data")).await.unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn selecting_disabled_or_unknown_job_fails() {
    let source = tempfile::tempdir().unwrap();
    let locks = tempfile::tempdir().unwrap();

    let mut job = files_job("off", source.path());
    job.enabled = false;
    let ctx = context("archive", vec![job], locks.path());

    assert!(run_jobs(&ctx, &JobSelection::One("off".to_string())).await.is_err());
    assert!(run_jobs(&ctx, &JobSelection::One("ghost".to_string())).await.is_err());
    // --all skips disabled jobs silently
    run_jobs(&ctx, &JobSelection::All).await.unwrap();
    assert!(ctx.store.list("", 0).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn held_lock_blocks_the_run() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("f.txt"), b"x").unwrap();
    let locks = tempfile::tempdir().unwrap();

    // a fresh foreign lockfile within TTL
    std::fs::write(locks.path().join("web.lock"), b"4242\n").unwrap();

    let ctx = context("archive", vec![files_job("web", source.path())], locks.path());
    assert!(run_jobs(&ctx, &JobSelection::One("web".to_string())).await.is_err());

    // no side effects: the store stayed empty
    assert!(ctx.store.list("", 0).await.unwrap().is_empty());
}
