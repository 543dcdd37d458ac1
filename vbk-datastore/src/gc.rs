//! Mark and sweep garbage collection for incremental mode.

use std::collections::HashSet;

use anyhow::Error;
use chrono::{DateTime, Utc};

use vbk_api_types::RetentionPolicy;

use crate::index::read_index;
use crate::keys;
use crate::snapshot::read_snapshot;
use crate::store::Store;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub deleted_snapshots: usize,
    pub deleted_indexes: usize,
    pub deleted_chunks: usize,
}

/// Expire old snapshots of `job`, then sweep unreferenced chunks.
///
/// `objects/` is a namespace shared by all jobs, so the mark phase reads
/// the surviving snapshots of *every* job before anything under `objects/`
/// is deleted. Expiry itself only applies to the target job; other jobs
/// prune their own snapshots.
pub async fn prune_incremental(
    store: &Store,
    job: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<GcStats, Error> {
    let mut stats = GcStats::default();

    let snapshot_keys = store.list(&format!("{}/", keys::SNAPSHOTS_PREFIX), 0).await?;

    let mut live_hashes = HashSet::new();

    for snapshot_key in &snapshot_keys {
        let ts = match keys::timestamp_from_record_key(snapshot_key) {
            Some(ts) => ts,
            None => continue,
        };
        let snapshot_job = keys::job_from_record_key(snapshot_key, keys::SNAPSHOTS_PREFIX);
        let expired =
            snapshot_job == Some(job) && policy.is_expired(ts.datetime(), now);

        let snapshot = read_snapshot(store, snapshot_key).await?;

        if expired {
            if !dry_run {
                store.delete(snapshot_key).await?;
            }
            stats.deleted_snapshots += 1;
            if !snapshot.index_key.is_empty() {
                if !dry_run {
                    store.delete(&snapshot.index_key).await?;
                }
                stats.deleted_indexes += 1;
            }
            log::info!("gc: removed expired snapshot {} of job '{}'", ts, job);
            continue;
        }

        if snapshot.index_key.is_empty() {
            continue;
        }
        let index = read_index(store, &snapshot.index_key).await?;
        for entry in &index.chunks {
            if !entry.hash.is_empty() {
                live_hashes.insert(entry.hash.clone());
            }
        }
    }

    let object_keys = store.list(&format!("{}/", keys::OBJECTS_PREFIX), 0).await?;
    for object_key in &object_keys {
        let hash = match keys::hash_from_chunk_key(object_key) {
            Some(hash) => hash,
            None => continue,
        };
        if live_hashes.contains(hash) {
            continue;
        }
        if !dry_run {
            store.delete(object_key).await?;
        }
        stats.deleted_chunks += 1;
    }

    if stats.deleted_chunks > 0 {
        log::info!(
            "gc: removed {} orphan chunks ({} live)",
            stats.deleted_chunks,
            live_hashes.len()
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{write_index, ChunkIndex, IndexEntry};
    use crate::snapshot::{write_snapshot, Snapshot};
    use bytes::Bytes;
    use chrono::TimeZone;
    use object_store::memory::InMemory;
    use std::sync::Arc;
    use vbk_api_types::BackupTimestamp;

    fn memory_store() -> Store {
        Store::with_prefix(Arc::new(InMemory::new()), "")
    }

    async fn seed_run(store: &Store, job: &str, ts_str: &str, hash: &str) {
        let ts: BackupTimestamp = ts_str.parse().unwrap();
        let index = ChunkIndex {
            job: job.to_string(),
            timestamp: ts,
            chunks: vec![IndexEntry { hash: hash.to_string(), size: 1 }],
        };
        write_index(store, &index).await.unwrap();
        write_snapshot(
            store,
            &Snapshot {
                job: job.to_string(),
                timestamp: ts,
                index_key: index.key(),
                files: Vec::new(),
            },
        )
        .await
        .unwrap();
        store
            .put(&keys::chunk_key(hash, 2), Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gc_removes_expired_and_orphans() {
        let store = memory_store();
        seed_run(&store, "job1", "20250101000000", "aaaa").await;
        seed_run(&store, "job1", "20250215000000", "bbbb").await;

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stats = prune_incremental(&store, "job1", &RetentionPolicy::new(30, 0, 0), now, false)
            .await
            .unwrap();

        assert_eq!(
            stats,
            GcStats { deleted_snapshots: 1, deleted_indexes: 1, deleted_chunks: 1 }
        );
        assert!(store.get_opt("snapshots/job1/20250101000000.json").await.unwrap().is_none());
        assert!(store.get_opt("indexes/job1/20250101000000.json").await.unwrap().is_none());
        assert!(store.get_opt("objects/aa/aaaa").await.unwrap().is_none());
        assert!(store.get_opt("objects/bb/bbbb").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gc_keeps_chunks_of_other_jobs() {
        let store = memory_store();
        // expired for job1's policy, but job2 still references "cccc"
        seed_run(&store, "job1", "20250215000000", "bbbb").await;
        seed_run(&store, "job2", "20250101000000", "cccc").await;

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stats = prune_incremental(&store, "job1", &RetentionPolicy::new(30, 0, 0), now, false)
            .await
            .unwrap();

        assert_eq!(stats.deleted_snapshots, 0);
        assert_eq!(stats.deleted_chunks, 0);
        assert!(store.get_opt("objects/cc/cccc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gc_survivors_keep_their_chunks() {
        let store = memory_store();
        seed_run(&store, "job1", "20250215000000", "bbbb").await;
        // orphan chunk nothing references
        store.put("objects/dd/dddd", Bytes::from_static(b"y")).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stats = prune_incremental(&store, "job1", &RetentionPolicy::new(30, 0, 0), now, false)
            .await
            .unwrap();

        assert_eq!(stats.deleted_chunks, 1);
        assert!(store.get_opt("objects/dd/dddd").await.unwrap().is_none());
        assert!(store.get_opt("objects/bb/bbbb").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gc_dry_run() {
        let store = memory_store();
        seed_run(&store, "job1", "20250101000000", "aaaa").await;

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let stats = prune_incremental(&store, "job1", &RetentionPolicy::new(30, 0, 0), now, true)
            .await
            .unwrap();

        assert_eq!(
            stats,
            GcStats { deleted_snapshots: 1, deleted_indexes: 1, deleted_chunks: 1 }
        );
        assert!(store.get_opt("snapshots/job1/20250101000000.json").await.unwrap().is_some());
        assert!(store.get_opt("objects/aa/aaaa").await.unwrap().is_some());
    }
}
