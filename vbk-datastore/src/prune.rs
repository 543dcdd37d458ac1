//! Time based retention for archive mode.

use std::collections::HashSet;

use anyhow::Error;
use chrono::{DateTime, Utc};

use vbk_api_types::RetentionPolicy;

use crate::keys;
use crate::manifest::{read_latest, read_manifest, write_latest};
use crate::store::Store;

/// Delete expired archive runs of `job` and fix up the latest pointer.
///
/// For every expired manifest the archive object is deleted before the
/// manifest, so an interrupted pass leaves a parseable manifest behind for
/// the next pass to retry. Returns the number of deleted runs.
pub async fn apply_retention(
    store: &Store,
    job: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<usize, Error> {
    if policy.retain_until(now).is_none() {
        return Ok(0);
    }

    let manifest_prefix = keys::manifests_prefix_for_job(job);
    let manifest_keys = store.list(&manifest_prefix, 0).await?;

    let mut deleted = 0;
    let mut deleted_archives = HashSet::new();

    for manifest_key in &manifest_keys {
        let ts = match keys::timestamp_from_record_key(manifest_key) {
            Some(ts) => ts,
            None => continue,
        };
        if !policy.is_expired(ts.datetime(), now) {
            continue;
        }

        let manifest = read_manifest(store, manifest_key).await?;
        if !manifest.key.is_empty() {
            if !dry_run {
                store.delete(&manifest.key).await?;
            }
            deleted_archives.insert(manifest.key.clone());
        }
        if !dry_run {
            store.delete(manifest_key).await?;
        }
        log::info!("retention: removed backup {} of job '{}'", ts, job);
        deleted += 1;
    }

    if dry_run {
        return Ok(deleted);
    }

    // Rewrite the latest pointer if it referenced a removed archive.
    let latest = match read_latest(store, job).await? {
        Some(pointer) if !pointer.key.is_empty() => pointer,
        _ => return Ok(deleted),
    };
    if !deleted_archives.contains(&latest.key) {
        return Ok(deleted);
    }

    let manifest_keys = store.list(&manifest_prefix, 0).await?;
    let mut newest = None;
    for manifest_key in &manifest_keys {
        let ts = match keys::timestamp_from_record_key(manifest_key) {
            Some(ts) => ts,
            None => continue,
        };
        match newest {
            Some((newest_ts, _)) if newest_ts >= ts => (),
            _ => newest = Some((ts, manifest_key)),
        }
    }

    match newest {
        Some((ts, manifest_key)) => {
            let manifest = read_manifest(store, manifest_key).await?;
            write_latest(store, job, ts, &manifest.key).await?;
        }
        None => {
            store.delete(&keys::latest_key(job)).await?;
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{write_manifest, ArchiveManifest};
    use bytes::Bytes;
    use chrono::TimeZone;
    use object_store::memory::InMemory;
    use std::sync::Arc;
    use vbk_api_types::{BackupTimestamp, CompressionFormat};

    fn memory_store() -> Store {
        Store::with_prefix(Arc::new(InMemory::new()), "")
    }

    async fn seed_backup(store: &Store, job: &str, ts_str: &str) -> String {
        let ts: BackupTimestamp = ts_str.parse().unwrap();
        let archive_key = keys::archive_key(job, "h", &ts, CompressionFormat::Gz);
        store.put(&archive_key, Bytes::from_static(b"archive-bytes")).await.unwrap();
        write_manifest(
            store,
            &ArchiveManifest {
                job: job.to_string(),
                timestamp: ts,
                key: archive_key.clone(),
                size: 13,
                host: "h".to_string(),
                format: CompressionFormat::Gz,
            },
        )
        .await
        .unwrap();
        archive_key
    }

    #[tokio::test]
    async fn test_deletes_expired_and_rewrites_latest() {
        let store = memory_store();
        let old_key = seed_backup(&store, "job1", "20250101000000").await;
        let new_key = seed_backup(&store, "job1", "20250215000000").await;

        // latest points at the *older* backup
        let old_ts: BackupTimestamp = "20250101000000".parse().unwrap();
        write_latest(&store, "job1", old_ts, &old_key).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let policy = RetentionPolicy::new(30, 0, 0);
        let deleted = apply_retention(&store, "job1", &policy, now, false).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get_opt(&old_key).await.unwrap().is_none());
        assert!(store.get_opt("manifests/job1/20250101000000.json").await.unwrap().is_none());
        assert!(store.get_opt(&new_key).await.unwrap().is_some());

        let latest = read_latest(&store, "job1").await.unwrap().unwrap();
        assert_eq!(latest.timestamp.to_string(), "20250215000000");
        assert_eq!(latest.key, new_key);
    }

    #[tokio::test]
    async fn test_deletes_latest_when_nothing_survives() {
        let store = memory_store();
        let key = seed_backup(&store, "job1", "20250101000000").await;
        let ts: BackupTimestamp = "20250101000000".parse().unwrap();
        write_latest(&store, "job1", ts, &key).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let deleted =
            apply_retention(&store, "job1", &RetentionPolicy::new(7, 0, 0), now, false)
                .await
                .unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get_opt(&key).await.unwrap().is_none());
        assert!(read_latest(&store, "job1").await.unwrap().is_none());
        assert!(store.list("manifests/job1/", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_policy_is_a_noop() {
        let store = memory_store();
        seed_backup(&store, "job1", "20200101000000").await;
        let now = Utc::now();
        let deleted =
            apply_retention(&store, "job1", &RetentionPolicy::default(), now, false)
                .await
                .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.list("manifests/job1/", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let store = memory_store();
        let key = seed_backup(&store, "job1", "20250101000000").await;

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let deleted =
            apply_retention(&store, "job1", &RetentionPolicy::new(7, 0, 0), now, true)
                .await
                .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_opt(&key).await.unwrap().is_some());
    }
}
