use anyhow::{format_err, Context, Error};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use vbk_api_types::{BackupTimestamp, CompressionFormat};

use crate::keys;
use crate::store::Store;

/// Per-run record of archive mode, naming the uploaded archive object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub job: String,
    pub timestamp: BackupTimestamp,
    /// Key of the archive object this manifest describes.
    pub key: String,
    pub size: u64,
    pub host: String,
    pub format: CompressionFormat,
}

/// Per-job pointer to the newest archive run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LatestPointer {
    pub timestamp: BackupTimestamp,
    pub key: String,
}

pub async fn write_manifest(store: &Store, manifest: &ArchiveManifest) -> Result<(), Error> {
    let key = keys::manifest_key(&manifest.job, &manifest.timestamp);
    let body = serde_json::to_vec(manifest).context("manifest encode failed")?;
    store.put(&key, Bytes::from(body)).await
}

pub async fn read_manifest(store: &Store, manifest_key: &str) -> Result<ArchiveManifest, Error> {
    let data = store.get(manifest_key).await?;
    serde_json::from_slice(&data)
        .map_err(|err| format_err!("unable to parse manifest '{}' - {}", manifest_key, err))
}

pub async fn write_latest(
    store: &Store,
    job: &str,
    timestamp: BackupTimestamp,
    archive_key: &str,
) -> Result<(), Error> {
    let pointer = LatestPointer { timestamp, key: archive_key.to_string() };
    let body = serde_json::to_vec(&pointer).context("latest pointer encode failed")?;
    store.put(&keys::latest_key(job), Bytes::from(body)).await
}

/// `None` when the job has no latest pointer (no archive run yet, or all
/// backups pruned).
pub async fn read_latest(store: &Store, job: &str) -> Result<Option<LatestPointer>, Error> {
    let key = keys::latest_key(job);
    let data = match store.get_opt(&key).await? {
        Some(data) => data,
        None => return Ok(None),
    };
    let pointer = serde_json::from_slice(&data)
        .map_err(|err| format_err!("unable to parse latest pointer '{}' - {}", key, err))?;
    Ok(Some(pointer))
}
