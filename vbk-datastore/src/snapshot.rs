use anyhow::{format_err, Context, Error};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vbk_api_types::BackupTimestamp;

use crate::keys;
use crate::store::Store;

/// A slice of one chunk that belongs to a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub hash: String,
    pub offset: i64,
    pub length: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub chunks: Vec<FileChunk>,
}

/// Per-run record of incremental mode, naming the run's index and an
/// optional file table for per-file restore. Without a file table the run
/// restores as one concatenated stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub job: String,
    pub timestamp: BackupTimestamp,
    pub index_key: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl Snapshot {
    pub fn key(&self) -> String {
        keys::snapshot_key(&self.job, &self.timestamp)
    }
}

pub async fn write_snapshot(store: &Store, snapshot: &Snapshot) -> Result<(), Error> {
    let body = serde_json::to_vec(snapshot).context("snapshot encode failed")?;
    store.put(&snapshot.key(), Bytes::from(body)).await
}

pub async fn read_snapshot(store: &Store, snapshot_key: &str) -> Result<Snapshot, Error> {
    let data = store.get(snapshot_key).await?;
    serde_json::from_slice(&data)
        .map_err(|err| format_err!("unable to parse snapshot '{}' - {}", snapshot_key, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_table_is_empty() {
        let json = r#"{"job":"j","timestamp":"20250101000000","index_key":"indexes/j/20250101000000.json"}"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.files.is_empty());
        assert_eq!(snapshot.key(), "snapshots/j/20250101000000.json");
    }
}
