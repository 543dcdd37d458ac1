use anyhow::{format_err, Context, Error};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use vbk_api_types::BackupTimestamp;

use crate::keys;
use crate::store::Store;

/// One chunk of the backed up stream, in stream order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Lowercase hex BLAKE3-256 digest of the chunk bytes.
    pub hash: String,
    pub size: u64,
}

/// Ordered chunk list of one incremental run. Concatenating the chunks in
/// order yields the original stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkIndex {
    pub job: String,
    pub timestamp: BackupTimestamp,
    pub chunks: Vec<IndexEntry>,
}

impl ChunkIndex {
    pub fn key(&self) -> String {
        keys::index_key(&self.job, &self.timestamp)
    }
}

pub async fn write_index(store: &Store, index: &ChunkIndex) -> Result<(), Error> {
    let body = serde_json::to_vec(index).context("index encode failed")?;
    store.put(&index.key(), Bytes::from(body)).await
}

pub async fn read_index(store: &Store, index_key: &str) -> Result<ChunkIndex, Error> {
    let data = store.get(index_key).await?;
    serde_json::from_slice(&data)
        .map_err(|err| format_err!("unable to parse index '{}' - {}", index_key, err))
}
