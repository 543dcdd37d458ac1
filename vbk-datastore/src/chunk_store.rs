use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;

use crate::chunker::chunk_digest_hex;
use crate::keys;
use crate::store::Store;
use crate::DEFAULT_HASH_PREFIX_LEN;

/// Upload accounting shared between the parallel chunk uploaders.
#[derive(Default)]
pub struct UploadCounters {
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
    uploaded_bytes: AtomicU64,
}

impl UploadCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }
}

/// Content addressed chunk namespace (`objects/`) on an object store.
///
/// Chunks are immutable: an insert for an existing digest never rewrites
/// the object, it only counts as skipped.
#[derive(Clone)]
pub struct ChunkStore {
    store: Store,
    prefix_len: usize,
}

impl ChunkStore {
    pub fn new(store: Store) -> Self {
        Self { store, prefix_len: DEFAULT_HASH_PREFIX_LEN }
    }

    pub fn with_prefix_len(mut self, prefix_len: usize) -> Self {
        self.prefix_len = if prefix_len == 0 { DEFAULT_HASH_PREFIX_LEN } else { prefix_len };
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn chunk_key(&self, hash: &str) -> String {
        keys::chunk_key(hash, self.prefix_len)
    }

    pub async fn chunk_exists(&self, hash: &str) -> Result<bool, Error> {
        Ok(self.store.head(&self.chunk_key(hash)).await?.is_some())
    }

    /// Upload a chunk unless the store already has it. Returns whether the
    /// chunk was actually uploaded (`false` means skipped as duplicate).
    pub async fn insert_chunk(
        &self,
        hash: &str,
        data: Bytes,
        counters: &UploadCounters,
    ) -> Result<bool, Error> {
        let key = self.chunk_key(hash);

        if self.store.head(&key).await?.is_some() {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            log::debug!("chunk {} already present, skipping upload", hash);
            return Ok(false);
        }

        let len = data.len() as u64;
        self.store
            .put(&key, data)
            .await
            .map_err(|err| format_err!("inserting chunk {} failed - {}", hash, err))?;

        counters.uploaded.fetch_add(1, Ordering::SeqCst);
        counters.uploaded_bytes.fetch_add(len, Ordering::SeqCst);
        Ok(true)
    }

    /// Fetch a chunk by digest, optionally verifying the bytes against it.
    pub async fn fetch_chunk(&self, hash: &str, verify: bool) -> Result<Bytes, Error> {
        let key = self.chunk_key(hash);
        let data = self.store.get(&key).await?;
        if verify {
            let got = chunk_digest_hex(&data);
            if got != hash {
                bail!("chunk digest mismatch for '{}': got {}", key, got);
            }
        }
        Ok(data)
    }
}
