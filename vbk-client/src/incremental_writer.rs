use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Error};
use futures::stream::TryStream;
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use vbk_api_types::{BackupTimestamp, DEFAULT_CONCURRENCY};
use vbk_datastore::index::{write_index, ChunkIndex, IndexEntry};
use vbk_datastore::snapshot::{write_snapshot, FileEntry, Snapshot};
use vbk_datastore::{chunk_digest_hex, ChunkStore, FixedChunkStream, Store, UploadCounters};

#[derive(Clone, Debug, Default)]
pub struct IncrementalOptions {
    /// Clamped to [4, 16] MiB; zero/absent means the 4 MiB minimum.
    pub chunk_size_mb: Option<u64>,
    pub concurrency: Option<usize>,
    /// Fan-out width of the chunk namespace; zero means the default of 2.
    pub hash_prefix_len: usize,
}

#[derive(Clone, Debug)]
pub struct IncrementalStats {
    pub backup_id: BackupTimestamp,
    /// Entries in the index (stream order, duplicates included).
    pub chunk_count: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub stream_size: u64,
    pub duration: std::time::Duration,
}

/// One incremental run: chunk the stream, upload unseen chunks with
/// bounded concurrency, then write the index, then the snapshot.
///
/// A hash that repeats within the run is uploaded at most once and counts
/// neither as uploaded nor as skipped for its repeats; a hash the store
/// already has counts as skipped. The first upload error fails the run
/// before any metadata is written, leaving the fresh chunks as orphans
/// for the next garbage collection.
pub async fn run_incremental_backup<S>(
    store: &Store,
    input: S,
    job: &str,
    files: Vec<FileEntry>,
    options: &IncrementalOptions,
    cancel: &CancellationToken,
) -> Result<IncrementalStats, Error>
where
    S: TryStream + Unpin,
    S::Ok: AsRef<[u8]>,
    S::Error: Into<Error>,
{
    let start = Instant::now();
    let ts = BackupTimestamp::now();

    let chunk_size = options.chunk_size_mb.unwrap_or(0) as usize * 1024 * 1024;
    let concurrency = options.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);

    let chunk_store = ChunkStore::new(store.clone()).with_prefix_len(options.hash_prefix_len);
    let counters = UploadCounters::new();

    let entries = Arc::new(Mutex::new(Vec::new()));
    let known_chunks = Arc::new(Mutex::new(HashSet::new()));

    let entries2 = Arc::clone(&entries);
    let known_chunks2 = Arc::clone(&known_chunks);

    FixedChunkStream::new(input.into_stream(), chunk_size)
        .map(|chunk| chunk.map_err(Into::<Error>::into))
        .try_filter_map(move |chunk| {
            let data = chunk.freeze();
            let hash = chunk_digest_hex(&data);

            entries2
                .lock()
                .unwrap()
                .push(IndexEntry { hash: hash.clone(), size: data.len() as u64 });

            // hashes repeated within this run are uploaded once
            let first_sight = known_chunks2.lock().unwrap().insert(hash.clone());
            futures::future::ready(Ok(first_sight.then_some((hash, data))))
        })
        .map_ok(|(hash, data)| {
            let chunk_store = chunk_store.clone();
            let counters = Arc::clone(&counters);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    bail!("backup cancelled");
                }
                chunk_store.insert_chunk(&hash, data, &counters).await?;
                Ok(())
            }
        })
        .try_buffer_unordered(concurrency)
        .try_for_each(|()| futures::future::ready(Ok(())))
        .await?;

    if cancel.is_cancelled() {
        bail!("backup cancelled");
    }

    let entries = std::mem::take(&mut *entries.lock().unwrap());
    let chunk_count = entries.len();
    let stream_size = entries.iter().map(|entry| entry.size).sum();

    // all chunks exist now; the index must land before the snapshot
    let index = ChunkIndex { job: job.to_string(), timestamp: ts, chunks: entries };
    write_index(store, &index).await?;

    let snapshot =
        Snapshot { job: job.to_string(), timestamp: ts, index_key: index.key(), files };
    write_snapshot(store, &snapshot).await?;

    log::info!(
        "job '{}': incremental run {} - {} chunks ({} uploaded, {} skipped)",
        job,
        ts,
        chunk_count,
        counters.uploaded(),
        counters.skipped(),
    );

    Ok(IncrementalStats {
        backup_id: ts,
        chunk_count,
        uploaded: counters.uploaded(),
        skipped: counters.skipped(),
        stream_size,
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_store() -> Store {
        Store::with_prefix(Arc::new(InMemory::new()), "")
    }

    fn byte_stream(
        data: Vec<u8>,
    ) -> impl TryStream<Ok = Vec<u8>, Error = Error> + Unpin {
        futures::stream::iter(vec![Ok(data)])
    }

    #[tokio::test]
    async fn test_dedup_within_and_across_runs() {
        let store = memory_store();
        // 10 MiB of 'x' at 4 MiB chunks: two identical full chunks plus a
        // distinct 2 MiB tail -> two unique hashes
        let data = vec![b'x'; 10 * 1024 * 1024];

        let stats = run_incremental_backup(
            &store,
            byte_stream(data.clone()),
            "job1",
            Vec::new(),
            &IncrementalOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.stream_size, data.len() as u64);

        let index_keys = store.list("indexes/job1/", 0).await.unwrap();
        assert_eq!(index_keys.len(), 1);
        let index = vbk_datastore::index::read_index(&store, &index_keys[0]).await.unwrap();
        assert_eq!(index.chunks.len(), 3);
        assert_eq!(index.chunks[0].hash, index.chunks[1].hash);
        assert_ne!(index.chunks[0].hash, index.chunks[2].hash);

        let object_keys = store.list("objects/", 0).await.unwrap();
        assert_eq!(object_keys.len(), 2);

        // identical second run reuses every chunk
        let stats = run_incremental_backup(
            &store,
            byte_stream(data),
            "job1",
            Vec::new(),
            &IncrementalOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test]
    async fn test_empty_stream_writes_empty_index() {
        let store = memory_store();
        let stats = run_incremental_backup(
            &store,
            byte_stream(Vec::new()),
            "job1",
            Vec::new(),
            &IncrementalOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.uploaded, 0);

        let snapshot_keys = store.list("snapshots/job1/", 0).await.unwrap();
        assert_eq!(snapshot_keys.len(), 1);
        let snapshot =
            vbk_datastore::snapshot::read_snapshot(&store, &snapshot_keys[0]).await.unwrap();
        let index = vbk_datastore::index::read_index(&store, &snapshot.index_key).await.unwrap();
        assert!(index.chunks.is_empty());
        assert!(store.list("objects/", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_no_metadata() {
        let store = memory_store();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_incremental_backup(
            &store,
            byte_stream(vec![1u8; 1024]),
            "job1",
            Vec::new(),
            &IncrementalOptions::default(),
            &cancel,
        )
        .await;
        assert!(result.is_err());

        assert!(store.list("indexes/", 0).await.unwrap().is_empty());
        assert!(store.list("snapshots/", 0).await.unwrap().is_empty());
    }
}
