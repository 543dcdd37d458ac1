use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Error};
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use vbk_api_types::{BackupTimestamp, CompressionFormat};
use vbk_datastore::manifest::{write_latest, write_manifest, ArchiveManifest};
use vbk_datastore::{keys, Store, MIN_PART_SIZE};

use crate::backup_stream::CollectorStream;
use crate::collector::Collector;
use crate::compression::StreamCompression;

#[derive(Clone, Debug, Default)]
pub struct ArchiveOptions {
    pub format: CompressionFormat,
    pub compression_level: Option<u32>,
    pub part_size_mb: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ArchiveStats {
    /// The run timestamp, which doubles as the backup id.
    pub backup_id: BackupTimestamp,
    pub archive_key: String,
    pub size: u64,
    pub duration: std::time::Duration,
}

/// Stream an already compressed reader into the archive object for
/// `(job, ts)`. Returns the archive key and uploaded byte count.
pub async fn upload_archive(
    store: &Store,
    job: &str,
    host: &str,
    format: CompressionFormat,
    reader: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
    part_size_mb: Option<u64>,
    ts: &BackupTimestamp,
) -> Result<(String, u64), Error> {
    let archive_key = keys::archive_key(job, host, ts, format);
    let part_size = (part_size_mb.unwrap_or(0) as usize * 1024 * 1024).max(MIN_PART_SIZE);

    let size = store.upload_multipart(&archive_key, reader, part_size).await?;
    Ok((archive_key, size))
}

/// One archive mode run: collector -> compressor -> multipart upload,
/// then manifest, then latest pointer. Each write only happens after
/// everything before it succeeded, so a failed run leaves no terminal
/// metadata behind.
pub async fn run_archive_backup(
    store: &Store,
    collector: Arc<dyn Collector>,
    job: &str,
    host: &str,
    options: &ArchiveOptions,
    cancel: &CancellationToken,
) -> Result<ArchiveStats, Error> {
    let start = Instant::now();
    let ts = BackupTimestamp::now();

    let compression = StreamCompression::for_format(options.format, options.compression_level);
    let stream = CollectorStream::new(collector, job, compression, cancel)
        .map(|item| item.map(Bytes::from).map_err(std::io::Error::other));
    let mut reader = StreamReader::new(stream);

    let (archive_key, size) = upload_archive(
        store,
        job,
        host,
        options.format,
        &mut reader,
        options.part_size_mb,
        &ts,
    )
    .await?;

    if cancel.is_cancelled() {
        bail!("backup cancelled");
    }

    let manifest = ArchiveManifest {
        job: job.to_string(),
        timestamp: ts,
        key: archive_key.clone(),
        size,
        host: host.to_string(),
        format: options.format,
    };
    write_manifest(store, &manifest).await?;
    write_latest(store, job, ts, &archive_key).await?;

    log::info!(
        "job '{}': archived {} bytes as {} in {:.2}s",
        job,
        size,
        archive_key,
        start.elapsed().as_secs_f64()
    );

    Ok(ArchiveStats { backup_id: ts, archive_key, size, duration: start.elapsed() })
}
