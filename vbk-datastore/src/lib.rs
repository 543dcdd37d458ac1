//! Object store data layout and access for VelBackuper.
//!
//! Everything a backup run persists lives under a configured key prefix:
//!
//! ```text
//! archives/<job>/YYYY/MM/DD/backup-<host>-<ts>{.tar|.tar.gz|.tar.zst}
//! manifests/<job>/<ts>.json
//! latest/<job>.json
//! snapshots/<job>/<ts>.json
//! indexes/<job>/<ts>.json
//! objects/<hash[0:2]>/<hash>
//! locks/<name>.lock
//! ```
//!
//! Archive mode owns `archives/`, `manifests/` and `latest/`; incremental
//! mode owns `snapshots/`, `indexes/` and the content addressed chunks
//! under `objects/`. Chunks are immutable, identified by their BLAKE3-256
//! digest, shared between any number of indexes, and only ever removed by
//! the mark and sweep pass in [gc].

pub mod chunk_store;
pub mod chunker;
pub mod gc;
pub mod index;
pub mod keys;
pub mod manifest;
pub mod prune;
pub mod snapshot;
pub mod store;

pub use chunk_store::{ChunkStore, UploadCounters};
pub use chunker::{chunk_digest_hex, clamp_chunk_size, FixedChunkStream};
pub use index::{ChunkIndex, IndexEntry};
pub use manifest::{ArchiveManifest, LatestPointer};
pub use snapshot::{FileChunk, FileEntry, Snapshot};
pub use store::Store;

/// Minimal multipart part size accepted by S3 compatible backends.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub const CHUNK_SIZE_MIN: usize = 4 * 1024 * 1024;
pub const CHUNK_SIZE_MAX: usize = 16 * 1024 * 1024;

/// Fan-out width of the chunk namespace (hex digits).
pub const DEFAULT_HASH_PREFIX_LEN: usize = 2;
