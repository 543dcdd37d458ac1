//! Key layout of the object store namespace. Pure functions only.

use vbk_api_types::{sanitize_filename, BackupTimestamp, CompressionFormat};

use crate::DEFAULT_HASH_PREFIX_LEN;

pub const ARCHIVES_PREFIX: &str = "archives";
pub const MANIFESTS_PREFIX: &str = "manifests";
pub const LATEST_PREFIX: &str = "latest";
pub const OBJECTS_PREFIX: &str = "objects";
pub const SNAPSHOTS_PREFIX: &str = "snapshots";
pub const INDEXES_PREFIX: &str = "indexes";
pub const LOCKS_PREFIX: &str = "locks";

/// `archives/<job>/<yyyy>/<mm>/<dd>/backup-<host>-<ts><ext>`
pub fn archive_key(
    job: &str,
    host: &str,
    ts: &BackupTimestamp,
    format: CompressionFormat,
) -> String {
    let dt = ts.datetime();
    format!(
        "{}/{}/{}/backup-{}-{}{}",
        ARCHIVES_PREFIX,
        job,
        dt.format("%Y/%m/%d"),
        sanitize_filename(host),
        ts,
        format.extension(),
    )
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedArchiveKey<'a> {
    pub job: &'a str,
    pub year: &'a str,
    pub month: &'a str,
    pub day: &'a str,
    pub filename: &'a str,
}

pub fn parse_archive_key(key: &str) -> Option<ParsedArchiveKey> {
    let key = key.trim_matches('/');
    let mut parts = key.splitn(6, '/');
    let prefix = parts.next()?;
    if prefix != ARCHIVES_PREFIX {
        return None;
    }
    let job = parts.next()?;
    let year = parts.next()?;
    let month = parts.next()?;
    let day = parts.next()?;
    let filename = parts.next()?;
    if filename.is_empty() {
        return None;
    }
    Some(ParsedArchiveKey { job, year, month, day, filename })
}

pub fn manifest_key(job: &str, ts: &BackupTimestamp) -> String {
    format!("{}/{}/{}.json", MANIFESTS_PREFIX, job, ts)
}

pub fn latest_key(job: &str) -> String {
    format!("{}/{}.json", LATEST_PREFIX, job)
}

pub fn snapshot_key(job: &str, ts: &BackupTimestamp) -> String {
    format!("{}/{}/{}.json", SNAPSHOTS_PREFIX, job, ts)
}

pub fn index_key(job: &str, ts: &BackupTimestamp) -> String {
    format!("{}/{}/{}.json", INDEXES_PREFIX, job, ts)
}

pub fn lock_key(name: &str) -> String {
    format!("{}/{}.lock", LOCKS_PREFIX, name)
}

pub fn manifests_prefix_for_job(job: &str) -> String {
    format!("{}/{}/", MANIFESTS_PREFIX, job)
}

pub fn snapshots_prefix_for_job(job: &str) -> String {
    format!("{}/{}/", SNAPSHOTS_PREFIX, job)
}

pub fn archives_prefix_for_job(job: &str) -> String {
    format!("{}/{}/", ARCHIVES_PREFIX, job)
}

/// First `n` hex digits of a hash; the whole hash when `n` is zero or
/// longer than the hash.
pub fn hash_prefix(hash: &str, n: usize) -> &str {
    if n == 0 || hash.len() < n {
        hash
    } else {
        &hash[..n]
    }
}

/// `objects/<hash[0:n]>/<hash>`
pub fn chunk_key(hash: &str, prefix_len: usize) -> String {
    let n = if prefix_len == 0 { DEFAULT_HASH_PREFIX_LEN } else { prefix_len };
    format!("{}/{}/{}", OBJECTS_PREFIX, hash_prefix(hash, n), hash)
}

/// Inverse of [chunk_key]; `None` for keys outside the chunk namespace.
pub fn hash_from_chunk_key(key: &str) -> Option<&str> {
    let key = key.trim_matches('/');
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 3 || parts[0] != OBJECTS_PREFIX || parts[2].is_empty() {
        return None;
    }
    Some(parts[2])
}

/// Parse the timestamp out of a `<prefix>/<job>/<ts>.json` record key.
/// The basename must be exactly fourteen digits plus `.json`.
pub fn timestamp_from_record_key(key: &str) -> Option<BackupTimestamp> {
    let base = key.trim_end_matches('/').rsplit('/').next()?;
    let ts = base.strip_suffix(".json")?;
    ts.parse().ok()
}

/// Job component of a `<prefix>/<job>/<ts>.json` record key.
pub fn job_from_record_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.trim_start_matches('/').strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;
    let job = rest.split('/').next()?;
    if job.is_empty() {
        None
    } else {
        Some(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> BackupTimestamp {
        s.parse().unwrap()
    }

    #[test]
    fn test_archive_key_roundtrip() {
        let key = archive_key("web", "host.example", &ts("20250226120000"), CompressionFormat::Gz);
        assert_eq!(key, "archives/web/2025/02/26/backup-host.example-20250226120000.tar.gz");

        let parsed = parse_archive_key(&key).unwrap();
        assert_eq!(parsed.job, "web");
        assert_eq!(parsed.year, "2025");
        assert_eq!(parsed.month, "02");
        assert_eq!(parsed.day, "26");
        assert_eq!(parsed.filename, "backup-host.example-20250226120000.tar.gz");
    }

    #[test]
    fn test_archive_key_sanitizes_host() {
        let key = archive_key("web", "my host!", &ts("20250226120000"), CompressionFormat::Tar);
        assert!(key.ends_with("backup-my_host_-20250226120000.tar"));
    }

    #[test]
    fn test_parse_archive_key_rejects_foreign_keys() {
        assert!(parse_archive_key("manifests/web/20250226120000.json").is_none());
        assert!(parse_archive_key("archives/web/2025/02").is_none());
    }

    #[test]
    fn test_record_keys() {
        let t = ts("20250226120000");
        assert_eq!(manifest_key("web", &t), "manifests/web/20250226120000.json");
        assert_eq!(latest_key("web"), "latest/web.json");
        assert_eq!(snapshot_key("db", &t), "snapshots/db/20250226120000.json");
        assert_eq!(index_key("db", &t), "indexes/db/20250226120000.json");
        assert_eq!(lock_key("web"), "locks/web.lock");
    }

    #[test]
    fn test_chunk_key_fanout() {
        assert_eq!(chunk_key("abcd1234", 2), "objects/ab/abcd1234");
        assert_eq!(chunk_key("abcd1234", 0), "objects/ab/abcd1234");
        assert_eq!(chunk_key("ab", 10), "objects/ab/ab");
        assert_eq!(hash_from_chunk_key("objects/ab/abcd1234"), Some("abcd1234"));
        assert_eq!(hash_from_chunk_key("objects/abcd1234"), None);
        assert_eq!(hash_from_chunk_key("snapshots/j/x.json"), None);
    }

    #[test]
    fn test_timestamp_from_record_key() {
        assert_eq!(
            timestamp_from_record_key("manifests/web/20250226120000.json"),
            Some(ts("20250226120000"))
        );
        assert!(timestamp_from_record_key("manifests/web/2025022612000.json").is_none());
        assert!(timestamp_from_record_key("manifests/web/202502261200001.json").is_none());
        assert!(timestamp_from_record_key("manifests/web/20250226120000.txt").is_none());
        assert!(timestamp_from_record_key("manifests/web/notatimestamp.json").is_none());
    }

    #[test]
    fn test_job_from_record_key() {
        assert_eq!(
            job_from_record_key("snapshots/db/20250226120000.json", SNAPSHOTS_PREFIX),
            Some("db")
        );
        assert_eq!(job_from_record_key("objects/ab/cd", SNAPSHOTS_PREFIX), None);
    }
}
