//! Basic types used by most of the VelBackuper code.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod time;
pub use time::BackupTimestamp;

mod retention;
pub use retention::RetentionPolicy;

mod schedule;
pub use schedule::{next_run, SchedulePeriod, SchedulePolicy};

mod jobs;
pub use jobs::{
    JobConfig, MysqlConfig, MysqlDumpOptions, PathsConfig, PresetsConfig, DEFAULT_CONCURRENCY,
};

mod store;
pub use store::StoreConfig;

mod notifications;
pub use notifications::{DiscordConfig, DiscordMentions, DiscordRetry, NotificationsConfig};

#[rustfmt::skip]
pub const SAFE_NAME_REGEX_STR: &str = r"^[A-Za-z0-9_][A-Za-z0-9._\-]*$";

lazy_static! {
    pub static ref SAFE_NAME_REGEX: Regex = Regex::new(SAFE_NAME_REGEX_STR).unwrap();
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._\-]").unwrap();
}

/// Check that a job name is non-empty and only contains path-safe
/// characters. Job names end up unescaped in object keys.
pub fn verify_job_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        bail!("job name must not be empty");
    }
    if !SAFE_NAME_REGEX.is_match(name) {
        bail!("job name '{}' contains invalid characters", name);
    }
    Ok(())
}

/// Replace everything outside of `[A-Za-z0-9._-]` so the result is safe
/// inside an archive filename.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "localhost".to_string();
    }
    UNSAFE_FILENAME_CHARS.replace_all(trimmed, "_").into_owned()
}

/// Normalize a configured key prefix: backslashes become slashes, doubled
/// slashes collapse, leading/trailing slashes are trimmed. Idempotent.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }
    let mut p = prefix.replace('\\', "/");
    while p.contains("//") {
        p = p.replace("//", "/");
    }
    let p = p.trim_matches('/');

    let mut parts = Vec::new();
    for comp in p.split('/') {
        match comp {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            comp => parts.push(comp),
        }
    }
    parts.join("/")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Archive,
    Incremental,
}

impl FromStr for BackupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "archive" => Ok(BackupMode::Archive),
            "incremental" => Ok(BackupMode::Incremental),
            "" => bail!("mode is required (must be 'archive' or 'incremental')"),
            other => bail!("invalid mode '{}': must be exactly 'archive' or 'incremental'", other),
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BackupMode::Archive => "archive",
            BackupMode::Incremental => "incremental",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Tar,
    #[default]
    Gz,
    Zst,
}

impl CompressionFormat {
    /// Archive filename extension, tar container included.
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Tar => ".tar",
            CompressionFormat::Gz => ".tar.gz",
            CompressionFormat::Zst => ".tar.zst",
        }
    }

    /// Detect the compression of an existing archive from its key suffix.
    pub fn from_archive_key(key: &str) -> Self {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".gz") {
            CompressionFormat::Gz
        } else if lower.ends_with(".tar.zst") || lower.ends_with(".zst") {
            CompressionFormat::Zst
        } else {
            CompressionFormat::Tar
        }
    }
}

impl FromStr for CompressionFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tar" => Ok(CompressionFormat::Tar),
            "gz" | "gzip" => Ok(CompressionFormat::Gz),
            "zst" | "zstd" => Ok(CompressionFormat::Zst),
            other => bail!("unknown compression format '{}'", other),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CompressionFormat::Tar => "tar",
            CompressionFormat::Gz => "gz",
            CompressionFormat::Zst => "zst",
        })
    }
}
