use serde::{Deserialize, Serialize};

use crate::{BackupMode, CompressionFormat, RetentionPolicy, SchedulePolicy};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Filesystem sources of a job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MysqlDumpOptions {
    #[serde(default = "default_true")]
    pub single_transaction: bool,
    #[serde(default = "default_true")]
    pub routines: bool,
    #[serde(default = "default_true")]
    pub events: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MysqlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dump_all: bool,
    #[serde(default)]
    pub exclude_system: bool,
    /// Unix socket path; autodetected when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    /// Extra defaults file passed to mysqldump, `~` expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<MysqlDumpOptions>,
}

/// Well-known web server configuration directories.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresetsConfig {
    #[serde(default)]
    pub nginx: bool,
    #[serde(default)]
    pub apache: bool,
    #[serde(default)]
    pub letsencrypt: bool,
}

impl PresetsConfig {
    pub fn any(&self) -> bool {
        self.nginx || self.apache || self.letsencrypt
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-job override of the global backup mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BackupMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<CompressionFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MysqlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets: Option<PresetsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    /// Incremental mode chunk size, clamped to [4, 16] MiB at run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size_mb: Option<u64>,
    /// Parallel chunk uploads in incremental mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Archive mode multipart part size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size_mb: Option<u64>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            mode: None,
            format: None,
            compression_level: None,
            paths: None,
            mysql: None,
            presets: None,
            schedule: None,
            retention: None,
            chunk_size_mb: None,
            concurrency: None,
            part_size_mb: None,
        }
    }

    pub fn has_sources(&self) -> bool {
        self.mysql.as_ref().map_or(false, |m| m.enabled)
            || self.presets.as_ref().map_or(false, |p| p.any())
            || self.paths.as_ref().map_or(false, |p| !p.include.is_empty())
    }
}
