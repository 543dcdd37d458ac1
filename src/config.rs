//! Configuration file handling.
//!
//! The config lives at `/etc/velbackuper/config.yaml` (overridable via
//! `VELBACKUPER_CONFIG`) and holds credentials, so it is expected to be
//! mode 0600.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use vbk_api_types::{
    verify_job_name, BackupMode, JobConfig, MysqlConfig, NotificationsConfig, PathsConfig,
    PresetsConfig, RetentionPolicy, SchedulePeriod, SchedulePolicy, StoreConfig,
};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/velbackuper";
pub const DEFAULT_CONFIG_NAME: &str = "config.yaml";

pub const ENV_CONFIG_PATH: &str = "VELBACKUPER_CONFIG";
pub const ENV_LOCK_DIR: &str = "VELBACKUPER_LOCK_DIR";
pub const ENV_DISCORD_WEBHOOK: &str = "VELBACKUPER_DISCORD_WEBHOOK_URL";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Local,
    S3,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackend,
    /// Local lock directory; `VELBACKUPER_LOCK_DIR` wins over this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Stale lock eviction horizon; zero means locks never go stale.
    #[serde(default = "default_lock_ttl")]
    pub ttl_minutes: u64,
}

fn default_lock_ttl() -> u64 {
    120
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { backend: LockBackend::Local, dir: None, ttl_minutes: default_lock_ttl() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Global backup mode, `archive` or `incremental`. Jobs may override.
    pub mode: String,
    pub s3: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationsConfig>,
}

impl Config {
    pub fn backup_mode(&self) -> Result<BackupMode, Error> {
        BackupMode::from_str(&self.mode)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobConfig> {
        self.jobs.iter_mut().find(|job| job.name == name)
    }

    /// Effective mode of one job.
    pub fn mode_for(&self, job: &JobConfig) -> Result<BackupMode, Error> {
        match job.mode {
            Some(mode) => Ok(mode),
            None => self.backup_mode(),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_NAME)
}

pub fn resolve_config_path() -> PathBuf {
    match std::env::var_os(ENV_CONFIG_PATH) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}

/// Load and validate the configuration. With `check_perms` a config
/// readable by group or others is rejected, since it carries the store
/// credentials.
pub fn load(check_perms: bool) -> Result<Config, Error> {
    load_from(&resolve_config_path(), check_perms)
}

pub fn load_from(path: &Path, check_perms: bool) -> Result<Config, Error> {
    if check_perms {
        check_config_permissions(path)?;
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|err| format_err!("config file {:?} not readable - {}", path, err))?;
    let mut config: Config = serde_yaml::from_str(&raw)
        .map_err(|err| format_err!("parsing config {:?} failed - {}", path, err))?;

    config.s3.prefix = vbk_api_types::normalize_prefix(&config.s3.prefix);
    validate(&config)?;
    Ok(config)
}

#[cfg(unix)]
fn check_config_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        bail!(
            "config file {:?} has overly permissive mode {:o} (recommended: 0600)",
            path,
            mode
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_config_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

/// Write the config with mode 0600, creating parent directories.
pub fn write(config: &Config, path: &Path) -> Result<(), Error> {
    let data = serde_yaml::to_string(config).context("encoding config failed")?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config dir {:?} failed", dir))?;
    }
    std::fs::write(path, &data).with_context(|| format!("writing config {:?} failed", path))?;
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<(), Error> {
    config.backup_mode()?;

    if config.s3.bucket.is_empty() {
        bail!("s3.bucket is required");
    }
    if config.s3.endpoint.is_empty() {
        bail!("s3.endpoint is required");
    }

    for job in &config.jobs {
        verify_job_name(&job.name)
            .map_err(|err| format_err!("invalid job: {}", err))?;
        if let Some(mb) = job.chunk_size_mb {
            if mb == 0 {
                bail!("job '{}': chunk_size_mb must be positive", job.name);
            }
        }
        if let Some(level) = job.compression_level {
            if !(1..=9).contains(&level) {
                bail!("job '{}': compression_level must be in [1, 9]", job.name);
            }
        }
    }

    let mut names: Vec<&str> = config.jobs.iter().map(|job| job.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != config.jobs.len() {
        bail!("job names must be unique");
    }

    Ok(())
}

/// Starter jobs used by `init` and `add job`.
pub fn job_template(template: &str, job_name: &str) -> Option<JobConfig> {
    let mut job = JobConfig::new(job_name);
    job.schedule = Some(SchedulePolicy { period: SchedulePeriod::Day, times: 1, jitter_minutes: 15 });
    job.retention = Some(RetentionPolicy::new(7, 0, 0));

    match template {
        "web" => {
            job.presets =
                Some(PresetsConfig { nginx: true, apache: false, letsencrypt: true });
            job.schedule =
                Some(SchedulePolicy { period: SchedulePeriod::Day, times: 2, jitter_minutes: 15 });
        }
        "mysql" => {
            job.mysql = Some(MysqlConfig {
                enabled: true,
                dump_all: true,
                exclude_system: true,
                ..Default::default()
            });
            job.schedule =
                Some(SchedulePolicy { period: SchedulePeriod::Day, times: 1, jitter_minutes: 30 });
        }
        "files" => {
            job.paths = Some(PathsConfig {
                include: vec!["/var/backup".to_string()],
                exclude: Vec::new(),
                follow_symlinks: false,
            });
        }
        _ => return None,
    }
    Some(job)
}

pub fn job_template_names() -> &'static [&'static str] {
    &["web", "mysql", "files"]
}
