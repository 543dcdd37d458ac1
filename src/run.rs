//! The run driver: wires collector, engine, lock and notifier into
//! complete job runs. Jobs within one invocation execute strictly
//! serially; one cancellation token is threaded through every component.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use tokio_util::sync::CancellationToken;

use vbk_api_types::{BackupMode, BackupTimestamp, JobConfig, RetentionPolicy};
use vbk_client::archive_writer::{run_archive_backup, ArchiveOptions};
use vbk_client::extract::{restore_archive, ArchiveRestoreOptions};
use vbk_client::incremental_writer::{run_incremental_backup, IncrementalOptions};
use vbk_client::restore::{restore_incremental, IncrementalRestoreOptions};
use vbk_client::{collector_for_job, CollectorStream, StreamCompression};
use vbk_datastore::manifest::{read_latest, read_manifest};
use vbk_datastore::{gc, index, keys, prune, snapshot, Store};

use crate::config::{Config, LockBackend};
use crate::hostname;
use crate::lock::{LocalLock, Locker, StoreLock};
use crate::notify::{notifier_from_config, Notifier};

#[derive(Clone, Debug)]
pub enum JobSelection {
    All,
    One(String),
}

pub struct RunContext {
    pub config: Config,
    pub store: Store,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub cancel: CancellationToken,
    pub host: String,
}

impl RunContext {
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, Error> {
        let store = Store::open_s3(&config.s3)?.with_cancellation(cancel.clone());
        let notifier = notifier_from_config(config.notifications.as_ref())?;
        Ok(Self { config, store, notifier, cancel, host: hostname() })
    }

    fn locker_for(&self, name: &str) -> Box<dyn Locker> {
        let ttl = Duration::from_secs(self.config.lock.ttl_minutes * 60);
        match self.config.lock.backend {
            LockBackend::Local => {
                let dir = self.config.lock.dir.as_ref().map(PathBuf::from);
                Box::new(LocalLock::new(dir.as_deref(), name, ttl))
            }
            LockBackend::S3 => Box::new(StoreLock::new(self.store.clone(), name, ttl)),
        }
    }

    /// Enabled jobs matching the selection. Selecting a disabled or
    /// unknown job by name is an error.
    pub fn select_jobs(&self, selection: &JobSelection) -> Result<Vec<&JobConfig>, Error> {
        match selection {
            JobSelection::All => {
                Ok(self.config.jobs.iter().filter(|job| job.enabled).collect())
            }
            JobSelection::One(name) => {
                let job = self
                    .config
                    .job(name)
                    .ok_or_else(|| format_err!("no job named '{}'", name))?;
                if !job.enabled {
                    bail!("job '{}' is disabled", name);
                }
                Ok(vec![job])
            }
        }
    }

    async fn notify<F>(&self, what: &str, send: F) -> Result<(), Error>
    where
        F: std::future::Future<Output = Result<(), Error>>,
    {
        match send.await {
            Ok(()) => Ok(()),
            Err(err) => {
                let strict = self
                    .config
                    .notifications
                    .as_ref()
                    .map_or(false, |notifications| notifications.strict);
                if strict {
                    Err(format_err!("{} notification failed - {}", what, err))
                } else {
                    log::warn!("{} notification failed: {}", what, err);
                    Ok(())
                }
            }
        }
    }
}

struct JobRunStats {
    backup_id: BackupTimestamp,
    size: u64,
    duration: Duration,
}

/// Run the selected jobs, one after the other. Failing jobs do not stop
/// the remaining ones; the first error is returned at the end.
pub async fn run_jobs(ctx: &RunContext, selection: &JobSelection) -> Result<(), Error> {
    let jobs = ctx.select_jobs(selection)?;
    if jobs.is_empty() {
        log::info!("no enabled jobs to run");
        return Ok(());
    }

    let mut first_error = None;

    for job in jobs {
        if ctx.cancel.is_cancelled() {
            bail!("run cancelled");
        }
        if let Err(err) = run_single_job(ctx, job).await {
            log::error!("job '{}' failed: {}", job.name, err);
            if let Some(notifier) = &ctx.notifier {
                ctx.notify("error", notifier.notify_error(&job.name, "", &err)).await?;
            }
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn run_single_job(ctx: &RunContext, job: &JobConfig) -> Result<(), Error> {
    let mode = ctx.config.mode_for(job)?;

    let Some(collector) = collector_for_job(job) else {
        log::warn!("job '{}' has no sources configured, skipping", job.name);
        if let Some(notifier) = &ctx.notifier {
            ctx.notify(
                "warning",
                notifier.notify_warning(&job.name, "", "job has no sources configured"),
            )
            .await?;
        }
        return Ok(());
    };

    // held across the whole run, retention included
    let locker = ctx.locker_for(&job.name);
    locker.acquire().await?;

    let result = async {
        if let Some(notifier) = &ctx.notifier {
            ctx.notify("start", notifier.notify_start(&job.name, "")).await?;
        }

        let stats = match mode {
            BackupMode::Archive => run_archive_job(ctx, job, collector).await?,
            BackupMode::Incremental => run_incremental_job(ctx, job, collector).await?,
        };

        if let Some(notifier) = &ctx.notifier {
            ctx.notify(
                "success",
                notifier.notify_success(
                    &job.name,
                    &stats.backup_id.to_string(),
                    stats.duration,
                    stats.size,
                ),
            )
            .await?;
        }

        if let Some(retention) = &job.retention {
            apply_job_retention(ctx, job, mode, retention, false).await?;
        }

        Ok::<(), Error>(())
    }
    .await;

    let release_result = locker.release().await;
    result?;
    release_result
}

async fn run_archive_job(
    ctx: &RunContext,
    job: &JobConfig,
    collector: Arc<dyn vbk_client::Collector>,
) -> Result<JobRunStats, Error> {
    let options = ArchiveOptions {
        format: job.format.unwrap_or_default(),
        compression_level: job.compression_level,
        part_size_mb: job.part_size_mb,
    };
    let stats =
        run_archive_backup(&ctx.store, collector, &job.name, &ctx.host, &options, &ctx.cancel)
            .await?;
    Ok(JobRunStats { backup_id: stats.backup_id, size: stats.size, duration: stats.duration })
}

async fn run_incremental_job(
    ctx: &RunContext,
    job: &JobConfig,
    collector: Arc<dyn vbk_client::Collector>,
) -> Result<JobRunStats, Error> {
    let stream = CollectorStream::new(collector, &job.name, StreamCompression::None, &ctx.cancel);
    let options = IncrementalOptions {
        chunk_size_mb: job.chunk_size_mb,
        concurrency: job.concurrency,
        hash_prefix_len: 0,
    };
    let stats = run_incremental_backup(
        &ctx.store,
        stream,
        &job.name,
        Vec::new(),
        &options,
        &ctx.cancel,
    )
    .await?;
    Ok(JobRunStats {
        backup_id: stats.backup_id,
        size: stats.stream_size,
        duration: stats.duration,
    })
}

async fn apply_job_retention(
    ctx: &RunContext,
    job: &JobConfig,
    mode: BackupMode,
    retention: &RetentionPolicy,
    dry_run: bool,
) -> Result<PruneOutcome, Error> {
    let now = chrono::Utc::now();
    let (deleted, retained) = match mode {
        BackupMode::Archive => {
            let deleted =
                prune::apply_retention(&ctx.store, &job.name, retention, now, dry_run).await?;
            let retained = ctx
                .store
                .list(&keys::manifests_prefix_for_job(&job.name), 0)
                .await?
                .len();
            (deleted, retained)
        }
        BackupMode::Incremental => {
            let stats =
                gc::prune_incremental(&ctx.store, &job.name, retention, now, dry_run).await?;
            let retained = ctx
                .store
                .list(&keys::snapshots_prefix_for_job(&job.name), 0)
                .await?
                .len();
            (stats.deleted_snapshots, retained)
        }
    };

    if deleted > 0 || dry_run {
        log::info!(
            "job '{}': prune {} deleted, {} retained{}",
            job.name,
            deleted,
            retained,
            if dry_run { " (dry run)" } else { "" }
        );
    }
    if !dry_run {
        if let Some(notifier) = &ctx.notifier {
            ctx.notify("prune", notifier.notify_prune(&job.name, retained, deleted)).await?;
        }
    }

    Ok(PruneOutcome { job: job.name.clone(), retained, deleted })
}

#[derive(Clone, Debug)]
pub struct PruneOutcome {
    pub job: String,
    pub retained: usize,
    pub deleted: usize,
}

/// Apply retention to the selected jobs without running a backup.
pub async fn prune_jobs(
    ctx: &RunContext,
    selection: &JobSelection,
    dry_run: bool,
) -> Result<Vec<PruneOutcome>, Error> {
    let mut outcomes = Vec::new();

    for job in ctx.select_jobs(selection)? {
        let Some(retention) = &job.retention else {
            log::info!("job '{}' has no retention policy, skipping", job.name);
            continue;
        };
        let mode = ctx.config.mode_for(job)?;

        if dry_run {
            outcomes.push(apply_job_retention(ctx, job, mode, retention, true).await?);
            continue;
        }

        let locker = ctx.locker_for(&job.name);
        locker.acquire().await?;
        let result = apply_job_retention(ctx, job, mode, retention, false).await;
        let release_result = locker.release().await;
        outcomes.push(result?);
        release_result?;
    }

    Ok(outcomes)
}

#[derive(Clone, Debug)]
pub struct ListEntry {
    pub job: String,
    /// Equal to the run timestamp.
    pub id: String,
    pub size: u64,
}

/// Backups of the selected jobs, oldest first.
pub async fn list_backups(
    ctx: &RunContext,
    job_filter: Option<&str>,
) -> Result<Vec<ListEntry>, Error> {
    let jobs: Vec<&JobConfig> = match job_filter {
        Some(name) => vec![ctx
            .config
            .job(name)
            .ok_or_else(|| format_err!("no job named '{}'", name))?],
        None => ctx.config.jobs.iter().collect(),
    };

    let mut entries = Vec::new();
    for job in jobs {
        match ctx.config.mode_for(job)? {
            BackupMode::Archive => {
                for manifest_key in
                    ctx.store.list(&keys::manifests_prefix_for_job(&job.name), 0).await?
                {
                    let Some(ts) = keys::timestamp_from_record_key(&manifest_key) else {
                        continue;
                    };
                    let manifest = read_manifest(&ctx.store, &manifest_key).await?;
                    entries.push(ListEntry {
                        job: job.name.clone(),
                        id: ts.to_string(),
                        size: manifest.size,
                    });
                }
            }
            BackupMode::Incremental => {
                for snapshot_key in
                    ctx.store.list(&keys::snapshots_prefix_for_job(&job.name), 0).await?
                {
                    let Some(ts) = keys::timestamp_from_record_key(&snapshot_key) else {
                        continue;
                    };
                    let snap = snapshot::read_snapshot(&ctx.store, &snapshot_key).await?;
                    let size = if snap.index_key.is_empty() {
                        0
                    } else {
                        let idx = index::read_index(&ctx.store, &snap.index_key).await?;
                        idx.chunks.iter().map(|chunk| chunk.size).sum()
                    };
                    entries.push(ListEntry { job: job.name.clone(), id: ts.to_string(), size });
                }
            }
        }
    }

    entries.sort_by(|a, b| a.job.cmp(&b.job).then(a.id.cmp(&b.id)));
    Ok(entries)
}

/// Restore one backup point of a job below `target`.
pub async fn restore_job(
    ctx: &RunContext,
    job_name: &str,
    point: &str,
    target: &Path,
    dry_run: bool,
    mysql_only: bool,
) -> Result<(), Error> {
    let job = ctx
        .config
        .job(job_name)
        .ok_or_else(|| format_err!("no job named '{}'", job_name))?;

    match ctx.config.mode_for(job)? {
        BackupMode::Archive => {
            let archive_key = if point == "latest" {
                read_latest(&ctx.store, job_name)
                    .await?
                    .ok_or_else(|| format_err!("job '{}' has no latest backup", job_name))?
                    .key
            } else {
                let ts: BackupTimestamp = point
                    .parse()
                    .map_err(|err| format_err!("invalid restore point '{}' - {}", point, err))?;
                let manifest =
                    read_manifest(&ctx.store, &keys::manifest_key(job_name, &ts)).await?;
                manifest.key
            };
            let restored = restore_archive(
                &ctx.store,
                &archive_key,
                target,
                ArchiveRestoreOptions { mysql_only, dry_run },
            )
            .await?;
            log::info!("restored {} entries from {}", restored, archive_key);
        }
        BackupMode::Incremental => {
            if mysql_only {
                bail!("--mysql-only is only supported for archive mode restores");
            }
            restore_incremental(
                &ctx.store,
                job_name,
                point,
                target,
                IncrementalRestoreOptions { dry_run, verify_chunks: true },
            )
            .await?;
        }
    }

    if !dry_run {
        if let Some(notifier) = &ctx.notifier {
            ctx.notify(
                "restore",
                notifier.notify_restore(job_name, point, &target.to_string_lossy()),
            )
            .await?;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct JobStatus {
    pub name: String,
    pub enabled: bool,
    pub mode: BackupMode,
    pub last_backup: Option<String>,
    pub next_run: Option<(chrono::DateTime<chrono::Utc>, String)>,
}

/// Per-job status for the `status` command.
pub async fn job_status(ctx: &RunContext) -> Result<Vec<JobStatus>, Error> {
    let now = chrono::Utc::now();
    let mut statuses = Vec::new();

    for job in &ctx.config.jobs {
        let mode = ctx.config.mode_for(job)?;
        let last_backup = match mode {
            BackupMode::Archive => {
                read_latest(&ctx.store, &job.name).await?.map(|latest| latest.timestamp.to_string())
            }
            BackupMode::Incremental => ctx
                .store
                .list(&keys::snapshots_prefix_for_job(&job.name), 0)
                .await?
                .iter()
                .filter_map(|key| keys::timestamp_from_record_key(key))
                .max()
                .map(|ts| ts.to_string()),
        };
        let next_run = job.schedule.as_ref().map(|schedule| {
            let (at, desc) = vbk_api_types::next_run(schedule, now);
            (at, desc)
        });

        statuses.push(JobStatus {
            name: job.name.clone(),
            enabled: job.enabled,
            mode,
            last_backup,
            next_run,
        });
    }

    Ok(statuses)
}
