use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, format_err, Error};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use vbk_api_types::StoreConfig;

use velbackuper::config::{self, Config, LockConfig};
use velbackuper::run::{self, JobSelection, RunContext};
use velbackuper::{doctor, systemd};

#[derive(Parser)]
#[command(name = "velbackuper", version, about = "Host-side backups into S3 compatible storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run backup (optionally for one job or all jobs)
    Run {
        #[arg(long, conflicts_with = "all")]
        job: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// List backups or snapshots
    List {
        #[arg(long)]
        job: Option<String>,
    },
    /// Apply retention and remove old backups or orphan chunks
    Prune {
        #[arg(long, conflicts_with = "all")]
        job: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a backup point into a target directory
    Restore {
        #[arg(long)]
        job: String,
        /// Backup id (14 digit timestamp), or "latest" in archive mode
        #[arg(long)]
        point: String,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Restore only entries below mysql/
        #[arg(long)]
        mysql_only: bool,
    },
    /// Validate the configuration file
    Validate,
    /// Show backup status (last run, next run, job state)
    Status,
    /// Check the environment (config, store, locks, disk)
    Doctor,
    /// Write a starter configuration
    Init,
    /// Add a record to the configuration
    Add {
        #[command(subcommand)]
        what: AddCommands,
    },
    /// Enable a job
    Enable { name: String },
    /// Disable a job
    Disable { name: String },
    /// Generate and install systemd units for scheduled jobs
    InstallSystemd,
    /// Remove the generated systemd units
    UninstallSystemd,
    /// Adjust notification settings
    Config {
        #[command(subcommand)]
        what: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum AddCommands {
    /// Add a job from a template (web, mysql, files)
    Job {
        template: String,
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Set the Discord webhook url
    Webhooks {
        #[arg(long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    match dispatch(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Cancel the run on ctrl-c / SIGTERM.
fn signal_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling run");
            trigger.cancel();
        }
    });
    cancel
}

async fn context() -> Result<RunContext, Error> {
    let config = config::load(true)?;
    RunContext::new(config, signal_token())
}

async fn dispatch(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Run { job, all } => {
            let selection = selection(job, all)?;
            let ctx = context().await?;
            run::run_jobs(&ctx, &selection).await
        }
        Commands::List { job } => {
            let ctx = context().await?;
            let entries = run::list_backups(&ctx, job.as_deref()).await?;
            if entries.is_empty() {
                println!("no backups found");
            }
            for entry in entries {
                println!("{:<20} {:<16} {:>12} bytes", entry.job, entry.id, entry.size);
            }
            Ok(())
        }
        Commands::Prune { job, all, dry_run } => {
            let selection = selection(job, all)?;
            let ctx = context().await?;
            let outcomes = run::prune_jobs(&ctx, &selection, dry_run).await?;
            for outcome in outcomes {
                println!(
                    "{:<20} deleted {:>4}, retained {:>4}{}",
                    outcome.job,
                    outcome.deleted,
                    outcome.retained,
                    if dry_run { " (dry run)" } else { "" }
                );
            }
            Ok(())
        }
        Commands::Restore { job, point, target, dry_run, mysql_only } => {
            let ctx = context().await?;
            run::restore_job(&ctx, &job, &point, &target, dry_run, mysql_only).await?;
            println!("restored job '{}' point {} to {:?}", job, point, target);
            Ok(())
        }
        Commands::Validate => {
            let config = config::load(false)?;
            config::validate(&config)?;
            println!("configuration is valid ({} jobs)", config.jobs.len());
            Ok(())
        }
        Commands::Status => {
            let ctx = context().await?;
            for status in run::job_status(&ctx).await? {
                let state = if status.enabled { "enabled" } else { "disabled" };
                let last = status.last_backup.as_deref().unwrap_or("-");
                let next = match &status.next_run {
                    Some((at, desc)) => format!("{} ({})", at.format("%Y-%m-%d %H:%M UTC"), desc),
                    None => "no schedule".to_string(),
                };
                println!(
                    "{:<20} {:<10} {:<12} last: {:<16} next: {}",
                    status.name, state, status.mode.to_string(), last, next
                );
            }
            Ok(())
        }
        Commands::Doctor => {
            let config = config::load(true).ok();
            let results = doctor::run(config.as_ref()).await;
            let mut failed = false;
            for result in &results {
                let mark = if result.ok { "ok" } else { "FAIL" };
                println!("{:<12} [{}] {}", result.name, mark, result.detail);
                failed = failed || !result.ok;
            }
            if failed {
                bail!("one or more checks failed");
            }
            Ok(())
        }
        Commands::Init => {
            let path = config::resolve_config_path();
            if path.exists() {
                bail!("config {:?} already exists", path);
            }
            let config = Config {
                mode: "archive".to_string(),
                s3: StoreConfig {
                    endpoint: "https://s3.example.com".to_string(),
                    bucket: "backups".to_string(),
                    prefix: "velbackuper".to_string(),
                    ..Default::default()
                },
                lock: LockConfig::default(),
                jobs: vec![config::job_template("files", "default").unwrap()],
                notifications: None,
            };
            config::write(&config, &path)?;
            println!("wrote starter config to {:?} - fill in the s3 credentials", path);
            Ok(())
        }
        Commands::Add { what } => match what {
            AddCommands::Job { template, name } => {
                let mut config = config::load(true)?;
                if config.job(&name).is_some() {
                    bail!("job '{}' already exists", name);
                }
                let job = config::job_template(&template, &name).ok_or_else(|| {
                    format_err!(
                        "unknown template '{}' (available: {})",
                        template,
                        config::job_template_names().join(", ")
                    )
                })?;
                config.jobs.push(job);
                config::validate(&config)?;
                config::write(&config, &config::resolve_config_path())?;
                println!("added job '{}' from template '{}'", name, template);
                Ok(())
            }
        },
        Commands::Enable { name } => set_job_enabled(&name, true),
        Commands::Disable { name } => set_job_enabled(&name, false),
        Commands::InstallSystemd => {
            let config = config::load(true)?;
            let options = systemd::GeneratorOptions::default();
            let written = systemd::install_units(&config.jobs, &options)?;
            if written.is_empty() {
                bail!("no enabled jobs with a schedule");
            }
            for path in &written {
                println!("wrote {:?}", path);
            }
            systemctl(&["daemon-reload"])?;
            for path in written {
                if path.extension().map_or(false, |ext| ext == "timer") {
                    let unit = path.file_name().unwrap().to_string_lossy().into_owned();
                    systemctl(&["enable", "--now", &unit])?;
                }
            }
            Ok(())
        }
        Commands::UninstallSystemd => {
            let config = config::load(true)?;
            for path in
                systemd::uninstall_units(&config.jobs, std::path::Path::new(systemd::DEFAULT_UNIT_DIR))?
            {
                println!("removed {:?}", path);
            }
            systemctl(&["daemon-reload"])?;
            Ok(())
        }
        Commands::Config { what } => match what {
            ConfigCommands::Webhooks { url } => {
                let mut config = config::load(true)?;
                let notifications = config.notifications.get_or_insert_with(Default::default);
                let discord = notifications.discord.get_or_insert_with(Default::default);
                discord.enabled = true;
                discord.webhook_url = url;
                config::write(&config, &config::resolve_config_path())?;
                println!("discord webhook configured");
                Ok(())
            }
        },
    }
}

fn selection(job: Option<String>, all: bool) -> Result<JobSelection, Error> {
    match (job, all) {
        (Some(name), false) => Ok(JobSelection::One(name)),
        (None, true) => Ok(JobSelection::All),
        (None, false) => bail!("specify --job NAME or --all"),
        (Some(_), true) => unreachable!("clap rejects --job with --all"),
    }
}

fn set_job_enabled(name: &str, enabled: bool) -> Result<(), Error> {
    let mut config = config::load(true)?;
    let job = config
        .job_mut(name)
        .ok_or_else(|| format_err!("no job named '{}'", name))?;
    job.enabled = enabled;
    config::write(&config, &config::resolve_config_path())?;
    println!("job '{}' {}", name, if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn systemctl(args: &[&str]) -> Result<(), Error> {
    let status = std::process::Command::new("systemctl").args(args).status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!("systemctl {:?} exited with {}", args, status),
        Err(err) => bail!("running systemctl failed - {}", err),
    }
}
