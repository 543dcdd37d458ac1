//! systemd service and timer unit generation for scheduled jobs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

use vbk_api_types::{JobConfig, SchedulePeriod, SchedulePolicy};

pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";
pub const DEFAULT_BINARY: &str = "/usr/bin/velbackuper";

#[derive(Clone, Debug)]
pub struct GeneratorOptions {
    pub binary: String,
    pub config_path: String,
    pub unit_dir: PathBuf,
    pub hardening: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            config_path: crate::config::default_config_path().to_string_lossy().into_owned(),
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            hardening: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedUnits {
    pub service_name: String,
    pub timer_name: String,
    pub service: String,
    pub timer: String,
}

pub fn sanitize_unit_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => Some(c),
            ' ' | '.' => Some('-'),
            _ => None,
        })
        .collect();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

pub fn generate(job: &JobConfig, options: &GeneratorOptions) -> Result<GeneratedUnits, Error> {
    let Some(schedule) = &job.schedule else {
        bail!("job '{}' has no schedule", job.name);
    };

    let safe_name = sanitize_unit_name(&job.name);
    let service_name = format!("velbackuper-{}.service", safe_name);
    let timer_name = format!("velbackuper-{}.timer", safe_name);

    let exec_start = format!("{} run --job {}", options.binary, job.name);
    let service = build_service(&job.name, &exec_start, &options.config_path, options.hardening);
    let timer = build_timer(&job.name, &service_name, schedule);

    Ok(GeneratedUnits { service_name, timer_name, service, timer })
}

fn build_service(job_name: &str, exec_start: &str, config_path: &str, hardening: bool) -> String {
    let mut unit = String::new();

    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description=VelBackuper backup for job {}", job_name);
    let _ = writeln!(unit, "After=network-online.target");
    let _ = writeln!(unit, "Wants=network-online.target");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Service]");
    let _ = writeln!(unit, "Type=oneshot");
    let _ = writeln!(unit, "ExecStart={}", exec_start);
    let _ = writeln!(unit, "Environment=VELBACKUPER_CONFIG={}", config_path);

    if hardening {
        for line in [
            "ProtectSystem=full",
            "ProtectHome=read-only",
            "PrivateTmp=yes",
            "NoNewPrivileges=yes",
            "ProtectKernelTunables=yes",
            "ProtectKernelModules=yes",
            "ProtectControlGroups=yes",
            "RestrictRealtime=yes",
            "RestrictSUIDSGID=yes",
            "LockPersonality=yes",
            "ProtectClock=yes",
            "ProtectHostname=yes",
            "ProtectKernelLogs=yes",
            "RestrictNamespaces=yes",
            "RestrictAddressFamilies=AF_UNIX AF_INET AF_INET6",
        ] {
            let _ = writeln!(unit, "{}", line);
        }
    }

    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Install]");
    let _ = writeln!(unit, "WantedBy=multi-user.target");
    unit
}

fn build_timer(job_name: &str, service_name: &str, schedule: &SchedulePolicy) -> String {
    let mut unit = String::new();

    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description=VelBackuper timer for job {}", job_name);
    let _ = writeln!(unit, "Requires={}", service_name);
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Timer]");
    for calendar in on_calendar_lines(schedule) {
        let _ = writeln!(unit, "OnCalendar={}", calendar);
    }
    let jitter_seconds = schedule.jitter_minutes.max(0) * 60;
    if jitter_seconds > 0 {
        let _ = writeln!(unit, "RandomizedDelaySec={}", jitter_seconds);
    }
    let _ = writeln!(unit, "Persistent=yes");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Install]");
    let _ = writeln!(unit, "WantedBy=timers.target");
    unit
}

fn on_calendar_lines(schedule: &SchedulePolicy) -> Vec<String> {
    let idx = schedule.times.clamp(1, 5) as usize - 1;

    match schedule.period {
        SchedulePeriod::Week => {
            const DAYS: [&[&str]; 5] = [
                &["Mon"],
                &["Mon", "Thu"],
                &["Mon", "Wed", "Fri"],
                &["Mon", "Tue", "Thu", "Fri"],
                &["Mon", "Tue", "Wed", "Thu", "Fri"],
            ];
            DAYS[idx].iter().map(|day| format!("{} *-*-* 02:00:00", day)).collect()
        }
        SchedulePeriod::Month => {
            const DAYS: [&[u32]; 5] =
                [&[1], &[1, 15], &[1, 10, 20], &[1, 8, 15, 22], &[1, 7, 14, 21, 28]];
            DAYS[idx].iter().map(|day| format!("*-*-{:02} 02:00:00", day)).collect()
        }
        SchedulePeriod::Day => {
            const HOURS: [&[u32]; 5] =
                [&[2], &[2, 14], &[2, 10, 18], &[2, 8, 14, 20], &[2, 6, 12, 18, 22]];
            HOURS[idx].iter().map(|hour| format!("*-*-* {:02}:00:00", hour)).collect()
        }
    }
}

/// Write both units for every scheduled job. Returns the written unit
/// file paths.
pub fn install_units(jobs: &[JobConfig], options: &GeneratorOptions) -> Result<Vec<PathBuf>, Error> {
    let mut written = Vec::new();
    for job in jobs {
        if !job.enabled || job.schedule.is_none() {
            continue;
        }
        let units = generate(job, options)?;
        let service_path = options.unit_dir.join(&units.service_name);
        let timer_path = options.unit_dir.join(&units.timer_name);
        std::fs::write(&service_path, &units.service)
            .with_context(|| format!("writing {:?} failed", service_path))?;
        std::fs::write(&timer_path, &units.timer)
            .with_context(|| format!("writing {:?} failed", timer_path))?;
        written.push(service_path);
        written.push(timer_path);
    }
    Ok(written)
}

/// Remove all velbackuper units for the given jobs. Missing files are
/// fine.
pub fn uninstall_units(jobs: &[JobConfig], unit_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut removed = Vec::new();
    for job in jobs {
        let safe_name = sanitize_unit_name(&job.name);
        for unit in [
            format!("velbackuper-{}.service", safe_name),
            format!("velbackuper-{}.timer", safe_name),
        ] {
            let path = unit_dir.join(unit);
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbk_api_types::RetentionPolicy;

    fn scheduled_job(times: u32, period: SchedulePeriod) -> JobConfig {
        let mut job = JobConfig::new("web-01");
        job.schedule = Some(SchedulePolicy { period, times, jitter_minutes: 15 });
        job.retention = Some(RetentionPolicy::new(7, 0, 0));
        job
    }

    #[test]
    fn test_sanitize_unit_name() {
        assert_eq!(sanitize_unit_name("web-01"), "web-01");
        assert_eq!(sanitize_unit_name("my job.prod"), "my-job-prod");
        assert_eq!(sanitize_unit_name("!!!"), "default");
    }

    #[test]
    fn test_generate_service_and_timer() {
        let job = scheduled_job(2, SchedulePeriod::Day);
        let units = generate(&job, &GeneratorOptions::default()).unwrap();

        assert_eq!(units.service_name, "velbackuper-web-01.service");
        assert!(units.service.contains("ExecStart=/usr/bin/velbackuper run --job web-01"));
        assert!(units.service.contains("Environment=VELBACKUPER_CONFIG="));
        assert!(units.service.contains("ProtectSystem=full"));

        assert!(units.timer.contains("OnCalendar=*-*-* 02:00:00"));
        assert!(units.timer.contains("OnCalendar=*-*-* 14:00:00"));
        assert!(units.timer.contains("RandomizedDelaySec=900"));
        assert!(units.timer.contains("Persistent=yes"));
    }

    #[test]
    fn test_weekly_calendar() {
        let schedule =
            SchedulePolicy { period: SchedulePeriod::Week, times: 3, jitter_minutes: 0 };
        let lines = on_calendar_lines(&schedule);
        assert_eq!(
            lines,
            vec!["Mon *-*-* 02:00:00", "Wed *-*-* 02:00:00", "Fri *-*-* 02:00:00"]
        );
    }

    #[test]
    fn test_install_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let options = GeneratorOptions {
            unit_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let jobs = vec![scheduled_job(1, SchedulePeriod::Day)];

        let written = install_units(&jobs, &options).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|path| path.exists()));

        let removed = uninstall_units(&jobs, dir.path()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(written.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_generate_requires_schedule() {
        let job = JobConfig::new("none");
        assert!(generate(&job, &GeneratorOptions::default()).is_err());
    }
}
