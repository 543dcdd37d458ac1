use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, format_err, Context, Error};
use tokio_util::sync::CancellationToken;

use vbk_api_types::MysqlConfig;

use super::Collector;

const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "sys"];

const SOCKET_CANDIDATES: &[&str] = &[
    "/var/run/mysqld/mysqld.sock",
    "/tmp/mysql.sock",
    "/var/lib/mysql/mysql.sock",
];

#[derive(Clone, Debug, Default)]
pub struct MysqlOptions {
    pub dump_all: bool,
    pub exclude_system: bool,
    pub socket: Option<String>,
    pub defaults_file: Option<String>,
    pub single_transaction: bool,
    pub routines: bool,
    pub events: bool,
}

impl MysqlOptions {
    pub fn from_config(config: &MysqlConfig) -> Self {
        let dump = config.options.clone().unwrap_or_default();
        Self {
            dump_all: config.dump_all,
            exclude_system: config.exclude_system,
            socket: config.socket.clone(),
            defaults_file: config.defaults_file.clone(),
            single_transaction: dump.single_transaction,
            routines: dump.routines,
            events: dump.events,
        }
    }
}

/// Produces a logical dump by shelling out to `mysqldump`. When
/// `exclude_system` is set the user databases are listed first so the
/// system schemas can be omitted from the dump.
pub struct MysqlCollector {
    options: MysqlOptions,
}

impl MysqlCollector {
    pub fn new(options: MysqlOptions) -> Self {
        Self { options }
    }

    fn socket(&self) -> Option<String> {
        if let Some(socket) = &self.options.socket {
            if !socket.is_empty() {
                return Some(socket.clone());
            }
        }
        for candidate in SOCKET_CANDIDATES {
            if Path::new(candidate).exists() {
                return Some(candidate.to_string());
            }
        }
        match std::env::var("MYSQL_UNIX_PORT") {
            Ok(port) if !port.is_empty() => {
                let path = PathBuf::from(&port);
                if path.is_absolute() {
                    Some(port)
                } else {
                    Some(Path::new("/tmp").join(path).to_string_lossy().into_owned())
                }
            }
            _ => None,
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(defaults) = &self.options.defaults_file {
            if !defaults.is_empty() {
                args.push(format!("--defaults-extra-file={}", expand_home(defaults)));
            }
        }
        if let Some(socket) = self.socket() {
            args.push(format!("--socket={}", socket));
        }
        args
    }

    fn dump_args(&self, databases: &[String]) -> Vec<String> {
        let mut args = self.common_args();
        if self.options.single_transaction {
            args.push("--single-transaction".to_string());
        }
        if self.options.routines {
            args.push("--routines".to_string());
        }
        if self.options.events {
            args.push("--events".to_string());
        }
        args.push("--no-tablespaces".to_string());

        if self.options.dump_all {
            if databases.is_empty() {
                args.push("--all-databases".to_string());
            } else {
                args.push("--databases".to_string());
                args.extend(databases.iter().cloned());
            }
        }
        args
    }

    fn list_user_databases(&self) -> Result<Vec<String>, Error> {
        let mut args = self.common_args();
        args.push("-N".to_string());
        args.push("-e".to_string());
        args.push("SELECT schema_name FROM information_schema.schemata".to_string());

        let output = Command::new("mysql")
            .args(&args)
            .stderr(Stdio::null())
            .output()
            .context("running mysql to list databases failed")?;
        if !output.status.success() {
            bail!("listing databases failed with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|db| !db.is_empty() && !SYSTEM_SCHEMAS.contains(db))
            .map(str::to_string)
            .collect())
    }
}

impl Collector for MysqlCollector {
    fn collect(
        &self,
        job: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let databases = if self.options.dump_all && self.options.exclude_system {
            let databases = self.list_user_databases()?;
            if databases.is_empty() {
                log::info!("job '{}': no user databases to dump", job);
                return Ok(());
            }
            databases
        } else {
            Vec::new()
        };

        let mut child = Command::new("mysqldump")
            .args(self.dump_args(&databases))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format_err!("mysqldump not found or not executable - {}", err))?;

        let mut stdout = child.stdout.take().expect("stdout is piped");
        let mut buf = [0u8; 64 * 1024];
        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("backup cancelled");
            }
            let n = stdout.read(&mut buf).context("reading mysqldump output failed")?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }

        let status = child.wait().context("waiting for mysqldump failed")?;
        if !status.success() {
            bail!("mysqldump exited with {}", status);
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
