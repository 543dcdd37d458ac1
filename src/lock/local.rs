use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use async_trait::async_trait;

use crate::config::ENV_LOCK_DIR;

use super::{sanitize_lock_name, Locker};

pub const DEFAULT_LOCK_DIR: &str = "/var/run/velbackuper";

/// Lockfile at `<dir>/<name>.lock`, created with `O_CREAT|O_EXCL`. The
/// holder's PID is written and fsynced; on conflict a file older than
/// the TTL is evicted once and the create retried.
pub struct LocalLock {
    path: PathBuf,
    ttl: Duration,
    // also serializes acquire/release within this process
    held: Mutex<Option<File>>,
}

pub fn default_lock_dir() -> PathBuf {
    match std::env::var_os(ENV_LOCK_DIR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_LOCK_DIR),
    }
}

impl LocalLock {
    pub fn new(dir: Option<&Path>, name: &str, ttl: Duration) -> Self {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_lock_dir);
        let path = dir.join(format!("{}.lock", sanitize_lock_name(name)));
        Self { path, ttl, held: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(&self) -> std::io::Result<File> {
        OpenOptions::new().write(true).create_new(true).open(&self.path)
    }

    fn acquire_sync(&self) -> Result<(), Error> {
        let mut held = self.held.lock().unwrap();
        if held.is_some() {
            bail!("lock {:?} already held by this process", self.path);
        }

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating lock dir {:?} failed", dir))?;
        }

        let file = match self.try_create() {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.ttl.is_zero() {
                    bail!(
                        "lock file {:?} exists (another process may be running)",
                        self.path
                    );
                }
                let metadata = std::fs::metadata(&self.path).map_err(|err| {
                    format_err!("lock file {:?} exists and stat failed - {}", self.path, err)
                })?;
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok())
                    .unwrap_or_default();
                if age < self.ttl {
                    bail!("lock file {:?} exists (held by another process)", self.path);
                }
                log::warn!("evicting stale lock {:?} (age {:?})", self.path, age);
                std::fs::remove_file(&self.path)
                    .with_context(|| format!("removing stale lock {:?} failed", self.path))?;
                self.try_create().with_context(|| {
                    format!("acquire after stale eviction of {:?} failed", self.path)
                })?
            }
            Err(err) => {
                return Err(format_err!("creating lock file {:?} failed - {}", self.path, err))
            }
        };

        let mut file = file;
        if let Err(err) = file
            .write_all(format!("{}\n", std::process::id()).as_bytes())
            .and_then(|()| file.sync_all())
        {
            let _ = std::fs::remove_file(&self.path);
            return Err(format_err!("writing lock file {:?} failed - {}", self.path, err));
        }

        *held = Some(file);
        Ok(())
    }

    fn release_sync(&self) -> Result<(), Error> {
        let mut held = self.held.lock().unwrap();
        if held.take().is_none() {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(format_err!("releasing lock {:?} failed - {}", self.path, err)),
        }
    }
}

#[async_trait]
impl Locker for LocalLock {
    async fn acquire(&self) -> Result<(), Error> {
        self.acquire_sync()
    }

    async fn release(&self) -> Result<(), Error> {
        self.release_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &Path, name: &str, ttl: Duration) -> LocalLock {
        LocalLock::new(Some(dir), name, ttl)
    }

    #[test]
    fn test_acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), "job", Duration::from_secs(60));

        lock.acquire_sync().unwrap();
        assert!(lock.path().exists());
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());

        lock.release_sync().unwrap();
        assert!(!lock.path().exists());
        // release is idempotent
        lock.release_sync().unwrap();
    }

    #[test]
    fn test_conflict_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let a = lock_in(dir.path(), "job", Duration::from_secs(3600));
        let b = lock_in(dir.path(), "job", Duration::from_secs(3600));

        a.acquire_sync().unwrap();
        assert!(b.acquire_sync().is_err());
        a.release_sync().unwrap();
        b.acquire_sync().unwrap();
        b.release_sync().unwrap();
    }

    #[test]
    fn test_zero_ttl_never_evicts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.lock"), b"12345\n").unwrap();

        let lock = lock_in(dir.path(), "job", Duration::ZERO);
        assert!(lock.acquire_sync().is_err());
    }

    #[test]
    fn test_stale_lock_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.lock");
        std::fs::write(&path, b"12345\n").unwrap();

        // backdate the mtime by two hours
        let two_hours_ago = filetime::now_minus(2 * 3600);
        filetime::set_mtime(&path, two_hours_ago).unwrap();

        let lock = lock_in(dir.path(), "job", Duration::from_secs(30 * 60));
        lock.acquire_sync().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
        lock.release_sync().unwrap();
    }

    // minimal mtime helper so the eviction test needs no extra crates
    mod filetime {
        use std::path::Path;
        use std::time::{Duration, SystemTime};

        pub fn now_minus(secs: u64) -> SystemTime {
            SystemTime::now() - Duration::from_secs(secs)
        }

        pub fn set_mtime(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_modified(mtime)
        }
    }
}
