//! Environment diagnostics for the `doctor` command.

use std::io::Write;
use std::time::Duration;

use vbk_datastore::Store;

use crate::config::Config;
use crate::lock::{LocalLock, Locker};

pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Run all health checks; never fails, the results carry the verdicts.
pub async fn run(config: Option<&Config>) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(CheckResult {
        name: "config",
        ok: config.is_some(),
        detail: match config {
            Some(_) => "configuration loaded".to_string(),
            None => "configuration missing or invalid".to_string(),
        },
    });

    match config {
        Some(config) => {
            let (ok, detail) = check_store(config).await;
            results.push(CheckResult { name: "s3", ok, detail });
        }
        None => results.push(CheckResult {
            name: "s3",
            ok: false,
            detail: "s3 not configured".to_string(),
        }),
    }

    let (ok, detail) = check_local_lock().await;
    results.push(CheckResult { name: "local lock", ok, detail });

    let (ok, detail) = check_temp_dir();
    results.push(CheckResult { name: "disk", ok, detail });

    results
}

async fn check_store(config: &Config) -> (bool, String) {
    let store = match Store::open_s3(&config.s3) {
        Ok(store) => store,
        Err(err) => return (false, format!("s3 client init failed: {}", err)),
    };
    match tokio::time::timeout(Duration::from_secs(5), store.list("", 1)).await {
        Ok(Ok(_)) => (
            true,
            format!("s3 OK (bucket={}, prefix={})", config.s3.bucket, config.s3.prefix),
        ),
        Ok(Err(err)) => (false, format!("s3 list failed: {}", err)),
        Err(_) => (false, "s3 list timed out after 5s".to_string()),
    }
}

async fn check_local_lock() -> (bool, String) {
    let lock = LocalLock::new(None, "doctor", Duration::from_secs(60));
    if let Err(err) = lock.acquire().await {
        return (false, format!("local lock acquire failed: {}", err));
    }
    if let Err(err) = lock.release().await {
        return (false, format!("local lock release failed: {}", err));
    }
    (true, format!("local lock dir accessible ({:?})", lock.path().parent().unwrap()))
}

fn check_temp_dir() -> (bool, String) {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("velbackuper-doctor-{}", std::process::id()));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&path)?;
        file.write_all(b"test")?;
        file.sync_all()
    })();
    let _ = std::fs::remove_file(&path);
    match result {
        Ok(()) => (true, format!("temp dir writable ({:?})", dir)),
        Err(err) => (false, format!("temp dir {:?} not writable: {}", dir, err)),
    }
}
