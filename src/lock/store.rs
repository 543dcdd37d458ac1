use std::time::Duration;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;

use vbk_datastore::{keys, Store};

use super::{sanitize_lock_name, Locker};

/// Lock record at `locks/<name>.lock` in the object store. The object's
/// body is the RFC3339 UTC time of acquisition; staleness is judged by
/// the object's last-modified time.
pub struct StoreLock {
    store: Store,
    key: String,
    ttl: Duration,
    held: Mutex<bool>,
}

impl StoreLock {
    pub fn new(store: Store, name: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: keys::lock_key(&sanitize_lock_name(name)),
            ttl,
            held: Mutex::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Locker for StoreLock {
    async fn acquire(&self) -> Result<(), Error> {
        let mut held = self.held.lock().await;
        if *held {
            bail!("lock '{}' already held by this process", self.key);
        }

        if let Some(last_modified) = self.store.head(&self.key).await? {
            if self.ttl.is_zero() {
                bail!("lock '{}' exists (another process may be running)", self.key);
            }
            let age = Utc::now().signed_duration_since(last_modified);
            if age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl.as_secs() {
                bail!("lock '{}' exists (held by another process)", self.key);
            }
            log::warn!("evicting stale lock '{}' (age {}s)", self.key, age.num_seconds());
            self.store.delete(&self.key).await?;
        }

        let body = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.store.put(&self.key, Bytes::from(body)).await?;
        *held = true;
        Ok(())
    }

    async fn release(&self) -> Result<(), Error> {
        let mut held = self.held.lock().await;
        if !*held {
            return Ok(());
        }
        self.store.delete(&self.key).await?;
        *held = false;
        Ok(())
    }
}
