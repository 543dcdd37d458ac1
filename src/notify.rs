//! Notification hooks. The run driver reports lifecycle events through
//! the [Notifier] capability; failures there are logged but only fatal
//! when the strict flag is set.

use std::time::Duration;

use anyhow::{bail, Error};
use async_trait::async_trait;
use serde_json::json;

use vbk_api_types::{DiscordConfig, NotificationsConfig};

use crate::config::ENV_DISCORD_WEBHOOK;
use crate::hostname;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_start(&self, job: &str, backup_id: &str) -> Result<(), Error>;
    async fn notify_success(
        &self,
        job: &str,
        backup_id: &str,
        duration: Duration,
        size: u64,
    ) -> Result<(), Error>;
    async fn notify_warning(&self, job: &str, backup_id: &str, message: &str) -> Result<(), Error>;
    async fn notify_error(&self, job: &str, backup_id: &str, err: &Error) -> Result<(), Error>;
    async fn notify_prune(&self, job: &str, retained: usize, deleted: usize) -> Result<(), Error>;
    async fn notify_restore(&self, job: &str, point: &str, target: &str) -> Result<(), Error>;
}

const COLOR_START: u32 = 0x3498db;
const COLOR_SUCCESS: u32 = 0x2ecc71;
const COLOR_WARNING: u32 = 0xf1c40f;
const COLOR_ERROR: u32 = 0xe74c3c;
const COLOR_PRUNE: u32 = 0x9b59b6;
const COLOR_RESTORE: u32 = 0x1abc9c;

pub struct DiscordNotifier {
    webhook_url: String,
    events: Vec<String>,
    attempts: u32,
    backoff: Duration,
    mention_on_error: String,
    host: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    /// `None` when the notifier is disabled or has no webhook url. The
    /// `VELBACKUPER_DISCORD_WEBHOOK_URL` environment variable is an
    /// alternative url source.
    pub fn from_config(config: &DiscordConfig) -> Result<Option<Self>, Error> {
        if !config.enabled {
            return Ok(None);
        }
        let webhook_url = if !config.webhook_url.is_empty() {
            config.webhook_url.clone()
        } else {
            match std::env::var(ENV_DISCORD_WEBHOOK) {
                Ok(url) if !url.is_empty() => url,
                _ => return Ok(None),
            }
        };

        let timeout = if config.timeout_seconds > 0 {
            Duration::from_secs(config.timeout_seconds)
        } else {
            Duration::from_secs(10)
        };
        let (attempts, backoff) = match &config.retry {
            Some(retry) if retry.attempts > 1 => {
                (retry.attempts, Duration::from_millis(retry.backoff_ms))
            }
            _ => (1, Duration::ZERO),
        };

        Ok(Some(Self {
            webhook_url,
            events: config.events.clone(),
            attempts,
            backoff,
            mention_on_error: config
                .mentions
                .as_ref()
                .map(|mentions| mentions.on_error.clone())
                .unwrap_or_default(),
            host: hostname(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        }))
    }

    fn allowed(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|allowed| allowed == event)
    }

    async fn send(&self, embed: serde_json::Value, mention: &str) -> Result<(), Error> {
        let payload = json!({
            "content": mention,
            "embeds": [embed],
        });

        for attempt in 1..=self.attempts {
            let response = self.client.post(&self.webhook_url).json(&payload).send().await;
            match response {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    log::warn!("discord webhook returned {} (attempt {})", response.status(), attempt)
                }
                Err(err) => log::warn!("discord webhook failed (attempt {}): {}", attempt, err),
            }
            if !self.backoff.is_zero() && attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }
        bail!("discord webhook failed after {} attempts", self.attempts);
    }

    fn embed(&self, title: &str, color: u32, fields: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "title": title,
            "color": color,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "fields": fields,
        })
    }

    fn base_fields(&self, job: &str, backup_id: &str) -> Vec<serde_json::Value> {
        vec![
            json!({"name": "Host", "value": self.host, "inline": true}),
            json!({"name": "Job", "value": job, "inline": true}),
            json!({"name": "Backup ID", "value": if backup_id.is_empty() { "-" } else { backup_id }, "inline": true}),
        ]
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify_start(&self, job: &str, backup_id: &str) -> Result<(), Error> {
        if !self.allowed("start") {
            return Ok(());
        }
        let embed = self.embed("Backup started", COLOR_START, self.base_fields(job, backup_id));
        self.send(embed, "").await
    }

    async fn notify_success(
        &self,
        job: &str,
        backup_id: &str,
        duration: Duration,
        size: u64,
    ) -> Result<(), Error> {
        if !self.allowed("success") {
            return Ok(());
        }
        let mut fields = self.base_fields(job, backup_id);
        fields.push(json!({"name": "Duration", "value": format!("{:.1}s", duration.as_secs_f64()), "inline": true}));
        fields.push(json!({"name": "Size", "value": format!("{} bytes", size), "inline": true}));
        let embed = self.embed("Backup success", COLOR_SUCCESS, fields);
        self.send(embed, "").await
    }

    async fn notify_warning(&self, job: &str, backup_id: &str, message: &str) -> Result<(), Error> {
        if !self.allowed("warning") {
            return Ok(());
        }
        let mut embed = self.embed("Backup warning", COLOR_WARNING, self.base_fields(job, backup_id));
        embed["description"] = json!(message);
        self.send(embed, &self.mention_on_error).await
    }

    async fn notify_error(&self, job: &str, backup_id: &str, err: &Error) -> Result<(), Error> {
        if !self.allowed("error") {
            return Ok(());
        }
        let mut embed = self.embed("Backup failed", COLOR_ERROR, self.base_fields(job, backup_id));
        embed["description"] = json!(err.to_string());
        self.send(embed, &self.mention_on_error).await
    }

    async fn notify_prune(&self, job: &str, retained: usize, deleted: usize) -> Result<(), Error> {
        if !self.allowed("prune") {
            return Ok(());
        }
        let fields = vec![
            json!({"name": "Host", "value": self.host, "inline": true}),
            json!({"name": "Job", "value": job, "inline": true}),
            json!({"name": "Retained", "value": retained.to_string(), "inline": true}),
            json!({"name": "Deleted", "value": deleted.to_string(), "inline": true}),
        ];
        let embed = self.embed("Prune completed", COLOR_PRUNE, fields);
        self.send(embed, "").await
    }

    async fn notify_restore(&self, job: &str, point: &str, target: &str) -> Result<(), Error> {
        if !self.allowed("restore") {
            return Ok(());
        }
        let fields = vec![
            json!({"name": "Host", "value": self.host, "inline": true}),
            json!({"name": "Job", "value": job, "inline": true}),
            json!({"name": "Point", "value": point, "inline": true}),
            json!({"name": "Target", "value": target, "inline": false}),
        ];
        let embed = self.embed("Restore completed", COLOR_RESTORE, fields);
        self.send(embed, "").await
    }
}

/// Build the configured notifier, if any.
pub fn notifier_from_config(
    config: Option<&NotificationsConfig>,
) -> Result<Option<std::sync::Arc<dyn Notifier>>, Error> {
    let Some(config) = config else { return Ok(None) };
    let Some(discord) = &config.discord else { return Ok(None) };
    Ok(DiscordNotifier::from_config(discord)?
        .map(|notifier| std::sync::Arc::new(notifier) as std::sync::Arc<dyn Notifier>))
}
