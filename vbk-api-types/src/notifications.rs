use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
    /// Treat notifier failures as run failures.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscordRetry {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscordMentions {
    /// Mention string (for example `<@&role>`) prepended on errors.
    #[serde(default)]
    pub on_error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    /// Allowed event names; empty means all events.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<DiscordRetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<DiscordMentions>,
}
