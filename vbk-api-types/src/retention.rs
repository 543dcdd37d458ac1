use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Time based retention policy.
///
/// The effective horizon is `max(days, weeks * 7, months * 30)` days; a
/// policy whose horizon is zero or negative retains everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub weeks: i64,
    #[serde(default)]
    pub months: i64,
}

impl RetentionPolicy {
    pub fn new(days: i64, weeks: i64, months: i64) -> Self {
        Self { days, weeks, months }
    }

    /// The cutoff before which runs are expired, or `None` when the
    /// policy retains everything.
    pub fn retain_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = self.days.max(self.weeks * 7).max(self.months * 30);
        if days <= 0 {
            return None;
        }
        Some(now - Duration::days(days))
    }

    /// A run is expired iff its time strictly precedes the cutoff.
    pub fn is_expired(&self, backup_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.retain_until(now) {
            Some(cutoff) => backup_time < cutoff,
            None => false,
        }
    }
}
