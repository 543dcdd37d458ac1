use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A backup run timestamp, rendered as the 14 digit UTC string
/// `YYYYMMDDhhmmss`.
///
/// The string form is both the run id and the primary sort key; string
/// ordering equals time ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupTimestamp(DateTime<Utc>);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Truncates to whole seconds, the precision of the string form.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let secs = dt.timestamp();
        BackupTimestamp(DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp in range"))
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl FromStr for BackupTimestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid backup timestamp '{}' (expected 14 digits)", s);
        }
        let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map_err(|err| format_err!("invalid backup timestamp '{}' - {}", s, err))?;
        Ok(BackupTimestamp(naive.and_utc()))
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl TryFrom<String> for BackupTimestamp {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<BackupTimestamp> for String {
    fn from(ts: BackupTimestamp) -> String {
        ts.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_roundtrip() {
        let ts: BackupTimestamp = "20250226120000".parse().unwrap();
        assert_eq!(ts.to_string(), "20250226120000");
        assert_eq!(ts.datetime(), Utc.with_ymd_and_hms(2025, 2, 26, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("2025022612000".parse::<BackupTimestamp>().is_err()); // 13 digits
        assert!("202502261200001".parse::<BackupTimestamp>().is_err()); // 15 digits
        assert!("2025022612000x".parse::<BackupTimestamp>().is_err());
        assert!("20251326120000".parse::<BackupTimestamp>().is_err()); // month 13
        assert!("".parse::<BackupTimestamp>().is_err());
    }

    #[test]
    fn test_string_order_is_time_order() {
        let a: BackupTimestamp = "20250101000000".parse().unwrap();
        let b: BackupTimestamp = "20250215000000".parse().unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }
}
