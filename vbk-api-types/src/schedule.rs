use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePeriod {
    #[default]
    Day,
    Week,
    Month,
}

/// How often a job fires, expressed like the generated systemd timers:
/// `times` runs per period, spread over fixed slots, plus a randomized
/// delay of up to `jitter_minutes`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulePolicy {
    #[serde(default)]
    pub period: SchedulePeriod,
    #[serde(default = "default_times")]
    pub times: u32,
    #[serde(default)]
    pub jitter_minutes: i64,
}

fn default_times() -> u32 {
    1
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self { period: SchedulePeriod::Day, times: 1, jitter_minutes: 0 }
    }
}

// Fixed slots per `times` value, matching the generated OnCalendar lines.
const DAY_HOURS: [&[u32]; 5] = [&[2], &[2, 14], &[2, 10, 18], &[2, 8, 14, 20], &[2, 6, 12, 18, 22]];
const WEEK_DAYS: [&[u32]; 5] = [&[1], &[1, 4], &[1, 3, 5], &[1, 2, 4, 5], &[1, 2, 3, 4, 5]];
const MONTH_DAYS: [&[u32]; 5] = [&[1], &[1, 15], &[1, 10, 20], &[1, 8, 15, 22], &[1, 7, 14, 21, 28]];

pub(crate) fn clamp_times(times: u32) -> usize {
    times.clamp(1, 5) as usize
}

/// Next fire time strictly after `now`, plus a short human description.
pub fn next_run(policy: &SchedulePolicy, now: DateTime<Utc>) -> (DateTime<Utc>, String) {
    let idx = clamp_times(policy.times) - 1;
    let jitter = Duration::minutes(policy.jitter_minutes.max(0));

    match policy.period {
        SchedulePeriod::Week => {
            // Mon=1 .. Fri=5, all at 02:00
            let wd = now.weekday().number_from_monday();
            let mut best: Option<DateTime<Utc>> = None;
            for &d in WEEK_DAYS[idx] {
                let mut ahead = d as i64 - wd as i64;
                if ahead <= 0 {
                    ahead += 7;
                }
                let cand = at_hour(now + Duration::days(ahead), 2);
                if cand > now && best.map_or(true, |b| cand < b) {
                    best = Some(cand);
                }
            }
            let next = best.unwrap_or_else(|| at_hour(now + Duration::days(7), 2));
            (next + jitter, format!("weekly {}x", clamp_times(policy.times)))
        }
        SchedulePeriod::Month => {
            let mut best: Option<DateTime<Utc>> = None;
            for &day in MONTH_DAYS[idx] {
                for months_ahead in 0..2 {
                    if let Some(cand) = month_day(now, months_ahead, day) {
                        if cand > now && best.map_or(true, |b| cand < b) {
                            best = Some(cand);
                        }
                    }
                }
            }
            let next = best.unwrap_or_else(|| at_hour(now + Duration::days(31), 2));
            (next + jitter, format!("monthly {}x", clamp_times(policy.times)))
        }
        SchedulePeriod::Day => {
            let today = at_hour(now, 0);
            let mut best: Option<DateTime<Utc>> = None;
            for &h in DAY_HOURS[idx] {
                for days_ahead in 0..2 {
                    let cand = today + Duration::days(days_ahead) + Duration::hours(h as i64);
                    if cand > now && best.map_or(true, |b| cand < b) {
                        best = Some(cand);
                    }
                }
            }
            let next = best.expect("tomorrow's first slot is always in the future");
            (next + jitter, format!("daily {}x", clamp_times(policy.times)))
        }
    }
}

fn at_hour(dt: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), hour, 0, 0).unwrap()
}

fn month_day(now: DateTime<Utc>, months_ahead: u32, day: u32) -> Option<DateTime<Utc>> {
    let mut year = now.year();
    let mut month = now.month() + months_ahead;
    if month > 12 {
        month -= 12;
        year += 1;
    }
    Utc.with_ymd_and_hms(year, month, day, 2, 0, 0).single()
}
