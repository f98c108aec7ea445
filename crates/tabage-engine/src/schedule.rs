//! Daily alarm scheduling in local time.

use chrono::{DateTime, Days, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tabage_core::{Error, Result};

/// A wall-clock time of day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTime {
    pub hour: u32,
    pub minute: u32,
}

impl Default for DailyTime {
    fn default() -> Self {
        Self { hour: 4, minute: 0 }
    }
}

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 {
            return Err(Error::config_invalid(format!("schedule hour {hour} is not in 0-23")));
        }
        if minute > 59 {
            return Err(Error::config_invalid(format!("schedule minute {minute} is not in 0-59")));
        }
        Ok(Self { hour, minute })
    }

    pub fn as_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or_default()
    }
}

impl std::fmt::Display for DailyTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Map a local wall-clock time onto the zone. Ambiguous times (clocks going
/// back) take the earlier instant; times inside a gap (clocks going forward)
/// move one hour later.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// The next instant strictly after `now` at which the local clock reads `at`.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, at: DailyTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    let candidate = resolve_local(&tz, today.and_time(at.as_time()));
    if candidate > *now {
        return candidate;
    }
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    resolve_local(&tz, tomorrow.and_time(at.as_time()))
}

pub fn delay_until_next<Tz: TimeZone>(now: &DateTime<Tz>, at: DailyTime) -> Duration {
    next_occurrence(now, at)
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 1, h, m, 0)
            .unwrap()
    }

    #[test]
    fn later_today_when_time_not_reached() {
        let now = at(3, 0);
        let next = next_occurrence(&now, DailyTime::default());
        assert_eq!(next, at(4, 0));
        assert_eq!(delay_until_next(&now, DailyTime::default()), Duration::from_secs(3600));
    }

    #[test]
    fn rolls_to_tomorrow_when_time_passed() {
        let now = at(5, 30);
        let next = next_occurrence(&now, DailyTime::default());
        assert_eq!(next.date_naive().to_string(), "2024-06-02");
        assert_eq!(next.time(), NaiveTime::from_hms_opt(4, 0, 0).unwrap());
        assert_eq!(
            delay_until_next(&now, DailyTime::default()),
            Duration::from_secs(22 * 3600 + 30 * 60)
        );
    }

    #[test]
    fn exact_match_schedules_tomorrow() {
        let now = at(4, 0);
        let next = next_occurrence(&now, DailyTime::default());
        assert_eq!(next.date_naive().to_string(), "2024-06-02");
    }

    #[test]
    fn custom_time() {
        let now = at(12, 0);
        let time = DailyTime::new(23, 45).unwrap();
        assert_eq!(next_occurrence(&now, time), at(23, 45));
        assert_eq!(time.to_string(), "23:45");
    }

    #[test]
    fn rejects_out_of_range_times() {
        assert!(DailyTime::new(24, 0).is_err());
        assert!(DailyTime::new(0, 60).is_err());
        assert!(DailyTime::new(23, 59).is_ok());
    }
}
