use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// External-call counters for one job.
///
/// The `today_*` counters reset when the wall-clock date changes; the
/// `total_*` counters never decrease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub total_platform_calls: u64,
    #[serde(default)]
    pub total_content_calls: u64,
    #[serde(default)]
    pub total_content_tokens: u64,
    #[serde(default)]
    pub today_platform_calls: u64,
    #[serde(default)]
    pub today_content_calls: u64,
    #[serde(default)]
    pub today_content_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl UsageCounters {
    /// Zero the daily counters if `now` falls on a new date. Returns whether a
    /// reset happened.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.day == Some(today) {
            return false;
        }
        let first = self.day.is_none();
        self.day = Some(today);
        self.today_platform_calls = 0;
        self.today_content_calls = 0;
        self.today_content_tokens = 0;
        self.last_reset_at = Some(now);
        !first
    }

    pub fn record_platform_call(&mut self, now: DateTime<Utc>) {
        self.roll_day(now);
        self.total_platform_calls += 1;
        self.today_platform_calls += 1;
    }

    pub fn record_content_call(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.roll_day(now);
        self.total_content_calls += 1;
        self.total_content_tokens += tokens;
        self.today_content_calls += 1;
        self.today_content_tokens += tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn daily_counters_reset_on_date_change() {
        let day1 = Utc.with_ymd_and_hms(2024, 3, 4, 23, 0, 0).unwrap();
        let mut u = UsageCounters::default();
        u.record_platform_call(day1);
        u.record_content_call(120, day1);
        assert_eq!(u.today_platform_calls, 1);
        assert_eq!(u.today_content_tokens, 120);

        let day2 = day1 + Duration::hours(2);
        assert!(u.roll_day(day2));
        assert_eq!(u.today_platform_calls, 0);
        assert_eq!(u.today_content_tokens, 0);
        assert_eq!(u.total_platform_calls, 1);
        assert_eq!(u.total_content_tokens, 120);
        assert_eq!(u.last_reset_at, Some(day2));
    }

    #[test]
    fn same_day_does_not_reset() {
        let t = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let mut u = UsageCounters::default();
        u.record_platform_call(t);
        assert!(!u.roll_day(t + Duration::hours(3)));
        assert_eq!(u.today_platform_calls, 1);
    }
}
