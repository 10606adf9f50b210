//! Working-hours and burst-window predicates.
//!
//! Both predicates are pure: the same instant always gives the same answer.
//! Out-of-hours noise is the scheduler's business, not the pattern's.

use crate::types::WorkPatternKind;
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};

/// First and last-exclusive local hour of a regional working day.
pub const WORKDAY_START_HOUR: u32 = 9;
pub const WORKDAY_END_HOUR: u32 = 18;

/// Shift start, post-lunch and mid-afternoon.
pub const BURST_START_HOURS: [u32; 3] = [9, 13, 16];
pub const BURST_LENGTH_MINUTES: u32 = 45;

/// Regional offsets (minutes east of UTC) whose peaks make up the global pattern:
/// Tokyo, Central Europe, US East, US West.
pub const GLOBAL_REGION_OFFSETS: [i32; 4] = [540, 60, -300, -480];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkPattern {
    kind: WorkPatternKind,
    offset: FixedOffset,
}

impl WorkPattern {
    /// Build a pattern. Offsets outside ±23:59 fall back to UTC.
    pub fn new(kind: WorkPatternKind, utc_offset_minutes: i32) -> Self {
        Self {
            kind,
            offset: fixed_offset(utc_offset_minutes),
        }
    }

    pub fn kind(&self) -> WorkPatternKind {
        self.kind
    }

    pub fn is_working_hours(&self, t: DateTime<Utc>) -> bool {
        match self.kind {
            WorkPatternKind::RegionalBusinessHours => {
                let local = t.with_timezone(&self.offset);
                is_weekday(local.weekday())
                    && (WORKDAY_START_HOUR..WORKDAY_END_HOUR).contains(&local.hour())
            }
            WorkPatternKind::Global => true,
        }
    }

    pub fn is_burst_window(&self, t: DateTime<Utc>) -> bool {
        match self.kind {
            WorkPatternKind::RegionalBusinessHours => {
                let local = t.with_timezone(&self.offset);
                is_weekday(local.weekday()) && in_burst(local.hour(), local.minute())
            }
            WorkPatternKind::Global => GLOBAL_REGION_OFFSETS.iter().any(|&mins| {
                let local = t.with_timezone(&fixed_offset(mins));
                in_burst(local.hour(), local.minute())
            }),
        }
    }
}

fn fixed_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

fn is_weekday(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}

fn in_burst(hour: u32, minute: u32) -> bool {
    let minute_of_day = hour * 60 + minute;
    BURST_START_HOURS.iter().any(|&h| {
        let start = h * 60;
        (start..start + BURST_LENGTH_MINUTES).contains(&minute_of_day)
    })
}
