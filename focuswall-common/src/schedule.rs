#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike, Weekday};

/// A weekly window during which blocking is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScheduleItem {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[cfg_attr(feature = "serde", serde(default = "enabled_by_default"))]
    pub enabled: bool,
}

#[cfg(feature = "serde")]
fn enabled_by_default() -> bool {
    true
}

impl ScheduleItem {
    pub fn new(day: Weekday, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            day,
            start,
            end,
            enabled: true,
        }
    }

    /// Both bounds are inclusive; the comparison happens at whole-second resolution.
    pub fn matches(&self, now: &DateTime<Local>) -> bool {
        if !self.enabled || now.weekday() != self.day {
            return false;
        }
        time_in_window(&truncate_to_second(now), &self.start, &self.end)
    }
}

pub(crate) fn truncate_to_second(now: &DateTime<Local>) -> NaiveTime {
    let t = now.time();
    t.with_nanosecond(0).unwrap_or(t)
}

pub(crate) fn time_in_window(tod: &NaiveTime, start: &NaiveTime, end: &NaiveTime) -> bool {
    tod >= start && tod <= end
}

/// Parse "HH:MM" or "HH:MM:SS".
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Parse a weekday by name ("mon", "Monday") or ISO number (1 = Monday .. 7 = Sunday).
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u8>() {
        return match n {
            1 => Some(Weekday::Mon),
            2 => Some(Weekday::Tue),
            3 => Some(Weekday::Wed),
            4 => Some(Weekday::Thu),
            5 => Some(Weekday::Fri),
            6 => Some(Weekday::Sat),
            7 => Some(Weekday::Sun),
            _ => None,
        };
    }
    s.parse::<Weekday>().ok()
}

/// Parse a comma separated list of weekdays, e.g. "mon,tue,fri" or "1,2,5".
pub fn parse_weekdays(s: &str) -> Option<Vec<Weekday>> {
    let mut days = Vec::new();
    for part in s.split(',') {
        let day = parse_weekday(part)?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Some(days)
}
