#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveTime, Weekday};

use crate::domain::clean_domain;
use crate::list::BlockList;
use crate::schedule::{time_in_window, truncate_to_second};

/// Default length of a one-time session.
pub const DEFAULT_SESSION_SECS: u64 = 2 * 60 * 60;

/// A time-bound activation of one or more block lists.
///
/// One-time sessions are effective from `start` for `duration_secs`.
/// Recurring sessions are effective on `days` between `window_start` and
/// `window_end`, both inclusive.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockSession {
    pub id: String,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub list_ids: Vec<String>,
    pub start: DateTime<Local>,
    #[cfg_attr(feature = "serde", serde(default = "default_session_secs"))]
    pub duration_secs: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub active: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub recurring: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub days: Vec<Weekday>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub window_start: Option<NaiveTime>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub window_end: Option<NaiveTime>,
}

#[cfg(feature = "serde")]
fn default_session_secs() -> u64 {
    DEFAULT_SESSION_SECS
}

impl BlockSession {
    /// An active one-time session starting at `now`.
    pub fn quick(name: &str, list_ids: Vec<String>, duration: Duration, now: DateTime<Local>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            list_ids,
            start: now,
            duration_secs: duration.as_secs(),
            active: true,
            recurring: false,
            days: Vec::new(),
            window_start: None,
            window_end: None,
        }
    }

    /// An active recurring session.
    pub fn recurring(
        name: &str,
        list_ids: Vec<String>,
        days: Vec<Weekday>,
        window_start: NaiveTime,
        window_end: NaiveTime,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            recurring: true,
            days,
            window_start: Some(window_start),
            window_end: Some(window_end),
            ..Self::quick(name, list_ids, Duration::from_secs(DEFAULT_SESSION_SECS), now)
        }
    }

    fn duration_millis(&self) -> i64 {
        i64::try_from(self.duration_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    pub fn is_effective_at(&self, now: &DateTime<Local>) -> bool {
        if !self.active {
            return false;
        }

        if self.recurring {
            let (Some(start), Some(end)) = (self.window_start, self.window_end) else {
                return false;
            };
            if !self.days.contains(&now.weekday()) {
                return false;
            }
            return time_in_window(&truncate_to_second(now), &start, &end);
        }

        let elapsed = now.signed_duration_since(self.start).num_milliseconds();
        elapsed >= 0 && elapsed <= self.duration_millis()
    }

    /// End of a one-time session. Recurring sessions have no fixed end.
    pub fn end_time(&self) -> Option<DateTime<Local>> {
        if self.recurring {
            return None;
        }
        let secs = i64::try_from(self.duration_secs).ok()?;
        let delta = chrono::TimeDelta::try_seconds(secs)?;
        self.start.checked_add_signed(delta)
    }

    /// Time left in a one-time session, zero once it is over.
    pub fn remaining_at(&self, now: &DateTime<Local>) -> Option<Duration> {
        if self.recurring {
            return None;
        }
        let elapsed = now
            .signed_duration_since(self.start)
            .num_milliseconds()
            .max(0);
        let left = self.duration_millis().saturating_sub(elapsed).max(0);
        Some(Duration::from_millis(left as u64))
    }

    /// Only one-time sessions expire.
    pub fn is_expired_at(&self, now: &DateTime<Local>) -> bool {
        if self.recurring {
            return false;
        }
        now.signed_duration_since(self.start).num_milliseconds() > self.duration_millis()
    }

    /// Union of the cleaned sites of every referenced list that exists.
    pub fn effective_sites(&self, lists: &[BlockList]) -> BTreeSet<String> {
        let mut sites = BTreeSet::new();
        for id in &self.list_ids {
            let Some(list) = lists.iter().find(|l| &l.id == id) else {
                continue;
            };
            for site in &list.sites {
                let d = clean_domain(site);
                if !d.is_empty() {
                    sites.insert(d);
                }
            }
        }
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Local> {
        // 2024-01-01 was a Monday
        Local.with_ymd_and_hms(2024, 1, d, h, m, s).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn list(id: &str, sites: &[&str]) -> BlockList {
        let mut l = BlockList::new(id, &[], at(1, 0, 0, 0));
        l.id = id.to_string();
        l.sites = sites.iter().map(|s| s.to_string()).collect();
        l
    }

    #[test]
    fn test_effective_sites_union() {
        let lists = vec![list("A", &["x.com", "y.com"]), list("B", &["y.com"])];
        let session = BlockSession::quick(
            "focus",
            vec!["A".to_string(), "B".to_string()],
            Duration::from_secs(3600),
            at(1, 9, 0, 0),
        );
        let sites = session.effective_sites(&lists);
        let expected: BTreeSet<String> = ["x.com", "y.com"].iter().map(|s| s.to_string()).collect();
        assert_eq!(sites, expected);
        // stable under repetition
        assert_eq!(session.effective_sites(&lists), expected);
    }

    #[test]
    fn test_effective_sites_ignores_missing_lists() {
        let lists = vec![list("A", &["www.x.com"])];
        let session = BlockSession::quick(
            "focus",
            vec!["gone".to_string(), "A".to_string()],
            Duration::from_secs(60),
            at(1, 9, 0, 0),
        );
        assert_eq!(session.effective_sites(&lists).len(), 1);
        assert!(session.effective_sites(&lists).contains("x.com"));
    }

    #[test]
    fn test_one_time_session_window() {
        let session = BlockSession::quick("s", vec![], Duration::from_secs(3600), at(1, 9, 0, 0));
        assert!(!session.is_effective_at(&at(1, 8, 59, 59)));
        assert!(session.is_effective_at(&at(1, 9, 0, 0)));
        assert!(session.is_effective_at(&at(1, 10, 0, 0)));
        assert!(!session.is_effective_at(&at(1, 10, 0, 1)));

        assert!(!session.is_expired_at(&at(1, 10, 0, 0)));
        assert!(session.is_expired_at(&at(1, 10, 0, 1)));
        assert_eq!(session.remaining_at(&at(1, 9, 30, 0)), Some(Duration::from_secs(1800)));
        assert_eq!(session.remaining_at(&at(1, 11, 0, 0)), Some(Duration::ZERO));
        assert_eq!(session.end_time(), Some(at(1, 10, 0, 0)));
    }

    #[test]
    fn test_inactive_session_never_effective() {
        let mut session = BlockSession::quick("s", vec![], Duration::from_secs(3600), at(1, 9, 0, 0));
        session.active = false;
        assert!(!session.is_effective_at(&at(1, 9, 30, 0)));
    }

    #[test]
    fn test_recurring_session_window() {
        let session = BlockSession::recurring(
            "work",
            vec![],
            vec![Weekday::Mon, Weekday::Wed],
            hm(9, 0),
            hm(17, 0),
            at(1, 0, 0, 0),
        );
        assert!(session.is_effective_at(&at(1, 9, 0, 0)));
        assert!(session.is_effective_at(&at(3, 17, 0, 0)));
        assert!(!session.is_effective_at(&at(2, 12, 0, 0)));
        assert!(!session.is_effective_at(&at(1, 17, 0, 1)));
        assert!(!session.is_expired_at(&at(31, 0, 0, 0)));
        assert_eq!(session.end_time(), None);
    }
}
