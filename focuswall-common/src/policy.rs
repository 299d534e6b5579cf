#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::domain::{clean_domain, clean_domains};
use crate::list::BlockList;
use crate::schedule::ScheduleItem;
use crate::session::BlockSession;

/// Upper bound on a single manual activation: 24 hours.
pub const DEFAULT_MAX_ACTIVE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("block list {0} does not exist")]
    UnknownList(String),
    #[error("block list {0} is a builtin preset and cannot be modified")]
    BuiltinReadOnly(String),
    #[error("session {0} does not exist")]
    UnknownSession(String),
}

/// The persisted blocking policy.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PolicyState {
    pub emergency_override: bool,
    pub active: bool,
    pub enabled_at: Option<DateTime<Local>>,
    pub max_active_secs: u64,
    pub schedule: Vec<ScheduleItem>,
    pub block_lists: Vec<BlockList>,
    pub sessions: Vec<BlockSession>,
    pub blocked_sites: Vec<String>,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            emergency_override: false,
            active: false,
            enabled_at: None,
            max_active_secs: DEFAULT_MAX_ACTIVE_SECS,
            schedule: Vec::new(),
            block_lists: Vec::new(),
            sessions: Vec::new(),
            blocked_sites: Vec::new(),
        }
    }
}

impl PolicyState {
    fn max_active_millis(&self) -> i64 {
        i64::try_from(self.max_active_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// True once the maximum activation duration has elapsed since enabling.
    /// Only meaningful while `active`; the caller flips `active` off.
    pub fn is_expired_at(&self, now: &DateTime<Local>) -> bool {
        match self.enabled_at {
            Some(enabled_at) => {
                now.signed_duration_since(enabled_at).num_milliseconds() > self.max_active_millis()
            }
            None => false,
        }
    }

    /// Whether restriction should be enforced at `now`.
    ///
    /// Emergency override wins over everything. Otherwise the policy must be
    /// active and not past its maximum duration; with no schedule that is
    /// enough, with a schedule at least one enabled item has to match.
    pub fn should_be_active_at(&self, now: &DateTime<Local>) -> bool {
        if self.emergency_override || !self.active {
            return false;
        }
        if self.is_expired_at(now) {
            return false;
        }
        if self.schedule.is_empty() {
            return true;
        }
        self.schedule.iter().any(|item| item.matches(now))
    }

    pub fn should_be_active_now(&self) -> bool {
        self.should_be_active_at(&Local::now())
    }

    /// Time left before auto-expiry, if the policy is active and has a start time.
    pub fn remaining_at(&self, now: &DateTime<Local>) -> Option<Duration> {
        if !self.active {
            return None;
        }
        let enabled_at = self.enabled_at?;
        let elapsed = now
            .signed_duration_since(enabled_at)
            .num_milliseconds()
            .max(0);
        let left = self.max_active_millis().saturating_sub(elapsed).max(0);
        Some(Duration::from_millis(left as u64))
    }

    /// Sites contributed by sessions effective at `now`.
    pub fn session_sites_at(&self, now: &DateTime<Local>) -> BTreeSet<String> {
        let mut sites = BTreeSet::new();
        for session in self.sessions.iter().filter(|s| s.is_effective_at(now)) {
            sites.extend(session.effective_sites(&self.block_lists));
        }
        sites
    }

    /// The complete cleaned set of domains to enforce at `now`.
    pub fn effective_domains_at(&self, now: &DateTime<Local>) -> BTreeSet<String> {
        let mut domains = clean_domains(&self.blocked_sites);
        domains.extend(self.session_sites_at(now));
        domains
    }

    pub fn enable_blocking(&mut self, now: DateTime<Local>) {
        self.active = true;
        self.enabled_at = Some(now);
        self.emergency_override = false;
    }

    pub fn disable_blocking(&mut self) {
        self.active = false;
    }

    pub fn enable_emergency_mode(&mut self) {
        self.emergency_override = true;
    }

    /// Add a site to the flat list. Returns false if it was empty or already present.
    pub fn add_site(&mut self, raw: &str) -> bool {
        let d = clean_domain(raw);
        if d.is_empty() || self.blocked_sites.iter().any(|s| clean_domain(s) == d) {
            return false;
        }
        self.blocked_sites.push(d);
        true
    }

    pub fn remove_site(&mut self, raw: &str) -> bool {
        let d = clean_domain(raw);
        let before = self.blocked_sites.len();
        self.blocked_sites.retain(|s| clean_domain(s) != d);
        self.blocked_sites.len() != before
    }

    pub fn find_list(&self, id: &str) -> Option<&BlockList> {
        self.block_lists.iter().find(|l| l.id == id)
    }

    pub fn add_block_list(&mut self, list: BlockList) -> String {
        let id = list.id.clone();
        self.block_lists.push(list);
        id
    }

    pub fn update_list_sites(
        &mut self,
        id: &str,
        sites: &[String],
        now: DateTime<Local>,
    ) -> Result<(), PolicyError> {
        let list = self
            .block_lists
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| PolicyError::UnknownList(id.to_string()))?;
        if list.builtin {
            return Err(PolicyError::BuiltinReadOnly(id.to_string()));
        }
        list.set_sites(sites, now);
        Ok(())
    }

    /// Delete a user list and detach it from every session.
    pub fn remove_block_list(&mut self, id: &str) -> Result<(), PolicyError> {
        let pos = self
            .block_lists
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| PolicyError::UnknownList(id.to_string()))?;
        if self.block_lists[pos].builtin {
            return Err(PolicyError::BuiltinReadOnly(id.to_string()));
        }
        self.block_lists.remove(pos);
        for session in &mut self.sessions {
            session.list_ids.retain(|l| l != id);
        }
        Ok(())
    }

    /// Seed missing builtin presets. Returns how many were added.
    pub fn ensure_builtin_lists(&mut self, now: DateTime<Local>) -> usize {
        let mut added = 0;
        for preset in BlockList::builtin_presets(now) {
            if self.find_list(&preset.id).is_none() {
                self.block_lists.push(preset);
                added += 1;
            }
        }
        added
    }

    pub fn add_session(&mut self, session: BlockSession) -> String {
        let id = session.id.clone();
        self.sessions.push(session);
        id
    }

    pub fn remove_session(&mut self, id: &str) -> Result<(), PolicyError> {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.sessions.len() == before {
            return Err(PolicyError::UnknownSession(id.to_string()));
        }
        Ok(())
    }

    /// Drop one-time sessions that are over. Returns how many were removed.
    pub fn prune_expired_sessions(&mut self, now: &DateTime<Local>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|s| !s.is_expired_at(now));
        before - self.sessions.len()
    }
}
