use crate::enforce::Orchestrator;
use crate::storage::PolicyStore;
use crate::utils::shutdown_utils::Shutdown;
use chrono::{DateTime, Local};
use focuswall_common::PolicyState;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Blocking applied for this many domains; `false` if every backend failed.
    Applied(usize, bool),
    Removed,
    Idle,
}

/// Periodically re-reads the policy and drives the orchestrator towards it.
pub struct ReconciliationLoop {
    store: PolicyStore,
    orchestrator: Orchestrator,
    tick_interval: Duration,
    reload_interval: Duration,
    policy: PolicyState,
    last_reload: Option<Instant>,
    enforcing: bool,
}

impl ReconciliationLoop {
    pub fn new(
        store: PolicyStore,
        orchestrator: Orchestrator,
        tick_interval: Duration,
        reload_interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            tick_interval,
            reload_interval,
            policy: PolicyState::default(),
            last_reload: None,
            enforcing: false,
        }
    }

    fn reload_if_due(&mut self) {
        let due = self
            .last_reload
            .map(|at| at.elapsed() >= self.reload_interval)
            .unwrap_or(true);
        if due {
            self.policy = self.store.load();
            self.last_reload = Some(Instant::now());
        }
    }

    /// Persist auto-expiry and finished sessions. Re-reads the file first so a
    /// concurrent CLI edit is not overwritten with a stale copy.
    fn write_back_expiry(&mut self, now: &DateTime<Local>) {
        let expire = |p: &mut PolicyState| {
            if p.active && p.is_expired_at(now) {
                log::info!("Maximum blocking duration reached, disabling blocking");
                p.disable_blocking();
            }
            let pruned = p.prune_expired_sessions(now);
            if pruned > 0 {
                log::info!("Removed {} finished session(s)", pruned);
            }
        };

        match self.store.update(|p| {
            expire(p);
            p.clone()
        }) {
            Ok(updated) => self.policy = updated,
            Err(e) => {
                log::warn!("Failed to persist policy expiry: {:#}", e);
                expire(&mut self.policy);
            }
        }
    }

    pub fn tick(&mut self, now: DateTime<Local>) -> TickAction {
        self.reload_if_due();

        let expired = self.policy.active && self.policy.is_expired_at(&now);
        let finished_sessions = self.policy.sessions.iter().any(|s| s.is_expired_at(&now));
        if expired || finished_sessions {
            self.write_back_expiry(&now);
        }

        let domains = if self.policy.should_be_active_at(&now) {
            self.policy.effective_domains_at(&now)
        } else {
            Default::default()
        };

        if !domains.is_empty() {
            if !self.enforcing {
                log::info!("Blocking {} domain(s)", domains.len());
            }
            let ok = self.orchestrator.apply(&domains);
            self.enforcing = true;
            TickAction::Applied(domains.len(), ok)
        } else if self.enforcing {
            log::info!("Blocking no longer required, removing");
            self.orchestrator.remove();
            self.enforcing = false;
            TickAction::Removed
        } else {
            TickAction::Idle
        }
    }

    /// Tick until shutdown, then remove all blocking.
    pub fn run(&mut self, shutdown: &Shutdown) {
        log::info!(
            "Reconciliation loop started (policy: {})",
            self.store.path().display()
        );
        loop {
            self.tick(Local::now());
            if shutdown.wait_timeout(self.tick_interval) {
                break;
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        log::info!("Reconciliation loop stopping, removing blocking...");
        if !self.orchestrator.remove() {
            log::warn!("Blocking could not be fully removed on shutdown");
        }
        self.enforcing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::testing::{no_flush, Call, RecordingBackend};
    use crate::enforce::{BackendFlags, BackendKind};
    use chrono::{NaiveTime, TimeZone, Weekday};
    use focuswall_common::ScheduleItem;
    use std::sync::{Arc, Mutex};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        // 2024-01-01 was a Monday
        Local.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn setup(
        dir: &tempfile::TempDir,
    ) -> (ReconciliationLoop, PolicyStore, Arc<Mutex<Vec<Call>>>) {
        let store = PolicyStore::new(dir.path().to_str().unwrap());
        let (backend, calls) = RecordingBackend::new(BackendKind::HostsOverride, true);
        let orchestrator = Orchestrator::new(vec![Box::new(backend)], BackendFlags::default(), no_flush);
        calls.lock().unwrap().clear();
        let lp = ReconciliationLoop::new(
            store.clone(),
            orchestrator,
            Duration::from_secs(5),
            Duration::ZERO,
        );
        (lp, store, calls)
    }

    #[test]
    fn test_idle_without_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lp, _, calls) = setup(&dir);
        assert_eq!(lp.tick(at(1, 12, 0)), TickAction::Idle);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_applies_then_removes_when_schedule_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lp, store, calls) = setup(&dir);
        store
            .update(|p| {
                p.enable_blocking(at(1, 8, 0));
                p.add_site("x.com");
                p.schedule.push(ScheduleItem::new(
                    Weekday::Mon,
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                ));
            })
            .unwrap();

        assert_eq!(lp.tick(at(1, 8, 30)), TickAction::Idle);
        assert_eq!(lp.tick(at(1, 9, 0)), TickAction::Applied(1, true));
        assert_eq!(lp.tick(at(1, 12, 0)), TickAction::Applied(1, true));
        assert_eq!(lp.tick(at(1, 17, 1)), TickAction::Removed);
        assert_eq!(lp.tick(at(1, 18, 0)), TickAction::Idle);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], Call::Remove);
    }

    #[test]
    fn test_expiry_is_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lp, store, _) = setup(&dir);
        store
            .update(|p| {
                p.enable_blocking(at(1, 12, 0));
                p.max_active_secs = 5 * 60;
                p.add_site("x.com");
            })
            .unwrap();

        assert_eq!(lp.tick(at(1, 12, 5)), TickAction::Applied(1, true));
        assert_eq!(lp.tick(at(1, 12, 6)), TickAction::Removed);
        assert!(!store.load().active);
        assert!(!lp.policy.active);
    }

    #[test]
    fn test_emergency_override_removes_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lp, store, _) = setup(&dir);
        store
            .update(|p| {
                p.enable_blocking(at(1, 12, 0));
                p.add_site("x.com");
            })
            .unwrap();
        assert_eq!(lp.tick(at(1, 12, 1)), TickAction::Applied(1, true));

        store.update(|p| p.enable_emergency_mode()).unwrap();
        assert_eq!(lp.tick(at(1, 12, 2)), TickAction::Removed);
    }

    #[test]
    fn test_shutdown_removes_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lp, store, calls) = setup(&dir);
        store
            .update(|p| {
                p.enable_blocking(Local::now());
                p.add_site("x.com");
            })
            .unwrap();

        let shutdown = Shutdown::new();
        shutdown.trigger();
        lp.run(&shutdown);

        let calls = calls.lock().unwrap();
        assert!(matches!(calls.first(), Some(Call::Apply(_))));
        assert_eq!(calls.last(), Some(&Call::Remove));
    }
}
