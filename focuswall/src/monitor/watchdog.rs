use super::supervisor::{ServiceControl, ServiceStatus};
use crate::enforce::Orchestrator;
use crate::storage::PolicyStore;
use crate::utils::shutdown_utils::Shutdown;
use chrono::{DateTime, Local};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    None,
    Started,
    Installed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogReport {
    pub service: ServiceStatus,
    pub action: ServiceAction,
    pub reapplied: bool,
}

/// Keeps the enforcing service alive and re-applies blocking on its own
/// whenever the policy says it should be in effect.
///
/// Only backends whose state lives in the OS are used: in-process blocking
/// would outlive the policy here, since only the service ever removes it.
/// Never removes blocking; on exit it simply stops.
pub struct Watchdog {
    control: Box<dyn ServiceControl>,
    store: PolicyStore,
    orchestrator: Orchestrator,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        control: Box<dyn ServiceControl>,
        store: PolicyStore,
        mut orchestrator: Orchestrator,
        interval: Duration,
    ) -> Self {
        let dropped = orchestrator.retain_persistent();
        if dropped > 0 {
            log::info!("Watchdog leaves {} in-process backend(s) to the service", dropped);
        }
        Self {
            control,
            store,
            orchestrator,
            interval,
        }
    }

    fn ensure_service(&self) -> (ServiceStatus, ServiceAction) {
        let status = self.control.status();
        let action = match status {
            ServiceStatus::Running => ServiceAction::None,
            ServiceStatus::Stopped | ServiceStatus::Unknown => {
                log::warn!("Enforcing service is {}, starting it", status);
                match self.control.start() {
                    Ok(()) => ServiceAction::Started,
                    Err(e) => {
                        log::error!("Failed to start enforcing service: {:#}", e);
                        ServiceAction::Failed
                    }
                }
            }
            ServiceStatus::NotInstalled => {
                log::warn!("Enforcing service is not installed, installing it");
                match self.control.install().and_then(|_| self.control.start()) {
                    Ok(()) => ServiceAction::Installed,
                    Err(e) => {
                        log::error!("Failed to install enforcing service: {:#}", e);
                        ServiceAction::Failed
                    }
                }
            }
        };
        (status, action)
    }

    pub fn tick(&mut self, now: DateTime<Local>) -> WatchdogReport {
        let (service, action) = self.ensure_service();

        let policy = self.store.load();
        let mut reapplied = false;
        if policy.should_be_active_at(&now) {
            let domains = policy.effective_domains_at(&now);
            if !domains.is_empty() {
                reapplied = self.orchestrator.apply(&domains);
            }
        }

        WatchdogReport {
            service,
            action,
            reapplied,
        }
    }

    pub fn run(&mut self, shutdown: &Shutdown) {
        log::info!("Watchdog started");
        loop {
            self.tick(Local::now());
            if shutdown.wait_timeout(self.interval) {
                break;
            }
        }
        log::info!("Watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::testing::{no_flush, Call, RecordingBackend};
    use crate::enforce::{BackendFlags, BackendKind};
    use std::sync::{Arc, Mutex};

    struct FakeServiceControl {
        status: Arc<Mutex<ServiceStatus>>,
        fail_start: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ServiceControl for FakeServiceControl {
        fn status(&self) -> ServiceStatus {
            *self.status.lock().unwrap()
        }

        fn start(&self) -> Result<(), anyhow::Error> {
            self.log.lock().unwrap().push("start");
            if self.fail_start {
                return Err(anyhow::anyhow!("access denied"));
            }
            *self.status.lock().unwrap() = ServiceStatus::Running;
            Ok(())
        }

        fn install(&self) -> Result<(), anyhow::Error> {
            self.log.lock().unwrap().push("install");
            *self.status.lock().unwrap() = ServiceStatus::Stopped;
            Ok(())
        }
    }

    fn watchdog(
        dir: &tempfile::TempDir,
        initial: ServiceStatus,
        fail_start: bool,
    ) -> (Watchdog, PolicyStore, Arc<Mutex<Vec<&'static str>>>, Arc<Mutex<Vec<Call>>>) {
        let store = PolicyStore::new(dir.path().to_str().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let control = FakeServiceControl {
            status: Arc::new(Mutex::new(initial)),
            fail_start,
            log: Arc::clone(&log),
        };
        let (backend, calls) = RecordingBackend::new(BackendKind::HostsOverride, true);
        let orchestrator = Orchestrator::attach(vec![Box::new(backend)], BackendFlags::default(), no_flush);
        let wd = Watchdog::new(Box::new(control), store.clone(), orchestrator, Duration::from_secs(15));
        (wd, store, log, calls)
    }

    #[test]
    fn test_running_service_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wd, _, log, calls) = watchdog(&dir, ServiceStatus::Running, false);
        let report = wd.tick(Local::now());
        assert_eq!(report.action, ServiceAction::None);
        assert!(!report.reapplied);
        assert!(log.lock().unwrap().is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stopped_service_is_started() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wd, _, log, _) = watchdog(&dir, ServiceStatus::Stopped, false);
        assert_eq!(wd.tick(Local::now()).action, ServiceAction::Started);
        assert_eq!(*log.lock().unwrap(), vec!["start"]);
        assert_eq!(wd.tick(Local::now()).action, ServiceAction::None);
    }

    #[test]
    fn test_missing_service_is_installed_and_started() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wd, _, log, _) = watchdog(&dir, ServiceStatus::NotInstalled, false);
        let report = wd.tick(Local::now());
        assert_eq!(report.service, ServiceStatus::NotInstalled);
        assert_eq!(report.action, ServiceAction::Installed);
        assert_eq!(*log.lock().unwrap(), vec!["install", "start"]);
    }

    #[test]
    fn test_start_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wd, _, _, _) = watchdog(&dir, ServiceStatus::Stopped, true);
        assert_eq!(wd.tick(Local::now()).action, ServiceAction::Failed);
    }

    #[test]
    fn test_reapplies_when_policy_active_and_never_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut wd, store, _, calls) = watchdog(&dir, ServiceStatus::Running, false);
        store
            .update(|p| {
                p.enable_blocking(Local::now());
                p.add_site("x.com");
            })
            .unwrap();

        assert!(wd.tick(Local::now()).reapplied);

        store.update(|p| p.disable_blocking()).unwrap();
        assert!(!wd.tick(Local::now()).reapplied);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        wd.run(&shutdown);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Apply(_)));
    }

    #[test]
    fn test_in_process_backend_never_blocks_from_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().to_str().unwrap());
        let (hosts, hosts_calls) = RecordingBackend::new(BackendKind::HostsOverride, true);
        let (packet, packet_calls) = RecordingBackend::new(BackendKind::PacketFilter, true);
        let flags = BackendFlags {
            hosts: true,
            rule_filter: false,
            packet_filter: true,
        };
        let orchestrator = Orchestrator::attach(vec![Box::new(hosts), Box::new(packet)], flags, no_flush);
        let control = FakeServiceControl {
            status: Arc::new(Mutex::new(ServiceStatus::Running)),
            fail_start: false,
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let mut wd = Watchdog::new(Box::new(control), store.clone(), orchestrator, Duration::from_secs(15));
        // attaching must not tear down the running service's enforcement
        assert!(hosts_calls.lock().unwrap().is_empty());

        store
            .update(|p| {
                p.enable_blocking(Local::now());
                p.add_site("example.com");
            })
            .unwrap();
        assert!(wd.tick(Local::now()).reapplied);

        store.update(|p| p.disable_blocking()).unwrap();
        assert!(!wd.tick(Local::now()).reapplied);

        assert!(packet_calls.lock().unwrap().iter().all(|c| *c == Call::Remove));
        assert_eq!(hosts_calls.lock().unwrap().len(), 1);
    }
}
