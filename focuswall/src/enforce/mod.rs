pub mod firewall;
pub mod hosts;
pub mod packet;

use crate::command::Options;
use crate::resolver::{DomainResolver, HickoryResolver};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackendKind {
    HostsOverride,
    RuleFilter,
    PacketFilter,
}

impl BackendKind {
    /// Blocking state lives in this process's memory instead of the OS, so it
    /// disappears with the process and cannot be removed from outside.
    pub fn is_in_process(&self) -> bool {
        matches!(self, BackendKind::PacketFilter)
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::HostsOverride => write!(f, "hosts override"),
            BackendKind::RuleFilter => write!(f, "rule filter"),
            BackendKind::PacketFilter => write!(f, "packet filter"),
        }
    }
}

/// One way of making a set of domains unreachable.
///
/// Implementations log their own failures and report them as `false`;
/// nothing is propagated to the caller.
pub trait EnforcementBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Make exactly `domains` unreachable. Idempotent.
    fn apply(&mut self, domains: &BTreeSet<String>) -> bool;

    /// Undo everything this backend installed. Idempotent.
    fn remove(&mut self) -> bool;
}

/// Which backends participate in normal apply/remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFlags {
    pub hosts: bool,
    pub rule_filter: bool,
    pub packet_filter: bool,
}

impl Default for BackendFlags {
    fn default() -> Self {
        Self {
            hosts: true,
            rule_filter: true,
            packet_filter: false,
        }
    }
}

impl BackendFlags {
    pub fn from_options(options: &Options) -> Self {
        Self {
            hosts: options.enable_hosts(),
            rule_filter: options.enable_rule_filter(),
            packet_filter: options.enable_packet_filter(),
        }
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::HostsOverride => self.hosts,
            BackendKind::RuleFilter => self.rule_filter,
            BackendKind::PacketFilter => self.packet_filter,
        }
    }
}

/// How many enabled backends reported success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementOutcome {
    Full,
    Partial,
    None,
}

impl EnforcementOutcome {
    fn from_counts(succeeded: usize, attempted: usize) -> Self {
        if attempted > 0 && succeeded == attempted {
            EnforcementOutcome::Full
        } else if succeeded > 0 {
            EnforcementOutcome::Partial
        } else {
            EnforcementOutcome::None
        }
    }

    /// At least one backend took effect.
    pub fn is_success(&self) -> bool {
        !matches!(self, EnforcementOutcome::None)
    }
}

/// Drives every backend together.
pub struct Orchestrator {
    backends: Vec<Box<dyn EnforcementBackend>>,
    enabled: BackendFlags,
    flush_cache: fn() -> Result<(), anyhow::Error>,
}

impl Orchestrator {
    /// Build the orchestrator and clear whatever a previous run may have left behind,
    /// including state of backends that are currently disabled.
    pub fn new(
        backends: Vec<Box<dyn EnforcementBackend>>,
        enabled: BackendFlags,
        flush_cache: fn() -> Result<(), anyhow::Error>,
    ) -> Self {
        let mut orchestrator = Self::attach(backends, enabled, flush_cache);
        log::info!("Clearing enforcement state left by a previous run...");
        for backend in orchestrator.backends.iter_mut() {
            if !backend.remove() {
                log::warn!("Failed to clear stale {} state", backend.kind());
            }
        }
        orchestrator
    }

    /// Build the orchestrator without touching enforcement another process may own.
    pub fn attach(
        backends: Vec<Box<dyn EnforcementBackend>>,
        enabled: BackendFlags,
        flush_cache: fn() -> Result<(), anyhow::Error>,
    ) -> Self {
        Self {
            backends,
            enabled,
            flush_cache,
        }
    }

    /// Remove and drop every in-process backend. Returns how many were dropped.
    pub fn retain_persistent(&mut self) -> usize {
        let before = self.backends.len();
        self.backends.retain_mut(|backend| {
            if !backend.kind().is_in_process() {
                return true;
            }
            if !backend.remove() {
                log::warn!("Failed to clear {} state", backend.kind());
            }
            false
        });
        before - self.backends.len()
    }

    pub fn apply_with_outcome(&mut self, domains: &BTreeSet<String>) -> EnforcementOutcome {
        let mut attempted = 0;
        let mut succeeded = 0;
        for backend in self.backends.iter_mut() {
            if !self.enabled.contains(backend.kind()) {
                continue;
            }
            attempted += 1;
            if backend.apply(domains) {
                succeeded += 1;
            } else {
                log::warn!("{} failed to apply {} domain(s)", backend.kind(), domains.len());
            }
        }

        let outcome = EnforcementOutcome::from_counts(succeeded, attempted);
        match outcome {
            EnforcementOutcome::Full => log::debug!("Blocking applied by all {} backend(s)", attempted),
            EnforcementOutcome::Partial => log::warn!(
                "Blocking only partially applied ({}/{} backends)",
                succeeded,
                attempted
            ),
            EnforcementOutcome::None => log::error!("No enforcement backend could apply blocking"),
        }
        outcome
    }

    /// Apply through every enabled backend. True if any of them succeeded.
    pub fn apply(&mut self, domains: &BTreeSet<String>) -> bool {
        self.apply_with_outcome(domains).is_success()
    }

    /// Remove through every enabled backend. True if any of them succeeded.
    pub fn remove(&mut self) -> bool {
        let mut attempted = 0;
        let mut succeeded = 0;
        for backend in self.backends.iter_mut() {
            if !self.enabled.contains(backend.kind()) {
                continue;
            }
            attempted += 1;
            if backend.remove() {
                succeeded += 1;
            } else {
                log::warn!("{} failed to remove blocking", backend.kind());
            }
        }
        EnforcementOutcome::from_counts(succeeded, attempted).is_success()
    }

    /// Tear down every backend regardless of the enabled set, then flush the
    /// resolver cache. True only if every backend came back clean.
    pub fn emergency_restore(&mut self) -> bool {
        log::warn!("Emergency restore: removing all blocking");
        let mut all_clean = true;
        for backend in self.backends.iter_mut() {
            if !backend.remove() {
                log::error!("Emergency restore: {} could not be cleared", backend.kind());
                all_clean = false;
            }
        }
        if let Err(e) = (self.flush_cache)() {
            log::warn!("Failed to flush DNS cache: {}", e);
        }
        all_clean
    }
}

/// Orchestrator for the enforcing service; clears stale state on construction.
pub fn build_orchestrator(options: &Options) -> Result<Orchestrator, anyhow::Error> {
    Ok(Orchestrator::new(
        build_backends(options)?,
        BackendFlags::from_options(options),
        crate::system::flush_dns_cache,
    ))
}

/// Orchestrator for processes running next to the service (watchdog, restore);
/// leaves the service's live enforcement alone.
pub fn attach_orchestrator(options: &Options) -> Result<Orchestrator, anyhow::Error> {
    Ok(Orchestrator::attach(
        build_backends(options)?,
        BackendFlags::from_options(options),
        crate::system::flush_dns_cache,
    ))
}

/// Wire the production backends from the command line options.
fn build_backends(options: &Options) -> Result<Vec<Box<dyn EnforcementBackend>>, anyhow::Error> {
    let resolver: Arc<dyn DomainResolver> = Arc::new(
        HickoryResolver::from_system_conf(options.resolve_timeout())
            .map_err(|e| anyhow::anyhow!("Failed to create domain resolver: {}", e))?,
    );

    let backends: Vec<Box<dyn EnforcementBackend>> = vec![
        Box::new(hosts::HostsBackend::new(
            options.hosts_file(),
            crate::system::flush_dns_cache,
        )),
        Box::new(firewall::RuleFilterBackend::new(
            firewall::platform_rule_filter(),
            Arc::clone(&resolver),
        )),
        Box::new(packet::PacketFilterBackend::new(
            packet::platform_interceptor(),
            Arc::clone(&resolver),
        )),
    ];
    Ok(backends)
}
