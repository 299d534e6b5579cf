pub mod iptables;
pub mod netsh;

use super::{BackendKind, EnforcementBackend};
use crate::resolver::DomainResolver;
use crate::utils::format_utils::format_ips;
use focuswall_common::{clean_domain, clean_domains};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;

/// Every rule we create carries this prefix; nothing else is ever touched.
pub const RULE_PREFIX: &str = "focuswall-";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuleDirection {
    Inbound,
    Outbound,
}

impl Display for RuleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleDirection::Inbound => write!(f, "In"),
            RuleDirection::Outbound => write!(f, "Out"),
        }
    }
}

/// A single block rule: drop traffic to (outbound) or from (inbound) `remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRule {
    pub name: String,
    pub direction: RuleDirection,
    pub remote: IpAddr,
}

/// `<prefix><domain>-In` / `<prefix><domain>-Out`
pub fn rule_name(domain: &str, direction: RuleDirection) -> String {
    format!("{}{}-{}", RULE_PREFIX, domain, direction)
}

/// Domain a rule name belongs to, if it is one of ours.
pub fn rule_domain(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(RULE_PREFIX)?;
    rest.strip_suffix("-Out")
        .or_else(|| rest.strip_suffix("-In"))
        .filter(|d| !d.is_empty())
}

/// Host firewall with named rules.
pub trait RuleFilter: Send {
    fn add_rule(&self, rule: &BlockRule) -> Result<(), anyhow::Error>;

    /// Delete every rule called `name`.
    fn remove_rule(&self, name: &str) -> Result<(), anyhow::Error>;

    /// Names of all rules carrying [`RULE_PREFIX`], without duplicates.
    fn rule_names(&self) -> Result<Vec<String>, anyhow::Error>;
}

pub fn platform_rule_filter() -> Box<dyn RuleFilter> {
    if cfg!(windows) {
        Box::new(netsh::NetshRuleFilter)
    } else {
        Box::new(iptables::IptablesRuleFilter)
    }
}

/// Rule-based backend: resolves each domain and installs a block rule pair per address.
pub struct RuleFilterBackend {
    filter: Box<dyn RuleFilter>,
    resolver: Arc<dyn DomainResolver>,
}

impl RuleFilterBackend {
    pub fn new(filter: Box<dyn RuleFilter>, resolver: Arc<dyn DomainResolver>) -> Self {
        Self { filter, resolver }
    }

    fn owned_rule_names(&self) -> Result<Vec<String>, anyhow::Error> {
        Ok(self
            .filter
            .rule_names()?
            .into_iter()
            .filter(|n| n.starts_with(RULE_PREFIX))
            .collect())
    }

    /// Replace the rules for `domain` with fresh ones for its current addresses.
    /// True if rules were created for at least one address.
    pub fn block_domain(&self, domain: &str) -> bool {
        let domain = clean_domain(domain);
        if domain.is_empty() {
            log::warn!("Rule filter: ignoring unusable domain entry");
            return false;
        }
        let domain = domain.as_str();

        let ips = match self.resolver.resolve(domain) {
            Ok(ips) => ips,
            Err(e) => {
                log::warn!("Rule filter: cannot block {}: {}", domain, e);
                return false;
            }
        };

        self.unblock_domain(domain);

        let mut created = 0;
        for ip in &ips {
            let pair = [RuleDirection::Outbound, RuleDirection::Inbound].map(|direction| BlockRule {
                name: rule_name(domain, direction),
                direction,
                remote: *ip,
            });
            match pair.iter().try_for_each(|rule| self.filter.add_rule(rule)) {
                Ok(()) => created += 1,
                Err(e) => log::warn!("Rule filter: failed to add rule for {} ({}): {:#}", domain, ip, e),
            }
        }

        if created > 0 {
            log::debug!("Rule filter: blocked {} -> {}", domain, format_ips(&ips));
        }
        created > 0
    }

    /// Delete the rules of exactly this domain. True if all of them were deleted.
    pub fn unblock_domain(&self, domain: &str) -> bool {
        let domain = clean_domain(domain);
        if domain.is_empty() {
            return true;
        }
        let domain = domain.as_str();

        let names = match self.owned_rule_names() {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Rule filter: cannot list rules: {:#}", e);
                return false;
            }
        };
        self.remove_names(names.iter().filter(|n| rule_domain(n) == Some(domain)))
    }

    /// Delete every rule we own. True if all of them were deleted.
    pub fn remove_all(&self) -> bool {
        match self.owned_rule_names() {
            Ok(names) => self.remove_names(names.iter()),
            Err(e) => {
                log::warn!("Rule filter: cannot list rules: {:#}", e);
                false
            }
        }
    }

    fn remove_names<'a>(&self, names: impl Iterator<Item = &'a String>) -> bool {
        let mut all_removed = true;
        for name in names {
            if let Err(e) = self.filter.remove_rule(name) {
                log::warn!("Rule filter: failed to remove {}: {:#}", name, e);
                all_removed = false;
            }
        }
        all_removed
    }
}

impl EnforcementBackend for RuleFilterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RuleFilter
    }

    fn apply(&mut self, domains: &BTreeSet<String>) -> bool {
        let domains = clean_domains(domains);
        if domains.is_empty() {
            return self.remove_all();
        }

        // Drop rules of domains that left the set
        match self.owned_rule_names() {
            Ok(names) => {
                let stale: BTreeSet<&str> = names
                    .iter()
                    .filter_map(|n| rule_domain(n))
                    .filter(|d| !domains.contains(*d))
                    .collect();
                for domain in stale {
                    self.unblock_domain(domain);
                }
            }
            Err(e) => log::warn!("Rule filter: cannot list rules: {:#}", e),
        }

        let mut blocked = 0;
        for domain in &domains {
            if self.block_domain(domain) {
                blocked += 1;
            }
        }
        if blocked < domains.len() {
            log::warn!("Rule filter: {}/{} domain(s) blocked", blocked, domains.len());
        }
        blocked > 0
    }

    fn remove(&mut self) -> bool {
        self.remove_all()
    }
}
