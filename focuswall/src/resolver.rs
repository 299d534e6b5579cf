use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Name resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Lookup failed for {domain}: {reason}")]
    Lookup { domain: String, reason: String },

    #[error("Lookup for {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("No routable addresses found for {0}")]
    NoAddresses(String),

    #[error("Resolver unavailable: {0}")]
    Unavailable(String),
}

/// Turns a domain into the addresses it currently points at.
pub trait DomainResolver: Send + Sync {
    fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Drop loopback/unspecified answers and duplicates, keeping answer order.
pub fn routable_addresses<I: IntoIterator<Item = IpAddr>>(addresses: I) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .filter(|ip| seen.insert(*ip))
        .collect()
}

/// Blocking resolver over hickory on a private single-threaded runtime.
///
/// The hosts file is deliberately not consulted: it holds our own loopback
/// redirects while blocking is in effect.
pub struct HickoryResolver {
    runtime: tokio::runtime::Runtime,
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryResolver {
    pub fn from_system_conf(timeout: Duration) -> Result<Self, ResolveError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ResolveError::Unavailable(e.to_string()))?;

        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                log::warn!(
                    "Failed to read system resolver configuration, using library defaults: {}",
                    e
                );
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.use_hosts_file = false;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        opts.timeout = timeout;
        opts.attempts = 1;

        let resolver = {
            let _guard = runtime.enter();
            TokioAsyncResolver::tokio(config, opts)
        };

        Ok(Self {
            runtime,
            resolver,
            timeout,
        })
    }
}

impl DomainResolver for HickoryResolver {
    fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, self.resolver.lookup_ip(domain)).await
        });

        let answer = match lookup {
            Err(_) => return Err(ResolveError::Timeout(domain.to_string(), self.timeout)),
            Ok(Err(e)) => {
                return Err(ResolveError::Lookup {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(answer)) => answer,
        };

        let addresses = routable_addresses(answer.iter());
        if addresses.is_empty() {
            return Err(ResolveError::NoAddresses(domain.to_string()));
        }
        log::debug!("Resolved {} to {} address(es)", domain, addresses.len());
        Ok(addresses)
    }
}
