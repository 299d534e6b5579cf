#[cfg(target_os = "linux")]
pub mod nfqueue;

use super::{BackendKind, EnforcementBackend};
use crate::resolver::DomainResolver;
use crate::utils::format_utils::format_ips;
use focuswall_common::{clean_domain, clean_domains, ipv4_endpoints};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAX_PACKET_LEN: usize = 65535;
// Sleep when the queue is empty
const IDLE_POLL: Duration = Duration::from_millis(10);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Traffic selected for interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficFilter {
    Ipv4Tcp,
}

/// An open interception session.
///
/// `close` may be called from another thread while the worker sits in `recv`;
/// after it returns `recv` must fail or return `None` promptly.
pub trait InterceptHandle: Send + Sync + 'static {
    /// Per-packet data needed to hand the packet back.
    type Meta: Send;

    /// Copy the next intercepted packet into `buf`. `Ok(None)` when nothing is pending.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Self::Meta)>, anyhow::Error>;

    /// Let the packet continue unchanged.
    fn reinject(&self, packet: &[u8], meta: Self::Meta) -> Result<(), anyhow::Error>;

    /// Drop the packet silently.
    fn discard(&self, _meta: Self::Meta) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn close(&self);
}

/// Platform capability for diverting packets to user space.
pub trait PacketInterceptor: Send + 'static {
    type Handle: InterceptHandle;

    fn open(&self, filter: TrafficFilter) -> Result<Self::Handle, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Reinject,
    Drop,
}

/// Drop IPv4 packets whose source or destination is blocked; pass everything else,
/// including buffers too short to carry an IPv4 header.
pub fn classify(packet: &[u8], blocked: &HashSet<IpAddr>) -> Verdict {
    match ipv4_endpoints(packet) {
        Some(ep)
            if blocked.contains(&IpAddr::V4(ep.destination))
                || blocked.contains(&IpAddr::V4(ep.source)) =>
        {
            Verdict::Drop
        }
        _ => Verdict::Reinject,
    }
}

#[derive(Debug, Default)]
struct BlockTable {
    blocked: HashSet<IpAddr>,
    domains: HashMap<String, Vec<IpAddr>>,
}

struct Shared<H> {
    table: Mutex<BlockTable>,
    handle: Mutex<Option<Arc<H>>>,
    dropped: AtomicU64,
}

impl<H> Shared<H> {
    fn table(&self) -> MutexGuard<'_, BlockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_handle(&self) -> Option<Arc<H>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A worker owns its stop flag, so a detached worker never picks up a later restart.
struct Worker {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.thread.is_finished()
    }
}

fn run_worker<H: InterceptHandle>(handle: &H, shared: &Shared<H>, stop: &AtomicBool) {
    let mut buf = vec![0u8; MAX_PACKET_LEN];

    while !stop.load(Ordering::Acquire) {
        let (len, meta) = match handle.recv(&mut buf) {
            Ok(Some(received)) => received,
            Ok(None) => {
                thread::sleep(IDLE_POLL);
                continue;
            }
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                log::warn!("Packet filter: receive failed: {:#}", e);
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        let packet = &buf[..len.min(buf.len())];
        let verdict = classify(packet, &shared.table().blocked);
        let result = match verdict {
            Verdict::Drop => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(ep) = ipv4_endpoints(packet) {
                    log::debug!("Packet filter: dropped {} -> {}", ep.source, ep.destination);
                }
                handle.discard(meta)
            }
            Verdict::Reinject => handle.reinject(packet, meta),
        };

        if let Err(e) = result {
            if !stop.load(Ordering::Acquire) {
                log::warn!("Packet filter: verdict failed: {:#}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

/// Packet-interception backend: drops IPv4 traffic to and from the resolved
/// addresses of blocked domains. The worker runs only while something is blocked.
pub struct PacketFilterBackend<I: PacketInterceptor> {
    interceptor: I,
    resolver: Arc<dyn DomainResolver>,
    shared: Arc<Shared<I::Handle>>,
    worker: Option<Worker>,
}

impl<I: PacketInterceptor> PacketFilterBackend<I> {
    pub fn new(interceptor: I, resolver: Arc<dyn DomainResolver>) -> Self {
        Self {
            interceptor,
            resolver,
            shared: Arc::new(Shared {
                table: Mutex::new(BlockTable::default()),
                handle: Mutex::new(None),
                dropped: AtomicU64::new(0),
            }),
            worker: None,
        }
    }

    pub fn is_intercepting(&self) -> bool {
        self.worker.as_ref().map(Worker::is_alive).unwrap_or(false)
    }

    pub fn blocked_ips(&self) -> HashSet<IpAddr> {
        self.shared.table().blocked.clone()
    }

    /// Resolve `domain` and add its addresses to the blocked set.
    /// True if resolution succeeded and the addresses were recorded.
    pub fn block_domain(&mut self, domain: &str) -> bool {
        let domain = clean_domain(domain);
        if domain.is_empty() {
            log::warn!("Packet filter: ignoring unusable domain entry");
            return false;
        }
        let domain = domain.as_str();

        let ips = match self.resolver.resolve(domain) {
            Ok(ips) => ips,
            Err(e) => {
                log::warn!("Packet filter: cannot block {}: {}", domain, e);
                return false;
            }
        };

        {
            let mut guard = self.shared.table();
            let table = &mut *guard;
            let known = table.domains.entry(domain.to_string()).or_default();
            for ip in &ips {
                if !known.contains(ip) {
                    known.push(*ip);
                }
                table.blocked.insert(*ip);
            }
        }
        log::debug!("Packet filter: blocked {} -> {}", domain, format_ips(&ips));

        self.start_interception();
        true
    }

    /// Forget `domain`. Addresses still used by another blocked domain stay blocked.
    /// Interception stops once nothing is blocked.
    pub fn unblock_domain(&mut self, domain: &str) -> bool {
        let domain = clean_domain(domain);
        let (found, now_empty) = {
            let mut guard = self.shared.table();
            let table = &mut *guard;
            match table.domains.remove(&domain) {
                Some(ips) => {
                    for ip in ips {
                        if !table.domains.values().any(|other| other.contains(&ip)) {
                            table.blocked.remove(&ip);
                        }
                    }
                    (true, table.blocked.is_empty())
                }
                None => (false, table.blocked.is_empty()),
            }
        };

        if now_empty {
            self.stop_interception();
        }
        found
    }

    pub fn unblock_all(&mut self) -> bool {
        {
            let mut table = self.shared.table();
            table.blocked.clear();
            table.domains.clear();
        }
        self.stop_interception();
        true
    }

    fn start_interception(&mut self) -> bool {
        if self.is_intercepting() {
            return true;
        }
        // A previous worker that already exited only needs reaping
        if self.worker.is_some() {
            self.stop_interception();
        }

        let handle = match self.interceptor.open(TrafficFilter::Ipv4Tcp) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                log::error!("Packet filter: cannot open interception: {:#}", e);
                return false;
            }
        };

        *self
            .shared
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&handle));

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let worker_stop = Arc::clone(&stop);
        let (done_tx, done_rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("packet-filter".to_string())
            .spawn(move || {
                run_worker(&*handle, &*shared, &worker_stop);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                log::info!("Packet filter: interception started");
                self.worker = Some(Worker {
                    thread,
                    done: done_rx,
                    stop,
                });
                true
            }
            Err(e) => {
                log::error!("Packet filter: failed to spawn worker: {}", e);
                if let Some(handle) = self.shared.take_handle() {
                    handle.close();
                }
                false
            }
        }
    }

    fn stop_interception(&mut self) {
        if let Some(worker) = &self.worker {
            worker.stop.store(true, Ordering::Release);
        }
        if let Some(handle) = self.shared.take_handle() {
            handle.close();
        }

        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    log::error!("Packet filter: worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Packet filter: worker did not stop within {:?}, detaching",
                    JOIN_TIMEOUT
                );
            }
        }
        log::info!(
            "Packet filter: interception stopped ({} packets dropped)",
            self.shared.dropped.swap(0, Ordering::Relaxed)
        );
    }
}

impl<I: PacketInterceptor> Drop for PacketFilterBackend<I> {
    fn drop(&mut self) {
        self.stop_interception();
    }
}

impl<I: PacketInterceptor> EnforcementBackend for PacketFilterBackend<I> {
    fn kind(&self) -> BackendKind {
        BackendKind::PacketFilter
    }

    fn apply(&mut self, domains: &BTreeSet<String>) -> bool {
        let domains = clean_domains(domains);
        if domains.is_empty() {
            return self.unblock_all();
        }

        let stale: Vec<String> = self
            .shared
            .table()
            .domains
            .keys()
            .filter(|d| !domains.contains(*d))
            .cloned()
            .collect();
        for domain in stale {
            self.unblock_domain(&domain);
        }

        let mut blocked = 0;
        for domain in &domains {
            if self.block_domain(domain) {
                blocked += 1;
            }
        }
        blocked > 0 && self.is_intercepting()
    }

    fn remove(&mut self) -> bool {
        self.unblock_all()
    }
}

/// Interceptor for platforms without a packet diversion adapter.
#[derive(Debug, Default)]
pub struct UnsupportedInterceptor;

pub enum NoHandle {}

impl InterceptHandle for NoHandle {
    type Meta = ();

    fn recv(&self, _buf: &mut [u8]) -> Result<Option<(usize, ())>, anyhow::Error> {
        match *self {}
    }

    fn reinject(&self, _packet: &[u8], _meta: ()) -> Result<(), anyhow::Error> {
        match *self {}
    }

    fn close(&self) {
        match *self {}
    }
}

impl PacketInterceptor for UnsupportedInterceptor {
    type Handle = NoHandle;

    fn open(&self, _filter: TrafficFilter) -> Result<NoHandle, anyhow::Error> {
        Err(anyhow::anyhow!(
            "packet interception is not supported on {}",
            std::env::consts::OS
        ))
    }
}

#[cfg(target_os = "linux")]
pub fn platform_interceptor() -> nfqueue::NfqueueInterceptor {
    nfqueue::NfqueueInterceptor::default()
}

#[cfg(not(target_os = "linux"))]
pub fn platform_interceptor() -> UnsupportedInterceptor {
    UnsupportedInterceptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct MemoryState {
        pending: Mutex<VecDeque<Vec<u8>>>,
        reinjected: Mutex<Vec<Vec<u8>>>,
        discarded: Mutex<Vec<Vec<u8>>>,
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_open: AtomicBool,
        stall_next_recv: Mutex<Option<Duration>>,
        recvs_after_close: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct MemoryInterceptor {
        state: Arc<MemoryState>,
    }

    struct MemoryHandle {
        state: Arc<MemoryState>,
        closed: AtomicBool,
    }

    impl InterceptHandle for MemoryHandle {
        type Meta = Vec<u8>;

        fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, Vec<u8>)>, anyhow::Error> {
            if self.closed.load(Ordering::SeqCst) {
                self.state.recvs_after_close.fetch_add(1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("handle closed"));
            }
            let stall = self.state.stall_next_recv.lock().unwrap().take();
            if let Some(stall) = stall {
                thread::sleep(stall);
            }
            let Some(packet) = self.state.pending.lock().unwrap().pop_front() else {
                return Ok(None);
            };
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(Some((packet.len(), packet)))
        }

        fn reinject(&self, packet: &[u8], _meta: Vec<u8>) -> Result<(), anyhow::Error> {
            self.state.reinjected.lock().unwrap().push(packet.to_vec());
            Ok(())
        }

        fn discard(&self, meta: Vec<u8>) -> Result<(), anyhow::Error> {
            self.state.discarded.lock().unwrap().push(meta);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PacketInterceptor for MemoryInterceptor {
        type Handle = MemoryHandle;

        fn open(&self, _filter: TrafficFilter) -> Result<MemoryHandle, anyhow::Error> {
            if self.state.fail_open.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("no driver"));
            }
            self.state.opens.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryHandle {
                state: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
            })
        }
    }

    fn tcp_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 40];
        p[0] = 0x45;
        p[9] = 6;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn backend(
        interceptor: &MemoryInterceptor,
    ) -> PacketFilterBackend<MemoryInterceptor> {
        let resolver = Arc::new(StaticResolver::new(&[
            ("example.com", &["93.184.216.34"][..]),
            ("other.org", &["10.9.9.9"][..]),
            ("a.com", &["5.5.5.5", "6.6.6.6"][..]),
            ("b.com", &["6.6.6.6"][..]),
        ]));
        PacketFilterBackend::new(interceptor.clone(), resolver)
    }

    #[test]
    fn test_classify() {
        let blocked: HashSet<IpAddr> = [IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))].into();
        assert_eq!(classify(&tcp_packet([10, 0, 0, 2], [93, 184, 216, 34]), &blocked), Verdict::Drop);
        assert_eq!(classify(&tcp_packet([93, 184, 216, 34], [10, 0, 0, 2]), &blocked), Verdict::Drop);
        assert_eq!(classify(&tcp_packet([10, 0, 0, 2], [8, 8, 8, 8]), &blocked), Verdict::Reinject);
        assert_eq!(classify(&[0x45, 0, 0], &blocked), Verdict::Reinject);
    }

    #[test]
    fn test_blocked_packets_dropped_until_unblocked() {
        let interceptor = MemoryInterceptor::default();
        let state = Arc::clone(&interceptor.state);
        let mut backend = backend(&interceptor);

        assert!(backend.block_domain("example.com"));
        assert!(backend.block_domain("other.org"));
        assert!(backend.is_intercepting());
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        let to_blocked = tcp_packet([10, 0, 0, 2], [93, 184, 216, 34]);
        state.pending.lock().unwrap().push_back(to_blocked.clone());
        assert!(wait_for(|| state.discarded.lock().unwrap().len() == 1));

        state.pending.lock().unwrap().push_back(tcp_packet([10, 0, 0, 2], [8, 8, 8, 8]));
        assert!(wait_for(|| state.reinjected.lock().unwrap().len() == 1));

        assert!(backend.unblock_domain("example.com"));
        assert!(backend.is_intercepting());
        state.pending.lock().unwrap().push_back(to_blocked.clone());
        assert!(wait_for(|| state.reinjected.lock().unwrap().len() == 2));
        assert_eq!(state.reinjected.lock().unwrap()[1], to_blocked);
        assert_eq!(state.discarded.lock().unwrap().len(), 1);

        assert!(backend.unblock_all());
        assert!(!backend.is_intercepting());
        assert!(state.closes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_worker_stops_when_last_domain_unblocked() {
        let interceptor = MemoryInterceptor::default();
        let state = Arc::clone(&interceptor.state);
        let mut backend = backend(&interceptor);

        assert!(backend.block_domain("other.org"));
        assert!(backend.unblock_domain("other.org"));
        assert!(!backend.is_intercepting());
        assert_eq!(state.closes.load(Ordering::SeqCst), 1);
        assert!(!backend.unblock_domain("other.org"));

        // restarts on demand
        assert!(backend.block_domain("other.org"));
        assert!(backend.is_intercepting());
        assert_eq!(state.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shared_address_survives_partial_unblock() {
        let interceptor = MemoryInterceptor::default();
        let mut backend = backend(&interceptor);

        backend.block_domain("a.com");
        backend.block_domain("b.com");
        backend.unblock_domain("a.com");

        let blocked = backend.blocked_ips();
        assert!(blocked.contains(&"6.6.6.6".parse::<IpAddr>().unwrap()));
        assert!(!blocked.contains(&"5.5.5.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_unresolvable_domain_records_nothing() {
        let interceptor = MemoryInterceptor::default();
        let mut backend = backend(&interceptor);
        assert!(!backend.block_domain("nowhere.invalid"));
        assert!(backend.blocked_ips().is_empty());
        assert!(!backend.is_intercepting());
    }

    #[test]
    fn test_apply_fails_when_interception_unavailable() {
        let interceptor = MemoryInterceptor::default();
        interceptor.state.fail_open.store(true, Ordering::SeqCst);
        let mut backend = backend(&interceptor);

        let domains: BTreeSet<String> = ["example.com".to_string()].into();
        assert!(!backend.apply(&domains));
        assert!(backend.remove());
    }

    #[test]
    fn test_apply_replaces_domain_set() {
        let interceptor = MemoryInterceptor::default();
        let mut backend = backend(&interceptor);

        let first: BTreeSet<String> = ["example.com".to_string(), "other.org".to_string()].into();
        assert!(backend.apply(&first));
        let second: BTreeSet<String> = ["other.org".to_string()].into();
        assert!(backend.apply(&second));

        let blocked = backend.blocked_ips();
        assert_eq!(blocked.len(), 1);
        assert!(blocked.contains(&"10.9.9.9".parse::<IpAddr>().unwrap()));
        assert!(backend.apply(&BTreeSet::new()));
        assert!(!backend.is_intercepting());
    }

    #[test]
    fn test_domains_are_cleaned_before_resolution() {
        let interceptor = MemoryInterceptor::default();
        let mut backend = backend(&interceptor);

        assert!(backend.block_domain("https://www.Example.com/path"));
        assert!(backend
            .blocked_ips()
            .contains(&"93.184.216.34".parse::<IpAddr>().unwrap()));
        assert!(backend.unblock_domain("www.example.com"));
        assert!(backend.blocked_ips().is_empty());
        assert!(!backend.block_domain("example.com other.org"));
    }

    #[test]
    fn test_detached_worker_stays_stopped_after_restart() {
        let interceptor = MemoryInterceptor::default();
        let state = Arc::clone(&interceptor.state);
        let mut backend = backend(&interceptor);

        // First worker hangs inside recv for longer than the join timeout
        *state.stall_next_recv.lock().unwrap() = Some(JOIN_TIMEOUT + Duration::from_millis(500));
        assert!(backend.block_domain("other.org"));
        thread::sleep(Duration::from_millis(50));
        assert!(backend.unblock_all());

        assert!(backend.block_domain("other.org"));
        assert!(backend.is_intercepting());
        thread::sleep(Duration::from_secs(1));

        // The stalled worker woke up after the restart and must not touch its closed handle
        assert_eq!(state.recvs_after_close.load(Ordering::SeqCst), 0);
        assert!(backend.unblock_all());
    }

    #[test]
    fn test_unsupported_interceptor_fails_to_open() {
        assert!(UnsupportedInterceptor.open(TrafficFilter::Ipv4Tcp).is_err());
    }
}
